//! Headless Strata server.
//!
//! Configuration is loaded from `strata.ron` and can be overridden via CLI flags.
//! Run with `cargo run -p strata-server -- --ticks 600` to simulate twenty
//! seconds of bot traffic at the default tick rate.

mod schedule;
mod sim;

use clap::Parser;
use strata_config::{CliArgs, Config, default_config_dir};
use strata_replication::GroupKind;
use tokio::runtime::Handle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::info;

use crate::schedule::TickSchedule;
use crate::sim::Simulation;

const BOTS: u64 = 4;

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();

    let config_dir = args.config.clone().unwrap_or_else(default_config_dir);
    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args);

    let log_dir = config_dir.join("logs");
    strata_log::init_logging(
        Some(&log_dir),
        cfg!(debug_assertions) || config.debug.file_logging,
        Some(&config),
    );
    info!(
        bind = %config.server.bind_address,
        port = config.server.port,
        tick_rate = config.server.tick_rate,
        interest = ?config.interest.mode,
        "strata server starting"
    );

    let mut schedule = TickSchedule::with_tick_rate(config.server.tick_rate);
    let mut sim = Simulation::new(&config, BOTS, schedule.tick_ms(), Handle::current());

    let mut interval = tokio::time::interval(std::time::Duration::from_secs_f64(schedule.tick_duration_secs()));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last = Instant::now();
    while schedule.total_ticks() < args.ticks {
        interval.tick().await;
        let now = Instant::now();
        let due = schedule.accumulate(now.duration_since(last).as_secs_f64());
        last = now;
        for _ in 0..due {
            sim.tick().await;
        }
    }

    let summary = sim.summary();
    let party_size = sim
        .social()
        .group_of(GroupKind::Party, strata_replication::ConnectionId(1))
        .and_then(|id| sim.social().group(GroupKind::Party, id))
        .map_or(0, |g| g.members.len());
    info!(
        ticks = summary.ticks,
        objects = sim.server().registry().len(),
        connections = sim.server().connection_ids().len(),
        records_sent = summary.records_sent,
        records_applied = summary.records_applied,
        fields_changed = summary.fields_changed,
        bytes_sent = summary.bytes_sent,
        attacks = summary.attacks,
        projectiles = summary.projectiles,
        hits_claimed = summary.hits_claimed,
        hits_accepted = summary.hits_accepted,
        party_size,
        "run complete"
    );
}
