//! Command-line argument parsing for the Strata server.

use std::path::PathBuf;

use clap::Parser;

use crate::{Config, InterestMode};

/// Strata server command-line arguments.
///
/// CLI values override settings loaded from `strata.ron`.
#[derive(Parser, Debug)]
#[command(name = "strata-server", about = "Strata authoritative replication server")]
pub struct CliArgs {
    /// Bind address.
    #[arg(long)]
    pub bind: Option<String>,

    /// Server port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Simulation tick rate (Hz).
    #[arg(long)]
    pub tick_rate: Option<u32>,

    /// Use global interest instead of proximity interest.
    #[arg(long)]
    pub global_interest: bool,

    /// Proximity visible range in meters.
    #[arg(long)]
    pub visible_range: Option<f32>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Number of ticks to simulate before exiting (headless runs).
    #[arg(long, default_value_t = 300)]
    pub ticks: u64,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref bind) = args.bind {
            self.server.bind_address = bind.clone();
        }
        if let Some(port) = args.port {
            self.server.port = port;
        }
        if let Some(rate) = args.tick_rate {
            self.server.tick_rate = rate;
        }
        if args.global_interest {
            self.interest.mode = InterestMode::Global;
        }
        if let Some(range) = args.visible_range {
            self.interest.visible_range = range;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}
