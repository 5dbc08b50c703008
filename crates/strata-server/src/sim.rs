//! Headless world: the authority plus a handful of bot clients talking over
//! the loopback transport.

use std::sync::Arc;
use std::time::Duration;

use glam::{Quat, Vec3};
use rustc_hash::FxHashMap;
use strata_config::Config;
use strata_replication::hitreg::{HitRegistration, WeaponProfile};
use strata_replication::projectile::{ProjectileId, sweep_targets};
use strata_replication::transport::SceneObjectDescriptor;
use strata_replication::*;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const AVATAR: &str = "avatar";
pub const CRATE: &str = "crate";

// Avatar element indices.
pub const HP: u8 = 0;
pub const KILLS: u8 = 1;
pub const BUFFS: u8 = 0;
pub const ATTACK: u8 = 0;

const MAX_HP: f32 = 100.0;
const ORBIT_RADIUS: f32 = 8.0;
const ATTACK_EVERY_TICKS: u64 = 45;
// Clients need a tick to receive their avatars before they can call on them.
const FIRST_ATTACK_TICK: u64 = 5;

/// Counters reported when the run ends.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RunSummary {
    pub ticks: u64,
    pub records_sent: usize,
    pub records_applied: usize,
    pub fields_changed: usize,
    pub bytes_sent: u64,
    pub attacks: u32,
    pub projectiles: u32,
    pub hits_claimed: u32,
    pub hits_accepted: u32,
}

struct Bot {
    connection: ConnectionId,
    avatar: ObjectId,
    client: ReplicationContext,
}

pub fn avatar_template() -> ObjectTemplate {
    ObjectTemplate::new(AVATAR)
        .with_behaviour(
            BehaviourDef::new("vitals")
                .field("hp", &MAX_HP, SyncBehaviour::Default, SyncMode::ServerToClients)
                .field("kills", &0u32, SyncBehaviour::Default, SyncMode::ServerToOwner)
                .list("buffs", SyncMode::ServerToClients),
        )
        .with_behaviour(BehaviourDef::new("combat").function("attack", true))
        .with_hitbox(Hitbox {
            center: Vec3::new(0.0, 0.9, 0.0),
            half_extents: Vec3::new(0.4, 0.9, 0.4),
        })
}

pub fn crate_template() -> ObjectTemplate {
    ObjectTemplate::new(CRATE).with_hitbox(Hitbox::cube(0.5))
}

/// Four crates around the arena, placed by the scene rather than spawned.
pub fn demo_scene() -> StaticScene {
    let objects = (0..4)
        .map(|i| {
            let angle = i as f32 * std::f32::consts::FRAC_PI_2;
            SceneObjectDescriptor {
                scene_path: format!("arena/crates/crate_{i}"),
                asset_id: CRATE.to_string(),
                object_id: None,
                position: Vec3::new(angle.cos(), 0.0, angle.sin()) * 30.0,
                rotation: Quat::IDENTITY,
            }
        })
        .collect();
    StaticScene { objects }
}

fn bow() -> HitRegistration {
    HitRegistration {
        trigger_durations: vec![0.2, 0.3],
        fire_spread: 1,
        weapon: WeaponProfile {
            reference: "shortbow".to_string(),
            range: 40.0,
            projectile_speed: 40.0,
            explode_radius: 0.0,
            detection_radius: 0.3,
        },
        damage_pool: 12.0,
    }
}

/// The authority, its bots and the shared clock they all read.
pub struct Simulation {
    clock: Arc<ManualClock>,
    server: ReplicationContext,
    bots: Vec<Bot>,
    social: SocialRegistry,
    actions: ActionController,
    action_events: mpsc::UnboundedReceiver<ActionEvent>,
    projectiles: ProjectilePool,
    in_flight: FxHashMap<ProjectileId, ProjectileParams>,
    seed: i32,
    tick_ms: i64,
    summary: RunSummary,
}

impl Simulation {
    /// Builds the world: templates, scene, `bots` connected players and a
    /// party formed among the first two.
    pub fn new(config: &Config, bots: u64, tick_ms: i64, runtime: Handle) -> Self {
        let clock = Arc::new(ManualClock::new(0));
        let mut server = ReplicationContext::new(LocalRole::server(), config, clock.clone());
        for template in [avatar_template(), crate_template()] {
            if let Err(error) = server.register_template(template) {
                warn!(%error, "template rejected");
            }
        }
        let placed = server.load_scene(&demo_scene());
        info!(placed, "scene loaded");

        let mut players = Vec::new();
        for i in 0..bots {
            let connection = ConnectionId(i + 1);
            server.add_connection(connection);
            server.set_connection_ready(connection, true);
            let request = SpawnRequest::new(AVATAR).owned_by(OwnerId::from_connection(connection));
            let Some(avatar) = server.spawn(request) else {
                warn!(%connection, "avatar spawn failed");
                continue;
            };
            let mut client = ReplicationContext::new(LocalRole::client(connection), config, clock.clone());
            for template in [avatar_template(), crate_template()] {
                let _ = client.register_template(template);
            }
            players.push(Bot {
                connection,
                avatar,
                client,
            });
        }

        let social = SocialRegistry::new(config.social.clone(), runtime);
        if let [leader, member, ..] = players.as_slice() {
            let formed = social
                .create(GroupKind::Party, leader.connection)
                .and_then(|_| social.invite(GroupKind::Party, leader.connection, member.connection))
                .and_then(|_| social.accept(GroupKind::Party, member.connection));
            if let Err(error) = formed {
                warn!(%error, "party setup failed");
            }
        }

        let (tx, action_events) = mpsc::unbounded_channel();
        Self {
            clock,
            server,
            bots: players,
            social,
            actions: ActionController::new(tx),
            action_events,
            projectiles: ProjectilePool::new(),
            in_flight: FxHashMap::default(),
            seed: 0,
            tick_ms,
            summary: RunSummary::default(),
        }
    }

    /// The authoritative context.
    pub fn server(&self) -> &ReplicationContext {
        &self.server
    }

    /// Client replica of bot `index`.
    pub fn client(&self, index: usize) -> Option<&ReplicationContext> {
        self.bots.get(index).map(|b| &b.client)
    }

    /// Party and guild registries.
    pub fn social(&self) -> &SocialRegistry {
        &self.social
    }

    /// Counters so far.
    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    /// Advances the world by one tick.
    pub async fn tick(&mut self) {
        self.clock.advance(self.tick_ms);
        let tick = self.summary.ticks;
        self.summary.ticks += 1;

        self.move_avatars(tick);
        if tick % ATTACK_EVERY_TICKS == FIRST_ATTACK_TICK {
            self.begin_attack().await;
        }
        self.drain_actions();
        self.step_projectiles();

        let mut transport = LoopbackTransport::new();
        for bot in &mut self.bots {
            self.summary.records_sent += bot.client.flush_tick(&mut transport);
            for bytes in transport.drain_for(SERVER_PEER) {
                self.summary.records_applied += self.server.receive(bot.connection, &bytes);
            }
        }
        self.handle_server_events();

        self.server.update_interest();
        self.server.expire_hit_records();
        self.summary.fields_changed += self
            .server
            .registry()
            .iter()
            .map(|object| object.elements().dirty_fields().len())
            .sum::<usize>();
        self.summary.records_sent += self.server.flush_tick(&mut transport);
        for bot in &mut self.bots {
            for bytes in transport.drain_for(bot.connection) {
                self.summary.records_applied += bot.client.receive(SERVER_PEER, &bytes);
            }
            bot.client.drain_events();
        }
        self.summary.bytes_sent += transport.bytes_sent();
    }

    fn move_avatars(&mut self, tick: u64) {
        let count = self.bots.len().max(1) as f32;
        let phase = tick as f32 * self.tick_ms as f32 / 4_000.0;
        for (i, bot) in self.bots.iter().enumerate() {
            let angle = phase + i as f32 * std::f32::consts::TAU / count;
            if let Some(avatar) = self.server.object_mut(bot.avatar) {
                avatar.position = Vec3::new(angle.cos(), 0.0, angle.sin()) * ORBIT_RADIUS;
            }
        }
    }

    /// The first bot asks the authority to register an attack, then plays it.
    async fn begin_attack(&mut self) {
        let Some(attacker) = self.bots.first_mut() else {
            return;
        };
        self.seed += 1;
        let avatar = attacker.avatar;
        if !attacker
            .client
            .call_function(avatar, ATTACK, CallTarget::Server, &self.seed, false)
        {
            return;
        }
        match self.actions.start(ActionPlan::attack(&bow(), Duration::from_secs(1))).await {
            Ok(id) => {
                self.summary.attacks += 1;
                debug!(id, seed = self.seed, "attack started");
            }
            Err(error) => debug!(%error, "attack not started"),
        }
    }

    /// Each trigger fires one arrow at the next bot's avatar.
    fn drain_actions(&mut self) {
        while let Ok(event) = self.action_events.try_recv() {
            let ActionEvent::Trigger { trigger_index, .. } = event else {
                continue;
            };
            let (Some(shooter), Some(victim)) = (self.bots.first(), self.bots.get(1)) else {
                continue;
            };
            let (Some(from), Some(to)) = (self.server.object(shooter.avatar), self.server.object(victim.avatar)) else {
                continue;
            };
            let origin = from.position + Vec3::Y;
            let aim = to.position + Vec3::new(0.0, 0.9, 0.0);
            let weapon = bow().weapon;
            let params = ProjectileParams {
                attacker: shooter.avatar,
                simulate_seed: self.seed,
                trigger_index,
                spread_index: 0,
                origin,
                direction: (aim - origin).normalize_or_zero(),
                speed: weapon.projectile_speed,
                lifetime_ms: (weapon.range / weapon.projectile_speed * 1000.0) as i64,
                detection_radius: weapon.detection_radius,
                explode_radius: weapon.explode_radius,
                locked_target: None,
                destination: Some(aim),
                launch_timestamp: self.clock.now_ms(),
            };
            let id = self.projectiles.launch(params.clone());
            self.in_flight.insert(id, params);
            self.summary.projectiles += 1;
        }
    }

    fn step_projectiles(&mut self) {
        let targets = sweep_targets(self.server.registry());
        let now = self.clock.now_ms();
        for event in self.projectiles.tick(self.tick_ms, &targets) {
            match event {
                ProjectileEvent::Hit {
                    projectile,
                    target,
                    hitbox_index,
                    ..
                } => {
                    let Some(params) = self.in_flight.remove(&projectile) else {
                        continue;
                    };
                    if let Some(shooter) = self.bots.first_mut() {
                        shooter.client.send_hit_claim(params.hit_claim(target, hitbox_index, now));
                        self.summary.hits_claimed += 1;
                    }
                }
                ProjectileEvent::Expired { projectile } => {
                    self.in_flight.remove(&projectile);
                }
                ProjectileEvent::Exploded { .. } => {}
            }
        }
    }

    fn handle_server_events(&mut self) {
        for event in self.server.drain_events() {
            match event {
                ReplicationEvent::FunctionCalled(call) if call.element_index == ATTACK => {
                    let Some(seed) = call.args::<i32>() else {
                        continue;
                    };
                    self.server.prepare_hit_reg_validation(call.object_id, seed, bow());
                    for trigger in 0..bow().trigger_durations.len() as u8 {
                        self.server.confirm_hit_reg_validation(call.object_id, seed, trigger, 0.0);
                    }
                }
                ReplicationEvent::HitAccepted(hit) => {
                    self.summary.hits_accepted += 1;
                    let hp: f32 = self.server.field(hit.target, HP).unwrap_or(MAX_HP);
                    let remaining = (hp - hit.damage).max(0.0);
                    self.server.set_field(hit.target, HP, &remaining);
                    if remaining <= 0.0 {
                        let kills: u32 = self.server.field(hit.attacker, KILLS).unwrap_or(0);
                        self.server.set_field(hit.attacker, KILLS, &(kills + 1));
                        self.server.set_field(hit.target, HP, &MAX_HP);
                        self.server.list_add(hit.target, BUFFS, &"respawn_shield".to_string());
                    }
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_bots_see_every_avatar() {
        let mut sim = Simulation::new(&Config::default(), 3, 33, Handle::current());
        for _ in 0..10 {
            sim.tick().await;
        }

        let avatars: Vec<ObjectId> = sim
            .server()
            .registry()
            .iter()
            .filter(|o| o.asset_id() == AVATAR)
            .map(|o| o.object_id())
            .collect();
        assert_eq!(avatars.len(), 3);
        for index in 0..3 {
            let client = sim.client(index).unwrap();
            for avatar in &avatars {
                assert!(client.object(*avatar).is_some(), "bot {index} is missing {avatar}");
            }
        }
        assert_eq!(sim.summary().ticks, 10);
        assert_eq!(sim.summary().attacks, 1);
        assert!(sim.summary().records_applied > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_party_formed_at_startup() {
        let sim = Simulation::new(&Config::default(), 2, 33, Handle::current());
        let party = sim.social().group_of(GroupKind::Party, ConnectionId(1)).unwrap();
        let group = sim.social().group(GroupKind::Party, party).unwrap();
        assert_eq!(group.members, vec![ConnectionId(1), ConnectionId(2)]);
    }

    #[test]
    fn test_demo_scene_places_crates() {
        let scene = demo_scene();
        assert_eq!(scene.objects.len(), 4);
        assert!(scene.objects.iter().all(|o| o.asset_id == CRATE));
    }
}
