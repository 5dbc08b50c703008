//! Hit registration and lag-compensated validation.
//!
//! The authority records an attack's declared parameters when it begins
//! ([`ReplicationContext::prepare_hit_reg_validation`]) and later judges the
//! client's hit claims against them. A claim only passes when the distance it
//! implies fits the weapon's reach and the time it implies fits the weapon's
//! projectile speed, within a small tolerance for network jitter. Rejections
//! are never reported back to the claimant.

use glam::Vec3;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use strata_config::ValidationConfig;
use tracing::{debug, trace};

use crate::context::ReplicationContext;
use crate::dispatch::ReplicationEvent;
use crate::error::{DispatchError, ResolveError};
use crate::identity::ObjectId;
use crate::messages::HitClaim;
use crate::ownership::ConnectionId;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Declared physical parameters of the weapon or skill behind an attack.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeaponProfile {
    /// Weapon or skill identifier.
    pub reference: String,
    /// Maximum travel distance in meters.
    pub range: f32,
    /// Projectile speed in meters per second. `0` disables the speed bound
    /// (hitscan).
    pub projectile_speed: f32,
    /// Area damage radius; `0` for single-target projectiles.
    pub explode_radius: f32,
    /// Sweep radius of the projectile.
    pub detection_radius: f32,
}

/// Everything captured when an attack begins.
#[derive(Debug, Clone, PartialEq)]
pub struct HitRegistration {
    /// Delay in seconds before each trigger fires; one entry per trigger.
    pub trigger_durations: Vec<f32>,
    /// Projectiles per trigger.
    pub fire_spread: u8,
    /// Weapon or skill in use.
    pub weapon: WeaponProfile,
    /// Damage shared by every projectile of the attack.
    pub damage_pool: f32,
}

/// Lifecycle of one attack attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitRecordState {
    /// Recorded, no trigger reported yet.
    Prepared,
    /// At least one trigger has been confirmed.
    Confirmed,
    /// Superseded or too old; claims are rejected.
    Expired,
}

/// The authority's pre-committed record of one attack.
#[derive(Debug, Clone, PartialEq)]
pub struct HitRegistrationRecord {
    attacker: ObjectId,
    simulate_seed: i32,
    launch_timestamp: i64,
    state: HitRecordState,
    registration: HitRegistration,
    resolved_triggers: FxHashSet<u8>,
    consumed: FxHashSet<(u8, u8, ObjectId)>,
}

impl HitRegistrationRecord {
    /// Attacking object.
    pub fn attacker(&self) -> ObjectId {
        self.attacker
    }

    /// Seed of the attack attempt.
    pub fn simulate_seed(&self) -> i32 {
        self.simulate_seed
    }

    /// Authoritative time the attack began.
    pub fn launch_timestamp(&self) -> i64 {
        self.launch_timestamp
    }

    /// Current state.
    pub fn state(&self) -> HitRecordState {
        self.state
    }

    /// Declared parameters.
    pub fn registration(&self) -> &HitRegistration {
        &self.registration
    }

    /// Pending damage pool, including confirmed extra damage.
    pub fn damage_pool(&self) -> f32 {
        self.registration.damage_pool
    }

    /// Whether trigger `index` has been confirmed.
    pub fn is_trigger_resolved(&self, index: u8) -> bool {
        self.resolved_triggers.contains(&index)
    }

    fn trigger_count(&self) -> usize {
        self.registration.trigger_durations.len().max(1)
    }

    fn spread_count(&self) -> u8 {
        self.registration.fire_spread.max(1)
    }
}

/// A hit claim that passed every bound.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedHit {
    /// Attacking object.
    pub attacker: ObjectId,
    /// Object that was hit.
    pub target: ObjectId,
    /// Hitbox of the target.
    pub hitbox_index: u8,
    /// Seed of the attack attempt.
    pub simulate_seed: i32,
    /// Trigger within the attack.
    pub trigger_index: u8,
    /// Projectile within the trigger.
    pub spread_index: u8,
    /// Damage to apply: the pool split across the spread.
    pub damage: f32,
    /// Point the authority considers hit.
    pub hit_point: Vec3,
}

/// Why a hit claim was rejected. Only ever logged.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HitRejection {
    /// The claim names a different attacker than the one validating it.
    #[error("claim attacker {claimed} does not match {attacker}")]
    AttackerMismatch {
        /// Attacker the validation runs for.
        attacker: ObjectId,
        /// Attacker named by the claim.
        claimed: ObjectId,
    },
    /// No record for this attacker and seed.
    #[error("no hit registration for {attacker} seed {seed}")]
    NoRecord {
        /// Attacking object.
        attacker: ObjectId,
        /// Claimed seed.
        seed: i32,
    },
    /// The record expired.
    #[error("hit registration expired")]
    Expired,
    /// The target is not a live object.
    #[error("unknown target {0}")]
    UnknownTarget(ObjectId),
    /// The target has no such hitbox.
    #[error("target {target} has no hitbox {index}")]
    UnknownHitbox {
        /// Object that was hit.
        target: ObjectId,
        /// Claimed hitbox.
        index: u8,
    },
    /// Trigger or spread index past what the attack declared.
    #[error("trigger {trigger} / spread {spread} not declared by the attack")]
    UndeclaredProjectile {
        /// Claimed trigger.
        trigger: u8,
        /// Claimed spread.
        spread: u8,
    },
    /// The same projectile already hit this target.
    #[error("projectile already hit {0}")]
    AlreadyHit(ObjectId),
    /// The hit lies beyond the weapon's reach.
    #[error("distance {distance:.2} exceeds reach {limit:.2}")]
    OutOfRange {
        /// Distance the claim implies.
        distance: f32,
        /// Allowed reach.
        limit: f32,
    },
    /// The hit lies outside the explosion around the claimed destination.
    #[error("hit is {distance:.2} from the detonation, radius {limit:.2}")]
    OutsideExplosion {
        /// Distance between hit point and destination.
        distance: f32,
        /// Allowed radius.
        limit: f32,
    },
    /// Hit time not after launch time.
    #[error("non-positive flight time {0} ms")]
    NonPositiveInterval(i64),
    /// The projectile would have travelled faster than declared.
    #[error("implied speed is {ratio:.3}x declared (tolerance {tolerance})")]
    TooFast {
        /// Implied over declared speed.
        ratio: f64,
        /// Allowed ratio.
        tolerance: f64,
    },
}

// ---------------------------------------------------------------------------
// Projectile bounds
// ---------------------------------------------------------------------------

/// Geometry and timing of one claimed projectile hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectileCheck {
    /// Where the projectile started.
    pub origin: Vec3,
    /// Launch direction.
    pub direction: Vec3,
    /// Declared aim destination.
    pub destination: Option<Vec3>,
    /// Point considered hit.
    pub hit_point: Vec3,
    /// Largest half extent of the hit volume.
    pub hitbox_extent: f32,
    /// Launch time (ms).
    pub launch_timestamp: i64,
    /// Hit time (ms).
    pub hit_timestamp: i64,
}

/// Applies the spatial, explosion and speed bounds. Returns the distance
/// the projectile is taken to have travelled.
pub fn validate_projectile(
    weapon: &WeaponProfile,
    check: &ProjectileCheck,
    config: &ValidationConfig,
) -> Result<f32, HitRejection> {
    let mut distance = check.origin.distance(check.hit_point);
    if let Some(destination) = check.destination {
        let to_destination = (destination - check.origin).normalize_or_zero();
        if check.direction.normalize_or_zero().dot(to_destination) > config.collinearity_threshold {
            distance = check.origin.distance(destination);
        }
    }

    let limit = weapon.range + check.hitbox_extent + weapon.detection_radius;
    if distance > limit {
        return Err(HitRejection::OutOfRange { distance, limit });
    }

    if weapon.explode_radius > 0.0
        && let Some(destination) = check.destination
    {
        let from_detonation = check.hit_point.distance(destination);
        let limit = weapon.explode_radius + check.hitbox_extent;
        if from_detonation > limit {
            return Err(HitRejection::OutsideExplosion {
                distance: from_detonation,
                limit,
            });
        }
    }

    if weapon.projectile_speed > 0.0 {
        let elapsed = check.hit_timestamp - check.launch_timestamp;
        if elapsed <= 0 {
            return Err(HitRejection::NonPositiveInterval(elapsed));
        }
        let implied = f64::from(distance) * 1000.0 / elapsed as f64;
        let ratio = implied / f64::from(weapon.projectile_speed);
        if ratio > config.speed_tolerance {
            return Err(HitRejection::TooFast {
                ratio,
                tolerance: config.speed_tolerance,
            });
        }
    }
    Ok(distance)
}

// ---------------------------------------------------------------------------
// HitRegistry
// ---------------------------------------------------------------------------

/// Where the authority places a claimed hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HitTarget {
    /// Object that was hit.
    pub object_id: ObjectId,
    /// Hitbox index.
    pub hitbox_index: u8,
    /// Target position plus hitbox center.
    pub hit_point: Vec3,
    /// Largest half extent of the hitbox.
    pub extent: f32,
}

/// One live record per attacker; a newer seed supersedes the older record.
///
/// Superseded and timed-out records stay behind as [`HitRecordState::Expired`]
/// until the next [`HitRegistry::expire_stale`] sweep, so a late claim against
/// them is told apart from a claim that never had a record.
#[derive(Debug)]
pub struct HitRegistry {
    config: ValidationConfig,
    records: FxHashMap<(ObjectId, i32), HitRegistrationRecord>,
    live: FxHashMap<ObjectId, i32>,
}

impl HitRegistry {
    /// Empty registry judging claims with `config`.
    pub fn new(config: ValidationConfig) -> Self {
        Self {
            config,
            records: FxHashMap::default(),
            live: FxHashMap::default(),
        }
    }

    /// Validation settings.
    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    /// Records an attack that began at `now`. An attack older than the
    /// attacker's live record arrived out of order and is refused.
    pub fn prepare(&mut self, attacker: ObjectId, seed: i32, now: i64, registration: HitRegistration) -> bool {
        if let Some(&live_seed) = self.live.get(&attacker)
            && live_seed != seed
            && let Some(live) = self.records.get_mut(&(attacker, live_seed))
        {
            if live.launch_timestamp > now {
                trace!(%attacker, seed, live = live_seed, "out-of-order hit registration ignored");
                return false;
            }
            live.state = HitRecordState::Expired;
            trace!(%attacker, superseded = live_seed, seed, "hit registration superseded");
        }
        let record = HitRegistrationRecord {
            attacker,
            simulate_seed: seed,
            launch_timestamp: now,
            state: HitRecordState::Prepared,
            registration,
            resolved_triggers: FxHashSet::default(),
            consumed: FxHashSet::default(),
        };
        self.records.insert((attacker, seed), record);
        self.live.insert(attacker, seed);
        true
    }

    /// Folds `extra_damage` into the pool and marks `trigger_index`
    /// resolved. Returns `false` when no live record matches.
    pub fn confirm(&mut self, attacker: ObjectId, seed: i32, trigger_index: u8, extra_damage: f32) -> bool {
        let Some(record) = self.records.get_mut(&(attacker, seed)) else {
            return false;
        };
        if record.state == HitRecordState::Expired {
            return false;
        }
        record.registration.damage_pool += extra_damage;
        record.resolved_triggers.insert(trigger_index);
        record.state = HitRecordState::Confirmed;
        true
    }

    /// Judges `claim` against its record and, when it passes, consumes the
    /// `(trigger, spread, target)` slot so it cannot be claimed twice.
    pub fn validate(&mut self, claim: &HitClaim, target: HitTarget, now: i64) -> Result<ValidatedHit, HitRejection> {
        let attacker = claim.attacker_object_id;
        let seed = claim.simulate_seed;
        let record = self
            .records
            .get_mut(&(attacker, seed))
            .ok_or(HitRejection::NoRecord { attacker, seed })?;
        if record.state == HitRecordState::Expired {
            return Err(HitRejection::Expired);
        }
        if usize::from(claim.trigger_index) >= record.trigger_count() || claim.spread_index >= record.spread_count() {
            return Err(HitRejection::UndeclaredProjectile {
                trigger: claim.trigger_index,
                spread: claim.spread_index,
            });
        }
        let slot = (claim.trigger_index, claim.spread_index, target.object_id);
        if record.consumed.contains(&slot) {
            return Err(HitRejection::AlreadyHit(target.object_id));
        }

        // Neither end of the flight may lie outside what the authority saw.
        let check = ProjectileCheck {
            origin: claim.origin,
            direction: claim.direction,
            destination: claim.hit_destination,
            hit_point: target.hit_point,
            hitbox_extent: target.extent,
            launch_timestamp: claim.launch_timestamp.max(record.launch_timestamp),
            hit_timestamp: claim.hit_timestamp.min(now),
        };
        validate_projectile(&record.registration.weapon, &check, &self.config)?;

        record.consumed.insert(slot);
        Ok(ValidatedHit {
            attacker,
            target: target.object_id,
            hitbox_index: target.hitbox_index,
            simulate_seed: seed,
            trigger_index: claim.trigger_index,
            spread_index: claim.spread_index,
            damage: record.registration.damage_pool / f32::from(record.spread_count()),
            hit_point: target.hit_point,
        })
    }

    /// Discards the records that were already expired, then marks records
    /// older than the configured lifetime expired. Returns how many were
    /// newly marked.
    pub fn expire_stale(&mut self, now: i64) -> usize {
        let lifetime = self.config.hit_record_lifetime_ms;
        self.records.retain(|_, record| record.state != HitRecordState::Expired);

        let mut expired = 0;
        for record in self.records.values_mut() {
            if now - record.launch_timestamp > lifetime {
                record.state = HitRecordState::Expired;
                expired += 1;
            }
        }
        let records = &self.records;
        self.live.retain(|attacker, seed| {
            records
                .get(&(*attacker, *seed))
                .is_some_and(|r| r.state != HitRecordState::Expired)
        });
        expired
    }

    /// Live record of `attacker`.
    pub fn record(&self, attacker: ObjectId) -> Option<&HitRegistrationRecord> {
        let seed = self.live.get(&attacker)?;
        self.records.get(&(attacker, *seed))
    }

    /// Record of one attack attempt, expired or not.
    pub fn record_for_seed(&self, attacker: ObjectId, seed: i32) -> Option<&HitRegistrationRecord> {
        self.records.get(&(attacker, seed))
    }

    /// Drops every record of a destroyed attacker.
    pub fn forget(&mut self, attacker: ObjectId) {
        self.live.remove(&attacker);
        self.records.retain(|(owner, _), _| *owner != attacker);
    }

    /// Drops every record.
    pub fn clear(&mut self) {
        self.records.clear();
        self.live.clear();
    }

    /// Number of records held, including expired ones awaiting a sweep.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// `true` when no record is held.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Context operations
// ---------------------------------------------------------------------------

impl ReplicationContext {
    /// Records an attack by `attacker` before any of its effects play.
    /// Returns `false` when the attacker is not a live object or a newer
    /// attack is already recorded.
    pub fn prepare_hit_reg_validation(&mut self, attacker: ObjectId, seed: i32, registration: HitRegistration) -> bool {
        if self.registry.get_live(attacker).is_none() {
            debug!(%attacker, seed, "hit registration for unknown attacker");
            return false;
        }
        let now = self.clock.now_ms();
        self.hits.prepare(attacker, seed, now, registration)
    }

    /// Confirms one trigger of a recorded attack. Unmatched confirmations
    /// are dropped.
    pub fn confirm_hit_reg_validation(
        &mut self,
        attacker: ObjectId,
        seed: i32,
        trigger_index: u8,
        extra_damage: f32,
    ) -> bool {
        let confirmed = self.hits.confirm(attacker, seed, trigger_index, extra_damage);
        if !confirmed {
            debug!(%attacker, seed, trigger_index, "unmatched hit confirmation dropped");
        }
        confirmed
    }

    /// Judges a hit claim for `attacker`. An accepted claim surfaces as
    /// [`ReplicationEvent::HitAccepted`]; a rejected one only as `false`.
    pub fn perform_validation(&mut self, attacker: ObjectId, claim: &HitClaim) -> bool {
        match self.validate_hit(attacker, claim) {
            Ok(hit) => {
                debug!(%attacker, target = %hit.target, damage = hit.damage, "hit accepted");
                self.events.push(ReplicationEvent::HitAccepted(hit));
                true
            }
            Err(rejection) => {
                debug!(%attacker, seed = claim.simulate_seed, %rejection, "hit claim rejected");
                false
            }
        }
    }

    fn validate_hit(&mut self, attacker: ObjectId, claim: &HitClaim) -> Result<ValidatedHit, HitRejection> {
        if claim.attacker_object_id != attacker {
            return Err(HitRejection::AttackerMismatch {
                attacker,
                claimed: claim.attacker_object_id,
            });
        }
        let target_id = claim.target_object_id;
        let target = self
            .registry
            .get_live(target_id)
            .ok_or(HitRejection::UnknownTarget(target_id))?;
        let hitbox = target
            .hitboxes
            .get(usize::from(claim.hitbox_index))
            .ok_or(HitRejection::UnknownHitbox {
                target: target_id,
                index: claim.hitbox_index,
            })?;
        let target = HitTarget {
            object_id: target_id,
            hitbox_index: claim.hitbox_index,
            hit_point: target.position + hitbox.center,
            extent: hitbox.max_extent(),
        };
        let now = self.clock.now_ms();
        self.hits.validate(claim, target, now)
    }

    /// A claim that arrived from `from`: only the attacker's owner may claim
    /// its hits. Plausibility rejections are not errors.
    pub(crate) fn process_hit_claim(&mut self, from: ConnectionId, claim: HitClaim) -> Result<(), DispatchError> {
        let attacker = self.registry.resolve(claim.attacker_object_id)?;
        if !attacker.is_owned_by_connection(from) {
            return Err(ResolveError::NotOwner {
                connection: from,
                object: claim.attacker_object_id,
            }
            .into());
        }
        self.perform_validation(claim.attacker_object_id, &claim);
        Ok(())
    }

    /// Expires hit records older than the configured lifetime and discards
    /// the ones expired by the previous call.
    pub fn expire_hit_records(&mut self) -> usize {
        let now = self.clock.now_ms();
        let expired = self.hits.expire_stale(now);
        if expired > 0 {
            debug!(expired, "hit registrations expired");
        }
        expired
    }
}
