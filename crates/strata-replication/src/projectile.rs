//! Projectile lifecycle: the simulation that hit claims describe.
//!
//! A projectile sweeps the segment it travelled each tick against target
//! spheres. The first qualifying contact (or running out of lifetime) ends
//! the flight; an exploding projectile then damages everything inside its
//! radius exactly once, and a destroying projectile ignores all further
//! contacts until the pool reclaims it.

use glam::Vec3;
use rustc_hash::FxHashSet;
use tracing::trace;

use crate::identity::{ObjectId, ObjectRegistry};
use crate::messages::HitClaim;

/// Pool-local handle of one projectile.
pub type ProjectileId = u32;

// ---------------------------------------------------------------------------
// Sweep geometry
// ---------------------------------------------------------------------------

/// Sphere a projectile can hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepTarget {
    /// Object owning the hit volume.
    pub object_id: ObjectId,
    /// Hitbox index on the object.
    pub hitbox_index: u8,
    /// World-space center.
    pub center: Vec3,
    /// Bounding radius.
    pub radius: f32,
}

/// One sphere per hitbox of every live object.
pub fn sweep_targets(registry: &ObjectRegistry) -> Vec<SweepTarget> {
    let mut targets: Vec<SweepTarget> = registry
        .iter()
        .filter(|o| o.is_spawned() && !o.is_destroyed())
        .flat_map(|o| {
            o.hitboxes.iter().enumerate().map(move |(index, hitbox)| SweepTarget {
                object_id: o.object_id(),
                hitbox_index: index as u8,
                center: o.position + hitbox.center,
                radius: hitbox.max_extent(),
            })
        })
        .collect();
    targets.sort_by_key(|t| (t.object_id, t.hitbox_index));
    targets
}

/// Fraction of the segment `start → end` at which it first touches the
/// sphere, or `None` on a miss. A start inside the sphere hits at `0`.
pub fn segment_sphere_entry(start: Vec3, end: Vec3, center: Vec3, radius: f32) -> Option<f32> {
    let oc = start - center;
    let c = oc.dot(oc) - radius * radius;
    if c <= 0.0 {
        return Some(0.0);
    }
    let delta = end - start;
    let a = delta.dot(delta);
    if a <= f32::EPSILON {
        return None;
    }
    let b = oc.dot(delta);
    let disc = b * b - a * c;
    if disc < 0.0 {
        return None;
    }
    let t = (-b - disc.sqrt()) / a;
    (0.0..=1.0).contains(&t).then_some(t)
}

// ---------------------------------------------------------------------------
// Projectile
// ---------------------------------------------------------------------------

/// Flight state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectileState {
    /// Moving and sweeping for contacts.
    Launched,
    /// Flight ended; the explosion has not fired yet.
    Exploding,
    /// Done; waiting to be reclaimed. Contacts are ignored.
    Destroying,
}

/// Launch parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectileParams {
    /// Object that fired the projectile; never hit by it.
    pub attacker: ObjectId,
    /// Seed of the attack attempt.
    pub simulate_seed: i32,
    /// Trigger within the attack.
    pub trigger_index: u8,
    /// Projectile within the trigger.
    pub spread_index: u8,
    /// Launch point.
    pub origin: Vec3,
    /// Unit launch direction.
    pub direction: Vec3,
    /// Meters per second.
    pub speed: f32,
    /// Maximum flight time in milliseconds.
    pub lifetime_ms: i64,
    /// Sweep radius added to every target sphere.
    pub detection_radius: f32,
    /// Area damage radius; `0` for none.
    pub explode_radius: f32,
    /// Only this target may be hit directly.
    pub locked_target: Option<ObjectId>,
    /// Declared aim destination.
    pub destination: Option<Vec3>,
    /// Authoritative launch time (ms).
    pub launch_timestamp: i64,
}

impl ProjectileParams {
    /// Builds the claim a client reports for a hit on `target` at `now`.
    pub fn hit_claim(&self, target: ObjectId, hitbox_index: u8, now: i64) -> HitClaim {
        HitClaim {
            attacker_object_id: self.attacker,
            simulate_seed: self.simulate_seed,
            trigger_index: self.trigger_index,
            spread_index: self.spread_index,
            launch_timestamp: self.launch_timestamp,
            hit_timestamp: now,
            origin: self.origin,
            direction: self.direction,
            hit_destination: self.destination,
            target_object_id: target,
            hitbox_index,
        }
    }
}

/// Something a projectile did during a tick.
#[derive(Debug, Clone, PartialEq)]
pub enum ProjectileEvent {
    /// A target was hit, directly or by the explosion.
    Hit {
        projectile: ProjectileId,
        target: ObjectId,
        hitbox_index: u8,
        point: Vec3,
        by_explosion: bool,
    },
    /// The explosion fired.
    Exploded { projectile: ProjectileId, at: Vec3 },
    /// Lifetime ran out without a contact.
    Expired { projectile: ProjectileId },
}

/// One simulated projectile.
#[derive(Debug, Clone)]
pub struct Projectile {
    id: ProjectileId,
    params: ProjectileParams,
    state: ProjectileState,
    position: Vec3,
    elapsed_ms: i64,
    exploded: bool,
    already_hit: FxHashSet<ObjectId>,
}

impl Projectile {
    fn new(id: ProjectileId, params: ProjectileParams) -> Self {
        Self {
            id,
            position: params.origin,
            params,
            state: ProjectileState::Launched,
            elapsed_ms: 0,
            exploded: false,
            already_hit: FxHashSet::default(),
        }
    }

    fn relaunch(&mut self, id: ProjectileId, params: ProjectileParams) {
        self.id = id;
        self.position = params.origin;
        self.params = params;
        self.state = ProjectileState::Launched;
        self.elapsed_ms = 0;
        self.exploded = false;
        self.already_hit.clear();
    }

    /// Pool handle.
    pub fn id(&self) -> ProjectileId {
        self.id
    }

    /// Current state.
    pub fn state(&self) -> ProjectileState {
        self.state
    }

    /// Current position.
    pub fn position(&self) -> Vec3 {
        self.position
    }

    /// Launch parameters.
    pub fn params(&self) -> &ProjectileParams {
        &self.params
    }

    /// Whether `target` was already hit directly.
    pub fn has_hit(&self, target: ObjectId) -> bool {
        self.already_hit.contains(&target)
    }

    /// Advances the flight by `dt_ms` and resolves contacts along the way.
    pub fn tick(&mut self, dt_ms: i64, targets: &[SweepTarget]) -> Vec<ProjectileEvent> {
        let mut events = Vec::new();
        match self.state {
            ProjectileState::Launched => {
                let start = self.position;
                let step = self.params.direction * self.params.speed * (dt_ms as f32 / 1000.0);
                let end = start + step;
                self.elapsed_ms += dt_ms;

                match self.first_contact(start, end, targets) {
                    Some((target, t)) => {
                        self.position = start + step * t;
                        self.already_hit.insert(target.object_id);
                        events.push(ProjectileEvent::Hit {
                            projectile: self.id,
                            target: target.object_id,
                            hitbox_index: target.hitbox_index,
                            point: self.position,
                            by_explosion: false,
                        });
                        self.finish_flight();
                    }
                    None => {
                        self.position = end;
                        if self.elapsed_ms >= self.params.lifetime_ms {
                            events.push(ProjectileEvent::Expired { projectile: self.id });
                            self.finish_flight();
                        }
                    }
                }
                if self.state == ProjectileState::Exploding {
                    events.extend(self.explode(targets));
                }
            }
            ProjectileState::Exploding => events.extend(self.explode(targets)),
            ProjectileState::Destroying => {}
        }
        events
    }

    /// Fires the explosion: every target within the radius is hit. Runs at
    /// most once; later calls return nothing.
    pub fn explode(&mut self, targets: &[SweepTarget]) -> Vec<ProjectileEvent> {
        if self.exploded || self.state == ProjectileState::Destroying {
            return Vec::new();
        }
        self.exploded = true;
        self.state = ProjectileState::Destroying;

        let at = self.position;
        let mut events = vec![ProjectileEvent::Exploded { projectile: self.id, at }];
        let mut damaged = FxHashSet::default();
        for target in targets {
            if target.object_id == self.params.attacker || damaged.contains(&target.object_id) {
                continue;
            }
            if at.distance(target.center) <= self.params.explode_radius + target.radius {
                damaged.insert(target.object_id);
                events.push(ProjectileEvent::Hit {
                    projectile: self.id,
                    target: target.object_id,
                    hitbox_index: target.hitbox_index,
                    point: target.center,
                    by_explosion: true,
                });
            }
        }
        trace!(projectile = self.id, hits = damaged.len(), "projectile exploded");
        events
    }

    fn finish_flight(&mut self) {
        self.state = if self.params.explode_radius > 0.0 {
            ProjectileState::Exploding
        } else {
            ProjectileState::Destroying
        };
    }

    /// Earliest qualifying contact along `start → end`.
    fn first_contact<'a>(&self, start: Vec3, end: Vec3, targets: &'a [SweepTarget]) -> Option<(&'a SweepTarget, f32)> {
        targets
            .iter()
            .filter(|t| t.object_id != self.params.attacker)
            .filter(|t| self.params.locked_target.is_none_or(|locked| locked == t.object_id))
            .filter(|t| !self.already_hit.contains(&t.object_id))
            .filter_map(|t| {
                segment_sphere_entry(start, end, t.center, t.radius + self.params.detection_radius).map(|at| (t, at))
            })
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }
}

// ---------------------------------------------------------------------------
// ProjectilePool
// ---------------------------------------------------------------------------

/// Active projectiles plus reclaimed ones kept for reuse.
#[derive(Debug, Default)]
pub struct ProjectilePool {
    active: Vec<Projectile>,
    free: Vec<Projectile>,
    next_id: ProjectileId,
}

impl ProjectilePool {
    /// Empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Launches a projectile, reusing a pooled one when available.
    pub fn launch(&mut self, params: ProjectileParams) -> ProjectileId {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        let projectile = match self.free.pop() {
            Some(mut pooled) => {
                pooled.relaunch(id, params);
                pooled
            }
            None => Projectile::new(id, params),
        };
        self.active.push(projectile);
        id
    }

    /// Ticks every active projectile, then reclaims the finished ones.
    pub fn tick(&mut self, dt_ms: i64, targets: &[SweepTarget]) -> Vec<ProjectileEvent> {
        let mut events = Vec::new();
        for projectile in &mut self.active {
            events.extend(projectile.tick(dt_ms, targets));
        }
        let (finished, active): (Vec<_>, Vec<_>) = self
            .active
            .drain(..)
            .partition(|p| p.state == ProjectileState::Destroying);
        self.active = active;
        self.free.extend(finished);
        events
    }

    /// Projectile by handle while it is in flight.
    pub fn get(&self, id: ProjectileId) -> Option<&Projectile> {
        self.active.iter().find(|p| p.id == id)
    }

    /// Projectiles in flight.
    pub fn active(&self) -> &[Projectile] {
        &self.active
    }

    /// Reclaimed projectiles ready for reuse.
    pub fn pooled(&self) -> usize {
        self.free.len()
    }
}
