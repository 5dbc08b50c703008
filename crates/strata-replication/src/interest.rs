//! Interest management: which objects each connection observes.
//!
//! A connection's view is the `subscribing` set of its controlled object; the
//! inverse relation is each object's `subscribers` set. Every mutation here
//! updates both sides so that, once a reconciliation pass completes,
//! `object.subscribers ∋ c ⇔ controlled(c).subscribing ∋ object`.

use rustc_hash::FxHashSet;
use strata_config::{InterestConfig, InterestMode};
use tracing::{debug, trace};

use crate::context::ReplicationContext;
use crate::dispatch::ReplicationEvent;
use crate::identity::{DestroyReason, NetworkObject, ObjectId, ObjectRegistry};
use crate::messages::{DestroyObject, ReplicationMessage};
use crate::ownership::ConnectionId;

// ---------------------------------------------------------------------------
// Visibility predicates
// ---------------------------------------------------------------------------

/// `(subject, observer)` predicate consulted by [`should_hide`].
pub type VisibilityPredicate = Box<dyn Fn(&NetworkObject, &NetworkObject) -> bool + Send + Sync>;

/// Gameplay-registered predicates for the hide chain.
#[derive(Default)]
pub struct VisibilityPolicies {
    force_hide: Vec<VisibilityPredicate>,
    hide_exception: Vec<VisibilityPredicate>,
}

impl std::fmt::Debug for VisibilityPolicies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisibilityPolicies")
            .field("force_hide", &self.force_hide.len())
            .field("hide_exception", &self.hide_exception.len())
            .finish()
    }
}

impl VisibilityPolicies {
    /// Adds a predicate that hides the subject whenever it returns `true`,
    /// even from observers listed as exceptions.
    pub fn add_force_hide<F>(&mut self, predicate: F)
    where
        F: Fn(&NetworkObject, &NetworkObject) -> bool + Send + Sync + 'static,
    {
        self.force_hide.push(Box::new(predicate));
    }

    /// Adds a predicate that reveals a hidden subject whenever it returns `true`.
    pub fn add_hide_exception<F>(&mut self, predicate: F)
    where
        F: Fn(&NetworkObject, &NetworkObject) -> bool + Send + Sync + 'static,
    {
        self.hide_exception.push(Box::new(predicate));
    }

    /// Removes every predicate.
    pub fn clear(&mut self) {
        self.force_hide.clear();
        self.hide_exception.clear();
    }
}

/// Whether `subject` is hidden from the connection controlling `observer`.
///
/// Checks run in a fixed order and the first decisive one wins:
/// 1. same owner: visible
/// 2. different sub-channel: hidden
/// 3. any force-hide predicate: hidden
/// 4. subject not flagged hidden: visible
/// 5. observer's owner listed in the subject's hide exceptions: visible
/// 6. any hide-exception predicate: visible
/// 7. hidden
pub fn should_hide(subject: &NetworkObject, observer: &NetworkObject, policies: &VisibilityPolicies) -> bool {
    if observer.owner == subject.owner {
        return false;
    }
    if subject.sub_channel_id != observer.sub_channel_id {
        return true;
    }
    if policies.force_hide.iter().any(|p| p(subject, observer)) {
        return true;
    }
    if !subject.is_hide {
        return false;
    }
    if observer
        .owner
        .connection()
        .is_some_and(|c| subject.hide_exceptions.contains(&c))
    {
        return false;
    }
    if policies.hide_exception.iter().any(|p| p(subject, observer)) {
        return false;
    }
    true
}

// ---------------------------------------------------------------------------
// Interest policies
// ---------------------------------------------------------------------------

/// Decides which objects a connection should observe.
pub trait InterestPolicy: Send + Sync {
    /// Name for logs.
    fn name(&self) -> &'static str;

    /// Whether the connection controlling `observer` should see `subject`.
    fn is_interested(&self, observer: &NetworkObject, subject: &NetworkObject, policies: &VisibilityPolicies) -> bool;

    /// Every live object the connection controlling `observer` should see.
    fn desired_subscriptions(
        &self,
        observer: &NetworkObject,
        registry: &ObjectRegistry,
        policies: &VisibilityPolicies,
    ) -> FxHashSet<ObjectId> {
        registry
            .iter()
            .filter(|s| s.is_spawned && !s.is_destroyed)
            .filter(|s| self.is_interested(observer, s, policies))
            .map(|s| s.object_id)
            .collect()
    }
}

/// Everything that is not hidden.
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalInterest;

impl InterestPolicy for GlobalInterest {
    fn name(&self) -> &'static str {
        "global"
    }

    fn is_interested(&self, observer: &NetworkObject, subject: &NetworkObject, policies: &VisibilityPolicies) -> bool {
        !should_hide(subject, observer, policies)
    }
}

/// Everything within `visible_range` of the observer that is not hidden.
#[derive(Debug, Clone, Copy)]
pub struct ProximityInterest {
    /// Radius in meters.
    pub visible_range: f32,
}

impl InterestPolicy for ProximityInterest {
    fn name(&self) -> &'static str {
        "proximity"
    }

    fn is_interested(&self, observer: &NetworkObject, subject: &NetworkObject, policies: &VisibilityPolicies) -> bool {
        let range_sq = self.visible_range * self.visible_range;
        observer.position.distance_squared(subject.position) <= range_sq
            && !should_hide(subject, observer, policies)
    }
}

/// Builds the policy named by `config`.
pub fn policy_from_config(config: &InterestConfig) -> Box<dyn InterestPolicy> {
    match config.mode {
        InterestMode::Global => Box::new(GlobalInterest),
        InterestMode::Proximity => Box::new(ProximityInterest {
            visible_range: config.visible_range,
        }),
    }
}

// ---------------------------------------------------------------------------
// Subscription engine
// ---------------------------------------------------------------------------

impl ReplicationContext {
    /// Hide chain for two registered objects. Unknown objects count as hidden.
    pub fn should_hide(&self, subject: ObjectId, observer: ObjectId) -> bool {
        match (self.registry.get(subject), self.registry.get(observer)) {
            (Some(s), Some(o)) => should_hide(s, o, &self.policies),
            _ => {
                debug!(%subject, %observer, "should_hide on unknown object");
                true
            }
        }
    }

    /// Adds `connection` to the object's subscribers. Returns whether the set
    /// changed.
    pub fn add_subscriber(&mut self, object_id: ObjectId, connection: ConnectionId) -> bool {
        let added = self
            .registry
            .get_mut(object_id)
            .is_some_and(|o| o.subscribers.insert(connection));
        if added {
            self.events.push(ReplicationEvent::SubscriberAdded { object_id, connection });
        }
        added
    }

    /// Removes `connection` from the object's subscribers. Returns whether
    /// the set changed.
    pub fn remove_subscriber(&mut self, object_id: ObjectId, connection: ConnectionId) -> bool {
        let removed = self
            .registry
            .get_mut(object_id)
            .is_some_and(|o| o.subscribers.remove(&connection));
        if removed {
            self.events.push(ReplicationEvent::SubscriberRemoved { object_id, connection });
        }
        removed
    }

    /// Starts `connection` observing `object_id`: both sides of the relation
    /// are updated and a newly added subscriber receives the spawn sequence.
    /// Returns whether the subscriber set changed.
    pub fn subscribe(&mut self, connection: ConnectionId, object_id: ObjectId) -> bool {
        let Some(controlled) = self.connections.get(&connection).and_then(|c| c.controlled_object) else {
            debug!(%connection, %object_id, "subscribe without a controlled object");
            return false;
        };
        if self.registry.get_live(object_id).is_none() {
            debug!(%connection, %object_id, "subscribe to unknown object");
            return false;
        }
        if let Some(observer) = self.registry.get_mut(controlled) {
            observer.subscribing.insert(object_id);
        }
        if !self.add_subscriber(object_id, connection) {
            return false;
        }
        trace!(%connection, %object_id, "subscribed");
        self.send_spawn_sequence(connection, object_id);
        true
    }

    /// Stops `connection` observing `object_id` and tells the peer to drop its
    /// replica. Returns whether the subscriber set changed.
    pub fn unsubscribe(&mut self, connection: ConnectionId, object_id: ObjectId) -> bool {
        if let Some(controlled) = self.connections.get(&connection).and_then(|c| c.controlled_object)
            && let Some(observer) = self.registry.get_mut(controlled)
        {
            observer.subscribing.remove(&object_id);
        }
        self.unsubscribe_observed(connection, object_id)
    }

    /// Object-side half of [`unsubscribe`](Self::unsubscribe), for callers
    /// that already emptied the subscribing set.
    pub(crate) fn unsubscribe_observed(&mut self, connection: ConnectionId, object_id: ObjectId) -> bool {
        if !self.remove_subscriber(object_id, connection) {
            return false;
        }
        trace!(%connection, %object_id, "unsubscribed");
        self.enqueue(
            connection,
            ReplicationMessage::Destroy(DestroyObject {
                object_id,
                reason: DestroyReason::REMOVED_FROM_SUBSCRIBING,
            }),
        );
        true
    }

    /// Reconciles the view of the connection controlling `controlled` with
    /// `desired`.
    ///
    /// The controlled object always observes itself. Ids dropped from the
    /// view are unsubscribed; the subscribing set is then rebuilt from every
    /// resolvable id in `desired`, silently skipping the rest. Skipped
    /// entirely on a client, for host-owned objects, for objects that are not
    /// their connection's controlled object, and for connections that are not
    /// ready. Returns whether the pass ran.
    pub fn update_subscribing(&mut self, controlled: ObjectId, mut desired: FxHashSet<ObjectId>) -> bool {
        if !self.role.is_server {
            return false;
        }
        let Some(object) = self.registry.get_live(controlled) else {
            debug!(%controlled, "update_subscribing on unknown object");
            return false;
        };
        let Some(connection) = object.owner.connection() else {
            return false;
        };
        let Some(conn) = self.connections.get(&connection) else {
            return false;
        };
        if !conn.ready || conn.controlled_object != Some(controlled) {
            return false;
        }

        desired.insert(controlled);

        let mut current: Vec<ObjectId> = object.subscribing.iter().copied().collect();
        current.sort_unstable();
        for id in current {
            if id != controlled && !desired.contains(&id) {
                self.unsubscribe(connection, id);
            }
        }

        if let Some(object) = self.registry.get_mut(controlled) {
            object.subscribing.clear();
        }
        let mut wanted: Vec<ObjectId> = desired.into_iter().collect();
        wanted.sort_unstable();
        for id in wanted {
            if self.registry.get_live(id).is_some() {
                self.subscribe(connection, id);
            }
        }
        true
    }

    /// The set `connection` should observe under the active policy, plus
    /// everything it owns.
    pub fn desired_subscriptions(&self, connection: ConnectionId) -> Option<FxHashSet<ObjectId>> {
        let conn = self.connections.get(&connection)?;
        let observer = self.registry.get_live(conn.controlled_object?)?;
        let mut desired = self
            .interest
            .desired_subscriptions(observer, &self.registry, &self.policies);
        desired.extend(
            conn.owned_objects
                .iter()
                .filter(|id| self.registry.get_live(**id).is_some()),
        );
        Some(desired)
    }

    /// Runs one reconciliation pass for every ready connection. Returns the
    /// number of connections reconciled.
    pub fn update_interest(&mut self) -> usize {
        let mut updated = 0;
        for connection in self.connection_ids() {
            if self.refresh_connection_interest(connection) {
                updated += 1;
            }
        }
        updated
    }

    /// Reconciles one connection's view.
    pub(crate) fn refresh_connection_interest(&mut self, connection: ConnectionId) -> bool {
        let Some(controlled) = self.connections.get(&connection).and_then(|c| c.controlled_object) else {
            return false;
        };
        let Some(desired) = self.desired_subscriptions(connection) else {
            return false;
        };
        self.update_subscribing(controlled, desired)
    }

    /// Subscribes an owner to an object it owns once it can receive traffic.
    pub(crate) fn ensure_owner_subscribed(&mut self, connection: ConnectionId, object_id: ObjectId) {
        if self.connections.get(&connection).is_some_and(|c| c.ready) {
            self.subscribe(connection, object_id);
        }
    }

    /// Subscribes every ready connection interested in a freshly spawned object.
    pub fn notify_new_object(&mut self, object_id: ObjectId) {
        if !self.role.is_server {
            return;
        }
        let Some(subject) = self.registry.get_live(object_id) else {
            return;
        };
        let interested: Vec<ConnectionId> = self
            .connection_ids()
            .into_iter()
            .filter(|id| {
                let Some(conn) = self.connections.get(id) else {
                    return false;
                };
                conn.ready
                    && conn
                        .controlled_object
                        .and_then(|c| self.registry.get_live(c))
                        .is_some_and(|observer| self.interest.is_interested(observer, subject, &self.policies))
            })
            .collect();
        for connection in interested {
            self.subscribe(connection, object_id);
        }
    }

    /// Marks a connection ready (or not). Becoming ready reconciles its view
    /// immediately. Returns `false` for unknown connections.
    pub fn set_connection_ready(&mut self, connection: ConnectionId, ready: bool) -> bool {
        let Some(conn) = self.connections.get_mut(&connection) else {
            return false;
        };
        conn.ready = ready;
        debug!(%connection, ready, "connection readiness changed");
        if ready {
            self.refresh_connection_interest(connection);
        }
        true
    }
}

#[cfg(test)]
#[path = "interest_tests.rs"]
mod tests;
