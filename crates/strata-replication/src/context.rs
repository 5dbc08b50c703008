//! The replication context: every piece of per-world state in one owned value.
//!
//! Nothing in this crate is global. Id counters, visibility predicates, hit
//! records and connection state all live on a [`ReplicationContext`] that is
//! built once per world and passed by reference to every operation.

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use strata_config::{ChannelConfig, Config, InterestConfig};
use tracing::{debug, info, warn};

use crate::channel::PeerLink;
use crate::dispatch::ReplicationEvent;
use crate::error::TemplateError;
use crate::hitreg::HitRegistry;
use crate::identity::{AssetHash, DestroyReason, NetworkObject, ObjectId, ObjectRegistry, ObjectTemplate, TemplateRegistry};
use crate::interest::{InterestPolicy, VisibilityPolicies, policy_from_config};
use crate::ownership::{ConnectionId, LocalRole};
use crate::transport::AuthoritativeClock;

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// Server-side state of one remote peer.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    pub(crate) controlled_object: Option<ObjectId>,
    pub(crate) owned_objects: FxHashSet<ObjectId>,
    pub(crate) ready: bool,
    pub(crate) link: PeerLink,
}

impl Connection {
    fn new(id: ConnectionId) -> Self {
        Self {
            id,
            controlled_object: None,
            owned_objects: FxHashSet::default(),
            ready: false,
            link: PeerLink::default(),
        }
    }

    /// Connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The object whose subscribing set is this connection's view.
    pub fn controlled_object(&self) -> Option<ObjectId> {
        self.controlled_object
    }

    /// Every object this connection owns.
    pub fn owned_objects(&self) -> &FxHashSet<ObjectId> {
        &self.owned_objects
    }

    /// Finished loading and may receive replication traffic.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Records queued for the next flush.
    pub fn pending_records(&self) -> usize {
        self.link.sender.pending().len()
    }
}

// ---------------------------------------------------------------------------
// ReplicationContext
// ---------------------------------------------------------------------------

/// Per-world replication state.
pub struct ReplicationContext {
    pub(crate) role: LocalRole,
    pub(crate) registry: ObjectRegistry,
    pub(crate) templates: TemplateRegistry,
    pub(crate) connections: FxHashMap<ConnectionId, Connection>,
    /// Link to the authority when this process is a pure client.
    pub(crate) server_link: PeerLink,
    pub(crate) policies: VisibilityPolicies,
    pub(crate) interest: Box<dyn InterestPolicy>,
    pub(crate) interest_config: InterestConfig,
    pub(crate) channel_config: ChannelConfig,
    pub(crate) hits: HitRegistry,
    pub(crate) clock: Arc<dyn AuthoritativeClock>,
    pub(crate) events: Vec<ReplicationEvent>,
}

impl std::fmt::Debug for ReplicationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationContext")
            .field("role", &self.role)
            .field("objects", &self.registry.len())
            .field("connections", &self.connections.len())
            .field("interest", &self.interest.name())
            .finish_non_exhaustive()
    }
}

impl ReplicationContext {
    /// Builds an empty world for `role`, taking interest, channel and
    /// validation settings from `config`.
    pub fn new(role: LocalRole, config: &Config, clock: Arc<dyn AuthoritativeClock>) -> Self {
        Self {
            role,
            registry: ObjectRegistry::new(),
            templates: TemplateRegistry::new(),
            connections: FxHashMap::default(),
            server_link: PeerLink::default(),
            policies: VisibilityPolicies::default(),
            interest: policy_from_config(&config.interest),
            interest_config: config.interest.clone(),
            channel_config: config.channel.clone(),
            hits: HitRegistry::new(config.validation.clone()),
            clock,
            events: Vec::new(),
        }
    }

    /// This process's role.
    pub fn role(&self) -> LocalRole {
        self.role
    }

    /// Current authoritative time in milliseconds.
    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    // --- Templates ---

    /// Registers a template so it can be spawned or resolved from a spawn record.
    pub fn register_template(&mut self, template: ObjectTemplate) -> Result<AssetHash, TemplateError> {
        let asset_id = template.asset_id.clone();
        let hash = self.templates.register(template)?;
        debug!(%asset_id, %hash, "template registered");
        Ok(hash)
    }

    /// Registered templates.
    pub fn templates(&self) -> &TemplateRegistry {
        &self.templates
    }

    // --- Objects ---

    /// The object registry.
    pub fn registry(&self) -> &ObjectRegistry {
        &self.registry
    }

    /// Object by id.
    pub fn object(&self, object_id: ObjectId) -> Option<&NetworkObject> {
        self.registry.get(object_id)
    }

    /// Mutable object by id, for position, rotation and visibility updates.
    pub fn object_mut(&mut self, object_id: ObjectId) -> Option<&mut NetworkObject> {
        self.registry.get_mut(object_id)
    }

    // --- Policies ---

    /// Visibility predicates consulted by the hide chain.
    pub fn policies_mut(&mut self) -> &mut VisibilityPolicies {
        &mut self.policies
    }

    /// Replaces the interest policy.
    pub fn set_interest_policy(&mut self, policy: Box<dyn InterestPolicy>) {
        info!(policy = policy.name(), "interest policy changed");
        self.interest = policy;
    }

    /// Active interest policy.
    pub fn interest_policy(&self) -> &dyn InterestPolicy {
        self.interest.as_ref()
    }

    /// Hit registration records.
    pub fn hit_registry(&self) -> &HitRegistry {
        &self.hits
    }

    // --- Connections ---

    /// Registers a peer. Returns `false` if it is already known.
    pub fn add_connection(&mut self, connection: ConnectionId) -> bool {
        if self.connections.contains_key(&connection) {
            return false;
        }
        self.connections.insert(connection, Connection::new(connection));
        info!(%connection, "connection added");
        true
    }

    /// Connection by id.
    pub fn connection(&self, connection: ConnectionId) -> Option<&Connection> {
        self.connections.get(&connection)
    }

    /// Known connection ids, ascending.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Drops a peer: it stops observing everything, then every object it
    /// owned is destroyed with [`DestroyReason::OWNER_DISCONNECTED`].
    pub fn remove_connection(&mut self, connection: ConnectionId) -> bool {
        let Some(conn) = self.connections.remove(&connection) else {
            warn!(%connection, "remove_connection for unknown connection");
            return false;
        };

        if let Some(controlled) = conn.controlled_object
            && let Some(object) = self.registry.get_mut(controlled)
        {
            object.subscribing.clear();
        }
        for id in self.registry.sorted_ids() {
            if let Some(object) = self.registry.get_mut(id) {
                object.subscribers.remove(&connection);
            }
        }

        let mut owned: Vec<ObjectId> = conn.owned_objects.into_iter().collect();
        owned.sort_unstable();
        for object_id in &owned {
            self.destroy(*object_id, DestroyReason::OWNER_DISCONNECTED);
        }
        info!(%connection, destroyed = owned.len(), "connection removed");
        true
    }

    /// Drains events produced since the last call.
    pub fn drain_events(&mut self) -> Vec<ReplicationEvent> {
        std::mem::take(&mut self.events)
    }

    /// Releases all world state, returning the context to its freshly built
    /// condition. Templates, policies and the clock are kept.
    pub fn teardown(&mut self) {
        let objects = self.registry.len();
        let connections = self.connections.len();
        self.registry.clear();
        self.connections.clear();
        self.server_link = PeerLink::default();
        self.hits.clear();
        self.events.clear();
        info!(objects, connections, "replication context torn down");
    }
}
