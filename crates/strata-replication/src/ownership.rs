//! Ownership and authority: who may mutate an object and which derived roles
//! a process plays for it.
//!
//! Only `owner` is stored on an object. Every role below is recomputed from it
//! and from the process's [`LocalRole`].

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::behaviour::SyncMode;
use crate::context::ReplicationContext;
use crate::dispatch::ReplicationEvent;
use crate::identity::{NetworkObject, ObjectId};
use crate::messages::{OwnerChange, ReplicationMessage};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Identifier of one remote peer's session.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Owner field of an object: negative means host-owned, otherwise the value
/// names the owning connection.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerId(pub i64);

impl OwnerId {
    /// Owned by the authoritative host.
    pub const HOST: OwnerId = OwnerId(-1);

    /// Owner for the given connection.
    pub fn from_connection(connection: ConnectionId) -> Self {
        Self(connection.0 as i64)
    }

    /// The owning connection, or `None` when host-owned.
    pub fn connection(self) -> Option<ConnectionId> {
        (self.0 >= 0).then_some(ConnectionId(self.0 as u64))
    }

    /// `true` when no connection owns the object.
    pub fn is_host(self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.connection() {
            Some(connection) => write!(f, "{connection}"),
            None => f.write_str("host"),
        }
    }
}

// ---------------------------------------------------------------------------
// LocalRole
// ---------------------------------------------------------------------------

/// What this process is: the authority, an observing client, or both at once
/// (a listen server).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalRole {
    /// This process's writes are canonical.
    pub is_server: bool,
    /// This process observes the world as a player.
    pub is_client: bool,
    /// Connection id the local player is known by, when `is_client`.
    pub local_connection: Option<ConnectionId>,
}

impl LocalRole {
    /// Dedicated authoritative server.
    pub fn server() -> Self {
        Self {
            is_server: true,
            is_client: false,
            local_connection: None,
        }
    }

    /// Pure observing client known to the server as `connection`.
    pub fn client(connection: ConnectionId) -> Self {
        Self {
            is_server: false,
            is_client: true,
            local_connection: Some(connection),
        }
    }

    /// Listen server: authoritative and playing as `connection`.
    pub fn host(connection: ConnectionId) -> Self {
        Self {
            is_server: true,
            is_client: true,
            local_connection: Some(connection),
        }
    }

    /// `true` for a listen server's own player connection.
    pub fn is_local_player(&self, connection: ConnectionId) -> bool {
        self.is_server && self.is_client && self.local_connection == Some(connection)
    }
}

// ---------------------------------------------------------------------------
// Derived roles
// ---------------------------------------------------------------------------

impl NetworkObject {
    /// `true` when the authoritative host owns this object.
    pub fn is_owned_by_host(&self) -> bool {
        self.owner.is_host()
    }

    /// `true` when `connection` owns this object.
    pub fn is_owned_by_connection(&self, connection: ConnectionId) -> bool {
        self.owner == OwnerId::from_connection(connection)
    }

    /// `true` on a listen server whose local player owns this object.
    pub fn is_host_and_owner(&self, role: &LocalRole) -> bool {
        role.is_server
            && role.is_client
            && role
                .local_connection
                .is_some_and(|c| self.is_owned_by_connection(c))
    }

    /// `true` on a pure client whose local player owns this object.
    pub fn is_owner_client(&self, role: &LocalRole) -> bool {
        !role.is_server
            && role.is_client
            && role
                .local_connection
                .is_some_and(|c| self.is_owned_by_connection(c))
    }

    /// Whether this process may write an element with `mode` on this object.
    pub fn can_write(&self, role: &LocalRole, mode: SyncMode) -> bool {
        match mode {
            SyncMode::ServerToClients | SyncMode::ServerToOwner => role.is_server,
            SyncMode::ClientMulticast => {
                role.is_server || self.is_owner_client(role)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Ownership transfer
// ---------------------------------------------------------------------------

impl ReplicationContext {
    /// Hands `object_id` to `new_owner`.
    ///
    /// Authority only. Moves owned-set bookkeeping, tells every subscriber,
    /// and re-runs interest for the previous and the new owner. Returns
    /// `false` on a client, for an unknown object, or when the owner is
    /// unchanged.
    pub fn set_owner(&mut self, object_id: ObjectId, new_owner: OwnerId) -> bool {
        if !self.role.is_server {
            warn!(%object_id, "set_owner called on a non-authoritative context");
            return false;
        }
        let Some(object) = self.registry.get_mut(object_id) else {
            warn!(%object_id, "set_owner on unknown object");
            return false;
        };
        if object.is_destroyed {
            debug!(%object_id, "set_owner on destroyed object");
            return false;
        }
        let previous = object.owner;
        if previous == new_owner {
            return false;
        }
        object.owner = new_owner;
        let subscribers: Vec<ConnectionId> = object.subscribers.iter().copied().collect();

        if let Some(old) = previous.connection() {
            self.release_owned(old, object_id);
        }
        if let Some(new) = new_owner.connection() {
            self.claim_owned(new, object_id);
        }

        let message = ReplicationMessage::OwnerChange(OwnerChange {
            object_id,
            owner_connection_id: new_owner.0,
        });
        for connection in subscribers {
            self.enqueue(connection, message.clone());
        }

        info!(%object_id, %previous, new = %new_owner, "ownership changed");
        self.events.push(ReplicationEvent::OwnerChanged {
            object_id,
            previous,
            owner: new_owner,
        });

        for owner in [previous, new_owner] {
            if let Some(connection) = owner.connection() {
                self.refresh_connection_interest(connection);
            }
        }
        if let Some(new) = new_owner.connection() {
            self.ensure_owner_subscribed(new, object_id);
        }
        true
    }

    /// Adds `object_id` to `connection`'s owned set, promoting it to the
    /// controlled object when the connection has none.
    pub(crate) fn claim_owned(&mut self, connection: ConnectionId, object_id: ObjectId) {
        let Some(conn) = self.connections.get_mut(&connection) else {
            debug!(%connection, %object_id, "owner is not a known connection");
            return;
        };
        conn.owned_objects.insert(object_id);
        if conn.controlled_object.is_none() {
            conn.controlled_object = Some(object_id);
        }
    }

    /// Removes `object_id` from `connection`'s owned set. A released
    /// controlled object hands its subscribing set to the lowest remaining
    /// owned object; with none left the connection stops observing anything.
    pub(crate) fn release_owned(&mut self, connection: ConnectionId, object_id: ObjectId) {
        let Some(conn) = self.connections.get_mut(&connection) else {
            return;
        };
        conn.owned_objects.remove(&object_id);
        if conn.controlled_object != Some(object_id) {
            return;
        }
        let replacement = conn.owned_objects.iter().min().copied();
        conn.controlled_object = replacement;

        let observed = self
            .registry
            .get_mut(object_id)
            .map(|object| std::mem::take(&mut object.subscribing))
            .unwrap_or_default();
        match replacement.and_then(|id| self.registry.get_mut(id)) {
            Some(next) => next.subscribing.extend(observed),
            None => {
                for observed_id in observed {
                    self.unsubscribe_observed(connection, observed_id);
                }
            }
        }
        debug!(%connection, ?replacement, "controlled object released");
    }
}
