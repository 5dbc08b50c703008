//! Error types for stale references, template setup and inbound dispatch.
//!
//! None of these escape the public replication operations as faults: the
//! operations log the error and degrade to `false` / `None`.

use crate::behaviour::ElementKind;
use crate::identity::{AssetHash, ObjectId};
use crate::ownership::ConnectionId;
use crate::sync::ListError;

/// Reasons an `(object id, element index)` reference could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    /// No live object carries this id.
    #[error("unknown object {0}")]
    UnknownObject(ObjectId),

    /// The object exists but its teardown has already begun.
    #[error("object {0} is already destroyed")]
    Destroyed(ObjectId),

    /// The id embedded in the message does not match the resolved element's owner.
    #[error("embedded object id {embedded} does not match resolved object {resolved}")]
    MismatchedObjectId {
        /// Id carried by the message.
        embedded: ObjectId,
        /// Id stamped on the resolved element.
        resolved: ObjectId,
    },

    /// The element index is past the end of the object's element array.
    #[error("{kind} index {index} out of range on object {object} (len {len})")]
    ElementOutOfRange {
        /// Object being addressed.
        object: ObjectId,
        /// Element category.
        kind: ElementKind,
        /// Requested index.
        index: u8,
        /// Length of the element array.
        len: usize,
    },

    /// The sender does not own the object it tried to write to.
    #[error("connection {connection} does not own object {object}")]
    NotOwner {
        /// Sending connection.
        connection: ConnectionId,
        /// Object being addressed.
        object: ObjectId,
    },

    /// The element's sync mode does not allow writes from this side.
    #[error("{kind} {index} on object {object} is not writable from this side")]
    NotWritable {
        /// Object being addressed.
        object: ObjectId,
        /// Element category.
        kind: ElementKind,
        /// Element index.
        index: u8,
    },
}

/// Errors raised while registering an object template.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    /// A category holds more elements than a single count byte can address.
    #[error("asset {asset_id:?} declares {count} {kind} elements (max 255)")]
    TooManyElements {
        /// Offending asset.
        asset_id: String,
        /// Element category.
        kind: ElementKind,
        /// Number of declared elements.
        count: usize,
    },

    /// Two different asset ids reduce to the same wire hash.
    #[error("asset {asset_id:?} collides with {existing:?} on hash {hash}")]
    HashCollision {
        /// Asset being registered.
        asset_id: String,
        /// Asset already registered under the hash.
        existing: String,
        /// Shared hash.
        hash: AssetHash,
    },

    /// No template is registered under this hash.
    #[error("unknown asset hash {0}")]
    UnknownAsset(AssetHash),
}

/// Reasons an inbound record was dropped instead of applied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// The addressed object or element could not be resolved.
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// A spawn named a template this process does not know.
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// A list operation did not fit the list.
    #[error(transparent)]
    List(#[from] ListError),

    /// The record type is never accepted from this peer.
    #[error("unexpected {kind} record")]
    Unexpected {
        /// Record type name.
        kind: &'static str,
    },

    /// A spawn for an id that already has a replica.
    #[error("object {0} is already spawned")]
    DuplicateSpawn(ObjectId),
}

/// Reasons an action could not start.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActionError {
    /// The action's cooldown has not elapsed yet.
    #[error("{kind:?} is cooling down for another {remaining:?}")]
    CoolingDown {
        /// Action being started.
        kind: crate::action::ActionKind,
        /// Time left until it may start again.
        remaining: std::time::Duration,
    },

    /// The plan has no triggers to play.
    #[error("{0:?} plan has no triggers")]
    EmptyPlan(crate::action::ActionKind),
}

/// Reasons a party or guild operation was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SocialError {
    /// The player already belongs to a group of this kind.
    #[error("{member} is already in a {kind:?}")]
    AlreadyMember {
        /// Player.
        member: ConnectionId,
        /// Group kind.
        kind: crate::social::GroupKind,
    },

    /// The player is not in a group of this kind.
    #[error("{member} is not in a {kind:?}")]
    NotMember {
        /// Player.
        member: ConnectionId,
        /// Group kind.
        kind: crate::social::GroupKind,
    },

    /// Only the leader may do this.
    #[error("{0} is not the group leader")]
    NotLeader(ConnectionId),

    /// No group with this id exists.
    #[error("unknown {kind:?} {group_id}")]
    UnknownGroup {
        /// Group kind.
        kind: crate::social::GroupKind,
        /// Group id.
        group_id: u32,
    },

    /// The group has reached its member cap.
    #[error("{kind:?} {group_id} is full ({capacity} members)")]
    Full {
        /// Group kind.
        kind: crate::social::GroupKind,
        /// Group id.
        group_id: u32,
        /// Member cap.
        capacity: usize,
    },

    /// The player has no pending invitation of this kind.
    #[error("{0} has no pending invitation")]
    NoInvitation(ConnectionId),
}
