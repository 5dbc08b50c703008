//! Wire records exchanged between the authority and observers.
//!
//! Field order inside each record is part of the wire format. Records are
//! encoded with [`postcard`] (ids as varints) and batched per tick by the
//! [`channel`](crate::channel) codec.

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

use crate::identity::{AssetHash, DestroyReason, ObjectId};
use crate::sync::ListOp;

/// Maximum entries in any per-message collection (one count byte).
pub const MAX_ITEMS_PER_MESSAGE: usize = 255;

// ---------------------------------------------------------------------------
// Top-level enum
// ---------------------------------------------------------------------------

/// One replication record. The enum discriminant is the type tag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ReplicationMessage {
    /// An object entered the receiver's view.
    Spawn(SpawnObject),
    /// An object left the receiver's view.
    Destroy(DestroyObject),
    /// A field changed.
    FieldDelta(FieldDelta),
    /// A list changed.
    ListOperation(ListOperation),
    /// Full list contents for a new subscriber.
    InitialList(InitialList),
    /// A remote function invocation.
    FunctionCall(FunctionCall),
    /// A client reports a resolved hit.
    HitClaim(HitClaim),
    /// An object changed owner.
    OwnerChange(OwnerChange),
}

// ---------------------------------------------------------------------------
// Payload structs
// ---------------------------------------------------------------------------

/// One field value carried inside a spawn record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldValue {
    /// Field index.
    pub element_index: u8,
    /// Serialized value.
    pub payload: Vec<u8>,
}

/// Spawn announcement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpawnObject {
    /// Template reference.
    pub asset_hash: AssetHash,
    /// Object id.
    pub object_id: ObjectId,
    /// Owner, `-1` for host-owned.
    pub owner_connection_id: i64,
    /// Spawn position.
    pub position: Vec3,
    /// Spawn rotation.
    pub rotation: Quat,
    /// Values of every field that syncs initially and is visible to the receiver.
    pub initial_fields: Vec<FieldValue>,
}

/// Removal from the receiver's view.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DestroyObject {
    /// Object id.
    pub object_id: ObjectId,
    /// Why the object left.
    pub reason: DestroyReason,
}

/// New value of one field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldDelta {
    /// Object id.
    pub object_id: ObjectId,
    /// Field index.
    pub element_index: u8,
    /// Serialized value.
    pub payload: Vec<u8>,
}

/// One list operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListOperation {
    /// Object id.
    pub object_id: ObjectId,
    /// List index.
    pub element_index: u8,
    /// Operation kind.
    pub op: ListOp,
    /// Item index for `Set`, `Remove` and `Insert`.
    pub index: Option<i32>,
    /// Item payload for `Add`, `Set` and `Insert`.
    pub payload: Option<Vec<u8>>,
}

/// Whole contents of one list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InitialList {
    /// Object id.
    pub object_id: ObjectId,
    /// List index.
    pub element_index: u8,
    /// Serialized items.
    pub items: Vec<Vec<u8>>,
}

/// Remote function invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    /// Object id.
    pub object_id: ObjectId,
    /// Function index.
    pub element_index: u8,
    /// The caller also ran the call locally.
    pub hook_callback: bool,
    /// Serialized arguments.
    pub payload: Vec<u8>,
}

/// A client's report of a resolved hit, judged against the matching
/// hit registration record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HitClaim {
    /// Attacking object.
    pub attacker_object_id: ObjectId,
    /// Seed of the attack attempt.
    pub simulate_seed: i32,
    /// Trigger within the attack.
    pub trigger_index: u8,
    /// Spread (pellet) within the trigger.
    pub spread_index: u8,
    /// Client-side launch time (ms).
    pub launch_timestamp: i64,
    /// Client-side hit time (ms).
    pub hit_timestamp: i64,
    /// Where the projectile started.
    pub origin: Vec3,
    /// Unit launch direction.
    pub direction: Vec3,
    /// Declared aim destination, if any.
    pub hit_destination: Option<Vec3>,
    /// Object that was hit.
    pub target_object_id: ObjectId,
    /// Hitbox of the target that was hit.
    pub hitbox_index: u8,
}

/// Ownership change notice.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OwnerChange {
    /// Object id.
    pub object_id: ObjectId,
    /// New owner, `-1` for host-owned.
    pub owner_connection_id: i64,
}

impl ReplicationMessage {
    /// Record type name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Spawn(_) => "spawn",
            Self::Destroy(_) => "destroy",
            Self::FieldDelta(_) => "field_delta",
            Self::ListOperation(_) => "list_operation",
            Self::InitialList(_) => "initial_list",
            Self::FunctionCall(_) => "function_call",
            Self::HitClaim(_) => "hit_claim",
            Self::OwnerChange(_) => "owner_change",
        }
    }

    /// Object the record is about (the attacker for hit claims).
    pub fn object_id(&self) -> ObjectId {
        match self {
            Self::Spawn(m) => m.object_id,
            Self::Destroy(m) => m.object_id,
            Self::FieldDelta(m) => m.object_id,
            Self::ListOperation(m) => m.object_id,
            Self::InitialList(m) => m.object_id,
            Self::FunctionCall(m) => m.object_id,
            Self::HitClaim(m) => m.attacker_object_id,
            Self::OwnerChange(m) => m.object_id,
        }
    }

    /// Checks the single-byte count limits.
    pub fn validate(&self) -> Result<(), MessageError> {
        let count = match self {
            Self::Spawn(m) => m.initial_fields.len(),
            Self::InitialList(m) => m.items.len(),
            _ => 0,
        };
        if count > MAX_ITEMS_PER_MESSAGE {
            return Err(MessageError::TooManyItems(count));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised while encoding or decoding replication traffic.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    /// Postcard serialization failed.
    #[error("serialization failed: {0}")]
    Serialize(postcard::Error),
    /// Postcard deserialization failed.
    #[error("deserialization failed: {0}")]
    Deserialize(postcard::Error),
    /// The batch was produced by an incompatible protocol version.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),
    /// The batch carried no bytes at all.
    #[error("empty batch")]
    EmptyPayload,
    /// Unknown compression flag byte.
    #[error("unknown compression flag: 0x{0:02X}")]
    UnknownFlag(u8),
    /// LZ4 decompression failed.
    #[error("LZ4 decompression failed: {0}")]
    DecompressFailed(String),
    /// A collection exceeds its single-byte count.
    #[error("{0} items exceed the per-message limit of 255")]
    TooManyItems(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_with_fields(count: usize) -> ReplicationMessage {
        ReplicationMessage::Spawn(SpawnObject {
            asset_hash: AssetHash(7),
            object_id: ObjectId(3),
            owner_connection_id: -1,
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            initial_fields: (0..count)
                .map(|i| FieldValue {
                    element_index: i as u8,
                    payload: vec![1],
                })
                .collect(),
        })
    }

    #[test]
    fn test_object_id_of_each_record() {
        assert_eq!(spawn_with_fields(0).object_id(), ObjectId(3));
        let claim = ReplicationMessage::HitClaim(HitClaim {
            attacker_object_id: ObjectId(5),
            simulate_seed: 42,
            trigger_index: 0,
            spread_index: 0,
            launch_timestamp: 0,
            hit_timestamp: 500,
            origin: Vec3::ZERO,
            direction: Vec3::X,
            hit_destination: None,
            target_object_id: ObjectId(9),
            hitbox_index: 0,
        });
        assert_eq!(claim.object_id(), ObjectId(5));
    }

    #[test]
    fn test_validate_count_limit() {
        assert!(spawn_with_fields(255).validate().is_ok());
        assert!(matches!(
            spawn_with_fields(256).validate(),
            Err(MessageError::TooManyItems(256))
        ));
    }

    #[test]
    fn test_small_ids_encode_as_single_byte_varints() {
        let delta = FieldDelta {
            object_id: ObjectId(5),
            element_index: 2,
            payload: vec![],
        };
        let bytes = postcard::to_allocvec(&delta).unwrap();
        // object id, element index, payload length
        assert_eq!(bytes, vec![5, 2, 0]);
    }
}
