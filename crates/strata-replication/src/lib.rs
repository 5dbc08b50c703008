//! Server-authoritative entity replication: object identity and lifecycle,
//! ownership, interest management, per-field state sync, remote calls and
//! lag-compensated hit validation.
//!
//! All per-world state lives on a [`ReplicationContext`]. Peers exchange
//! [`ReplicationMessage`] batches over a [`MessageTransport`]; the context
//! decides who sees what and which writes are allowed.

pub mod action;
pub mod behaviour;
pub mod channel;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod hitreg;
pub mod identity;
pub mod interest;
pub mod lifecycle;
pub mod messages;
pub mod ownership;
pub mod projectile;
pub mod social;
pub mod sync;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use action::{ActionController, ActionEvent, ActionId, ActionKind, ActionOutcome, ActionPlan, ActionState};
pub use behaviour::{BehaviourDef, ElementKind, SyncBehaviour, SyncMode};
pub use context::{Connection, ReplicationContext};
pub use dispatch::{CallTarget, ReceivedCall, ReplicationEvent, SERVER_PEER};
pub use error::{ActionError, DispatchError, ResolveError, SocialError, TemplateError};
pub use hitreg::{
    HitRegistration, HitRegistry, HitRejection, ValidatedHit, WeaponProfile, validate_projectile,
};
pub use identity::{
    AssetHash, DestroyReason, Hitbox, NetworkObject, ObjectId, ObjectTemplate, SpawnRequest,
    compute_asset_hash,
};
pub use interest::{GlobalInterest, InterestPolicy, ProximityInterest, should_hide};
pub use messages::{HitClaim, MessageError, ReplicationMessage};
pub use ownership::{ConnectionId, LocalRole, OwnerId};
pub use projectile::{ProjectileEvent, ProjectileParams, ProjectilePool, ProjectileState, SweepTarget};
pub use social::{GroupKind, SocialRegistry};
pub use transport::{
    AuthoritativeClock, DeliveryMethod, LoopbackTransport, ManualClock, MessageTransport,
    SceneHost, StaticScene, SystemClock,
};
