//! Narrow interfaces to the collaborators this crate does not implement:
//! message delivery, scene enumeration and the authoritative clock.
//!
//! In-memory implementations ([`LoopbackTransport`], [`StaticScene`],
//! [`ManualClock`]) back the tests and the headless server.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use glam::{Quat, Vec3};

use crate::identity::ObjectId;
use crate::ownership::ConnectionId;

// ---------------------------------------------------------------------------
// MessageTransport
// ---------------------------------------------------------------------------

/// Delivery guarantee requested for one datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMethod {
    /// Delivered exactly once, in send order.
    ReliableOrdered,
    /// Delivered exactly once, in any order.
    ReliableUnordered,
    /// Best effort.
    Unreliable,
}

/// Sends encoded batches to peers.
pub trait MessageTransport {
    /// Unicast `payload` to `to`.
    fn send(&mut self, to: ConnectionId, delivery: DeliveryMethod, payload: &[u8]);

    /// Multicast `payload` to every connection in `to`.
    fn send_many(&mut self, to: &[ConnectionId], delivery: DeliveryMethod, payload: &[u8]) {
        for &connection in to {
            self.send(connection, delivery, payload);
        }
    }
}

/// One datagram captured by [`LoopbackTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    /// Recipient.
    pub to: ConnectionId,
    /// Requested guarantee.
    pub delivery: DeliveryMethod,
    /// Encoded batch.
    pub payload: Vec<u8>,
}

/// Transport that queues datagrams in memory for the caller to route.
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    outbox: VecDeque<Datagram>,
    bytes_sent: u64,
}

impl LoopbackTransport {
    /// Empty transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes every queued datagram in send order.
    pub fn drain(&mut self) -> Vec<Datagram> {
        self.outbox.drain(..).collect()
    }

    /// Takes the queued payloads addressed to `connection`, leaving the rest.
    pub fn drain_for(&mut self, connection: ConnectionId) -> Vec<Vec<u8>> {
        let (mine, rest): (VecDeque<Datagram>, VecDeque<Datagram>) =
            self.outbox.drain(..).partition(|d| d.to == connection);
        self.outbox = rest;
        mine.into_iter().map(|d| d.payload).collect()
    }

    /// Datagrams waiting.
    pub fn len(&self) -> usize {
        self.outbox.len()
    }

    /// `true` when nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.outbox.is_empty()
    }

    /// Total payload bytes ever sent.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }
}

impl MessageTransport for LoopbackTransport {
    fn send(&mut self, to: ConnectionId, delivery: DeliveryMethod, payload: &[u8]) {
        self.bytes_sent += payload.len() as u64;
        self.outbox.push_back(Datagram {
            to,
            delivery,
            payload: payload.to_vec(),
        });
    }
}

// ---------------------------------------------------------------------------
// SceneHost
// ---------------------------------------------------------------------------

/// One object placed in a scene.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneObjectDescriptor {
    /// Hierarchy path inside the scene; the deterministic sort key.
    pub scene_path: String,
    /// Asset to instantiate.
    pub asset_id: String,
    /// Id baked into the scene, if any.
    pub object_id: Option<ObjectId>,
    /// Placement.
    pub position: Vec3,
    /// Orientation.
    pub rotation: Quat,
}

/// Enumerates scene-placed objects at world load.
pub trait SceneHost {
    /// Every placed object, in any order.
    fn scene_objects(&self) -> Vec<SceneObjectDescriptor>;
}

/// A scene held in memory.
#[derive(Debug, Clone, Default)]
pub struct StaticScene {
    /// Placed objects.
    pub objects: Vec<SceneObjectDescriptor>,
}

impl SceneHost for StaticScene {
    fn scene_objects(&self) -> Vec<SceneObjectDescriptor> {
        self.objects.clone()
    }
}

// ---------------------------------------------------------------------------
// AuthoritativeClock
// ---------------------------------------------------------------------------

/// Source of authoritative millisecond timestamps.
pub trait AuthoritativeClock: Send + Sync {
    /// Current time in milliseconds.
    fn now_ms(&self) -> i64;
}

/// Wall-clock time since the Unix epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl AuthoritativeClock for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    /// Clock reading `start_ms`.
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(start_ms),
        }
    }

    /// Jumps to `ms`.
    pub fn set(&self, ms: i64) {
        self.now.store(ms, Ordering::SeqCst);
    }

    /// Moves forward by `ms`.
    pub fn advance(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl AuthoritativeClock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}
