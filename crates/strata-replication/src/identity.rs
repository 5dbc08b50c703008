//! Object identity: ids, asset hashes, templates, and the live object registry.
//!
//! The registry is an id-keyed arena. Connections, subscriptions and hit
//! records refer to objects only by [`ObjectId`], so an object's lifetime is
//! governed by its registry entry alone.

use std::fmt;

use glam::{Quat, Vec3};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::behaviour::{BehaviourDef, ElementTable, validate_behaviours};
use crate::error::{ResolveError, TemplateError};
use crate::ownership::{ConnectionId, OwnerId};

// ---------------------------------------------------------------------------
// ObjectId / AssetHash
// ---------------------------------------------------------------------------

/// Unique handle of one live replicated object. `0` is never assigned.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u32);

impl ObjectId {
    /// The reserved "no object" id.
    pub const UNASSIGNED: ObjectId = ObjectId(0);
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 32-bit reduction of an asset id. This, not the string, names the template
/// in spawn messages.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AssetHash(pub i32);

impl fmt::Display for AssetHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Deterministic two-accumulator DJB2 hash over the UTF-16 code units of
/// `asset_id`.
///
/// Even-indexed units fold into the first accumulator and odd-indexed units
/// into the second; a NUL unit terminates the input. All arithmetic wraps.
pub fn compute_asset_hash(asset_id: &str) -> AssetHash {
    let units: Vec<u16> = asset_id.encode_utf16().collect();
    let mut h1: i32 = 5381;
    let mut h2: i32 = 5381;

    let mut i = 0;
    while i < units.len() && units[i] != 0 {
        h1 = (h1 << 5).wrapping_add(h1) ^ i32::from(units[i]);
        if i == units.len() - 1 || units[i + 1] == 0 {
            break;
        }
        h2 = (h2 << 5).wrapping_add(h2) ^ i32::from(units[i + 1]);
        i += 2;
    }

    AssetHash(h1.wrapping_add(h2.wrapping_mul(1_566_083_941)))
}

/// Why an object left a connection's view. Carried as one byte on the wire;
/// values above the predefined ones are free for gameplay reasons.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DestroyReason(pub u8);

impl DestroyReason {
    /// Explicit destroy request.
    pub const REQUESTED_TO_DESTROY: DestroyReason = DestroyReason(0);
    /// The observer's interest no longer includes the object.
    pub const REMOVED_FROM_SUBSCRIBING: DestroyReason = DestroyReason(1);
    /// The owning connection went away.
    pub const OWNER_DISCONNECTED: DestroyReason = DestroyReason(2);
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

/// Axis-aligned hit volume relative to the object's position.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Hitbox {
    /// Offset from the object position.
    pub center: Vec3,
    /// Half size on each axis.
    pub half_extents: Vec3,
}

impl Hitbox {
    /// A cube of half size `half`.
    pub fn cube(half: f32) -> Self {
        Self {
            center: Vec3::ZERO,
            half_extents: Vec3::splat(half),
        }
    }

    /// Largest half extent, the slack granted to hit claims on this box.
    pub fn max_extent(&self) -> f32 {
        self.half_extents.max_element()
    }
}

/// Everything needed to build an object of one asset.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectTemplate {
    /// Stable asset identifier.
    pub asset_id: String,
    /// Behaviours in declaration order.
    pub behaviours: Vec<BehaviourDef>,
    /// Hit volumes addressed by hit claims.
    pub hitboxes: Vec<Hitbox>,
}

impl ObjectTemplate {
    /// Template with no behaviours and no hitboxes.
    pub fn new(asset_id: impl Into<String>) -> Self {
        Self {
            asset_id: asset_id.into(),
            behaviours: Vec::new(),
            hitboxes: Vec::new(),
        }
    }

    /// Appends a behaviour.
    pub fn with_behaviour(mut self, behaviour: BehaviourDef) -> Self {
        self.behaviours.push(behaviour);
        self
    }

    /// Appends a hitbox.
    pub fn with_hitbox(mut self, hitbox: Hitbox) -> Self {
        self.hitboxes.push(hitbox);
        self
    }
}

/// Templates known to this process, keyed by asset hash.
#[derive(Debug, Default)]
pub struct TemplateRegistry {
    templates: FxHashMap<AssetHash, ObjectTemplate>,
}

impl TemplateRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `template`, replacing an earlier registration of the same
    /// asset id. Fails when an element category exceeds 255 entries or when a
    /// different asset already owns the hash.
    pub fn register(&mut self, template: ObjectTemplate) -> Result<AssetHash, TemplateError> {
        validate_behaviours(&template.asset_id, &template.behaviours)?;
        let hash = compute_asset_hash(&template.asset_id);
        if let Some(existing) = self.templates.get(&hash)
            && existing.asset_id != template.asset_id
        {
            return Err(TemplateError::HashCollision {
                asset_id: template.asset_id,
                existing: existing.asset_id.clone(),
                hash,
            });
        }
        self.templates.insert(hash, template);
        Ok(hash)
    }

    /// Template registered under `hash`.
    pub fn get(&self, hash: AssetHash) -> Result<&ObjectTemplate, TemplateError> {
        self.templates.get(&hash).ok_or(TemplateError::UnknownAsset(hash))
    }

    /// Template registered for `asset_id`.
    pub fn by_asset(&self, asset_id: &str) -> Option<&ObjectTemplate> {
        self.templates.get(&compute_asset_hash(asset_id))
    }

    /// Number of registered templates.
    pub fn len(&self) -> usize {
        self.templates.len()
    }

    /// `true` when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

// ---------------------------------------------------------------------------
// SpawnRequest
// ---------------------------------------------------------------------------

/// Parameters of one spawn.
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnRequest {
    /// Asset to instantiate; must be registered.
    pub asset_id: String,
    /// Initial position.
    pub position: Vec3,
    /// Initial rotation.
    pub rotation: Quat,
    /// Owner of the new object.
    pub owner: OwnerId,
    /// Explicit id; allocated when `None`.
    pub object_id: Option<ObjectId>,
    /// Placed in a scene rather than spawned at runtime.
    pub is_scene_object: bool,
    /// Visibility partition.
    pub sub_channel_id: String,
    /// Starts hidden.
    pub is_hide: bool,
}

impl SpawnRequest {
    /// Host-owned spawn of `asset_id` at the origin.
    pub fn new(asset_id: impl Into<String>) -> Self {
        Self {
            asset_id: asset_id.into(),
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            owner: OwnerId::HOST,
            object_id: None,
            is_scene_object: false,
            sub_channel_id: String::new(),
            is_hide: false,
        }
    }

    /// Sets the position.
    pub fn at(mut self, position: Vec3) -> Self {
        self.position = position;
        self
    }

    /// Sets the rotation.
    pub fn rotated(mut self, rotation: Quat) -> Self {
        self.rotation = rotation;
        self
    }

    /// Sets the owner.
    pub fn owned_by(mut self, owner: OwnerId) -> Self {
        self.owner = owner;
        self
    }

    /// Requests a specific id.
    pub fn with_object_id(mut self, object_id: ObjectId) -> Self {
        self.object_id = Some(object_id);
        self
    }

    /// Places the object in a sub-channel.
    pub fn in_sub_channel(mut self, sub_channel_id: impl Into<String>) -> Self {
        self.sub_channel_id = sub_channel_id.into();
        self
    }

    /// Starts the object hidden.
    pub fn hidden(mut self) -> Self {
        self.is_hide = true;
        self
    }
}

// ---------------------------------------------------------------------------
// NetworkObject
// ---------------------------------------------------------------------------

/// One replicated entity.
#[derive(Debug, Clone)]
pub struct NetworkObject {
    pub(crate) object_id: ObjectId,
    pub(crate) asset_id: String,
    pub(crate) asset_hash: AssetHash,
    pub(crate) owner: OwnerId,
    pub(crate) is_spawned: bool,
    pub(crate) is_destroyed: bool,
    pub(crate) is_scene_object: bool,
    pub(crate) subscribers: FxHashSet<ConnectionId>,
    pub(crate) subscribing: FxHashSet<ObjectId>,
    /// Hidden from observers unless an exception applies.
    pub is_hide: bool,
    /// Connections that see this object even while hidden.
    pub hide_exceptions: FxHashSet<ConnectionId>,
    /// Visibility partition; objects only see objects in the same one.
    pub sub_channel_id: String,
    /// World position.
    pub position: Vec3,
    /// World rotation.
    pub rotation: Quat,
    /// Hit volumes from the template.
    pub hitboxes: Vec<Hitbox>,
    pub(crate) elements: ElementTable,
}

impl NetworkObject {
    /// Builds an unregistered object of `template`, resolving its behaviour
    /// list into the element table.
    pub fn new(object_id: ObjectId, template: &ObjectTemplate) -> Self {
        Self {
            object_id,
            asset_id: template.asset_id.clone(),
            asset_hash: compute_asset_hash(&template.asset_id),
            owner: OwnerId::HOST,
            is_spawned: false,
            is_destroyed: false,
            is_scene_object: false,
            subscribers: FxHashSet::default(),
            subscribing: FxHashSet::default(),
            is_hide: false,
            hide_exceptions: FxHashSet::default(),
            sub_channel_id: String::new(),
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            hitboxes: template.hitboxes.clone(),
            elements: ElementTable::setup(object_id, &template.behaviours),
        }
    }

    /// Object id.
    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    /// Asset id.
    pub fn asset_id(&self) -> &str {
        &self.asset_id
    }

    /// Wire hash of the asset id.
    pub fn asset_hash(&self) -> AssetHash {
        self.asset_hash
    }

    /// Current owner.
    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    /// Registered and announced.
    pub fn is_spawned(&self) -> bool {
        self.is_spawned
    }

    /// Teardown has begun.
    pub fn is_destroyed(&self) -> bool {
        self.is_destroyed
    }

    /// Placed in a scene.
    pub fn is_scene_object(&self) -> bool {
        self.is_scene_object
    }

    /// Connections receiving this object's updates.
    pub fn subscribers(&self) -> &FxHashSet<ConnectionId> {
        &self.subscribers
    }

    /// Objects observed by the connection controlling this object.
    pub fn subscribing(&self) -> &FxHashSet<ObjectId> {
        &self.subscribing
    }

    /// Replicated elements.
    pub fn elements(&self) -> &ElementTable {
        &self.elements
    }

    /// Largest half extent of hitbox `index`, if it exists.
    pub fn hitbox_extent(&self, index: u8) -> Option<f32> {
        self.hitboxes.get(index as usize).map(Hitbox::max_extent)
    }
}

// ---------------------------------------------------------------------------
// ObjectRegistry
// ---------------------------------------------------------------------------

/// Every object known to this process.
#[derive(Debug, Default)]
pub struct ObjectRegistry {
    objects: FxHashMap<ObjectId, NetworkObject>,
    highest_object_id: u32,
    seeded: bool,
}

impl ObjectRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the next free id.
    ///
    /// The first call seeds the counter from the highest scene object id so
    /// runtime ids never collide with pre-placed ones. After a `u32` wrap the
    /// reserved id and ids that are still live are skipped.
    pub fn assign_object_id(&mut self) -> ObjectId {
        if !self.seeded {
            self.seeded = true;
            let scene_max = self
                .objects
                .values()
                .filter(|o| o.is_scene_object)
                .map(|o| o.object_id.0)
                .max()
                .unwrap_or(0);
            self.highest_object_id = self.highest_object_id.max(scene_max);
        }
        loop {
            self.highest_object_id = self.highest_object_id.wrapping_add(1);
            let candidate = ObjectId(self.highest_object_id);
            if candidate != ObjectId::UNASSIGNED && !self.objects.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    /// Highest id handed out so far.
    pub fn highest_object_id(&self) -> u32 {
        self.highest_object_id
    }

    /// Inserts `object`. Returns `false` and leaves the registry untouched when
    /// its id is reserved or already live.
    pub fn insert(&mut self, object: NetworkObject) -> bool {
        let id = object.object_id;
        if id == ObjectId::UNASSIGNED || self.objects.contains_key(&id) {
            return false;
        }
        if self.seeded && object.is_scene_object {
            self.highest_object_id = self.highest_object_id.max(id.0);
        }
        self.objects.insert(id, object);
        true
    }

    /// Removes and returns the object.
    pub fn remove(&mut self, id: ObjectId) -> Option<NetworkObject> {
        self.objects.remove(&id)
    }

    /// Object by id, destroyed or not.
    pub fn get(&self, id: ObjectId) -> Option<&NetworkObject> {
        self.objects.get(&id)
    }

    /// Mutable object by id.
    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut NetworkObject> {
        self.objects.get_mut(&id)
    }

    /// Object by id, only while it is not destroyed.
    pub fn get_live(&self, id: ObjectId) -> Option<&NetworkObject> {
        self.objects.get(&id).filter(|o| !o.is_destroyed)
    }

    /// `true` when `id` is registered.
    pub fn contains(&self, id: ObjectId) -> bool {
        self.objects.contains_key(&id)
    }

    /// Live object addressed by an incoming record.
    pub fn resolve(&self, id: ObjectId) -> Result<&NetworkObject, ResolveError> {
        let object = self.objects.get(&id).ok_or(ResolveError::UnknownObject(id))?;
        if object.is_destroyed {
            return Err(ResolveError::Destroyed(id));
        }
        if object.object_id != id {
            return Err(ResolveError::MismatchedObjectId {
                embedded: id,
                resolved: object.object_id,
            });
        }
        Ok(object)
    }

    /// Mutable form of [`resolve`](Self::resolve).
    pub fn resolve_mut(&mut self, id: ObjectId) -> Result<&mut NetworkObject, ResolveError> {
        self.resolve(id)?;
        self.objects.get_mut(&id).ok_or(ResolveError::UnknownObject(id))
    }

    /// All objects, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &NetworkObject> {
        self.objects.values()
    }

    /// All objects, mutably, in no particular order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut NetworkObject> {
        self.objects.values_mut()
    }

    /// All ids, sorted ascending.
    pub fn sorted_ids(&self) -> Vec<ObjectId> {
        let mut ids: Vec<ObjectId> = self.objects.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of registered objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// `true` when no object is registered.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Drops every object and resets the counter.
    pub fn clear(&mut self) {
        self.objects.clear();
        self.highest_object_id = 0;
        self.seeded = false;
    }
}
