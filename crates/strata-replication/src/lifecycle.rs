//! Spawn, destroy and scene loading on the authoritative side.

use tracing::{debug, info, warn};

use crate::context::ReplicationContext;
use crate::dispatch::ReplicationEvent;
use crate::identity::{DestroyReason, NetworkObject, ObjectId, SpawnRequest};
use crate::messages::{DestroyObject, ReplicationMessage};
use crate::ownership::ConnectionId;
use crate::transport::SceneHost;

impl ReplicationContext {
    /// Allocates the next free object id.
    pub fn assign_object_id(&mut self) -> ObjectId {
        self.registry.assign_object_id()
    }

    /// Instantiates a registered template.
    ///
    /// The id is allocated unless the request names one, in which case a
    /// reserved or live id fails the spawn. The behaviour list is resolved
    /// into the element table here, once. A connection owner gets the object
    /// in its owned set (the first one becomes its controlled object) and is
    /// subscribed to it; every other interested connection is then notified.
    pub fn spawn(&mut self, request: SpawnRequest) -> Option<ObjectId> {
        if !self.role.is_server {
            warn!(asset_id = %request.asset_id, "spawn called on a non-authoritative context");
            return None;
        }
        let Some(template) = self.templates.by_asset(&request.asset_id) else {
            warn!(asset_id = %request.asset_id, "spawn of unregistered asset");
            return None;
        };

        let object_id = match request.object_id {
            Some(ObjectId::UNASSIGNED) => {
                warn!(asset_id = %request.asset_id, "spawn with reserved object id 0");
                return None;
            }
            Some(id) if self.registry.contains(id) => {
                warn!(%id, asset_id = %request.asset_id, "spawn with an id that is already live");
                return None;
            }
            Some(id) => id,
            None => self.registry.assign_object_id(),
        };

        let mut object = NetworkObject::new(object_id, template);
        object.owner = request.owner;
        object.position = request.position;
        object.rotation = request.rotation;
        object.is_scene_object = request.is_scene_object;
        object.sub_channel_id = request.sub_channel_id;
        object.is_hide = request.is_hide;
        object.is_spawned = true;
        if !self.registry.insert(object) {
            warn!(%object_id, "registry refused object");
            return None;
        }
        debug!(%object_id, asset_id = %request.asset_id, owner = %request.owner, "object spawned");
        self.events.push(ReplicationEvent::Spawned { object_id });

        if let Some(connection) = request.owner.connection() {
            self.attach_to_owner(connection, object_id);
        }
        self.notify_new_object(object_id);
        Some(object_id)
    }

    /// Owner bookkeeping for a fresh object.
    fn attach_to_owner(&mut self, connection: ConnectionId, object_id: ObjectId) {
        let had_controlled = self
            .connections
            .get(&connection)
            .is_some_and(|c| c.controlled_object.is_some());
        self.claim_owned(connection, object_id);
        let now_controls = self
            .connections
            .get(&connection)
            .is_some_and(|c| c.controlled_object == Some(object_id));
        if !had_controlled && now_controls {
            self.refresh_connection_interest(connection);
        } else {
            self.ensure_owner_subscribed(connection, object_id);
        }
    }

    /// Tears an object down.
    ///
    /// Every subscriber drops it from its view and receives a destroy record
    /// carrying `reason`; owner bookkeeping and the object's own subscribing
    /// set are cleared before it leaves the registry. Returns `false` when the
    /// object is unknown or already being destroyed.
    pub fn destroy(&mut self, object_id: ObjectId, reason: DestroyReason) -> bool {
        let Some(object) = self.registry.get_mut(object_id) else {
            debug!(%object_id, "destroy of unknown object");
            return false;
        };
        if object.is_destroyed {
            return false;
        }
        object.is_destroyed = true;
        let owner = object.owner;
        let mut subscribers: Vec<ConnectionId> = object.subscribers.iter().copied().collect();
        subscribers.sort_unstable();

        let message = ReplicationMessage::Destroy(DestroyObject { object_id, reason });
        for connection in subscribers {
            if let Some(controlled) = self.connections.get(&connection).and_then(|c| c.controlled_object)
                && let Some(observer) = self.registry.get_mut(controlled)
            {
                observer.subscribing.remove(&object_id);
            }
            self.remove_subscriber(object_id, connection);
            self.enqueue(connection, message.clone());
        }

        if let Some(connection) = owner.connection() {
            self.release_owned(connection, object_id);
        }

        // Whatever view the object still carries belongs to its owner.
        let observed = self
            .registry
            .get_mut(object_id)
            .map(|o| std::mem::take(&mut o.subscribing))
            .unwrap_or_default();
        if let Some(connection) = owner.connection() {
            for observed_id in observed {
                self.remove_subscriber(observed_id, connection);
            }
        }

        self.hits.forget(object_id);
        self.registry.remove(object_id);
        info!(%object_id, reason = reason.0, "object destroyed");
        self.events.push(ReplicationEvent::Destroyed { object_id, reason });
        true
    }

    /// Spawns every scene-placed object of `host`. Returns the number spawned.
    ///
    /// Descriptors are sorted by scene path. With id reordering enabled they
    /// receive ids `1..=n` in that order, so every process loading the same
    /// scene agrees on them; otherwise baked ids are kept and the rest are
    /// allocated after them.
    pub fn load_scene(&mut self, host: &dyn SceneHost) -> usize {
        let mut descriptors = host.scene_objects();
        descriptors.sort_by(|a, b| a.scene_path.cmp(&b.scene_path));
        let reorder = self.interest_config.reorder_scene_object_ids;

        let mut order: Vec<_> = descriptors.into_iter().enumerate().collect();
        if !reorder {
            // Baked ids first, so allocation seeds past all of them.
            order.sort_by_key(|(_, d)| d.object_id.is_none());
        }

        let mut spawned = 0;
        for (position, descriptor) in order {
            let object_id = if reorder {
                Some(ObjectId(position as u32 + 1))
            } else {
                descriptor.object_id
            };
            let mut request = SpawnRequest::new(descriptor.asset_id)
                .at(descriptor.position)
                .rotated(descriptor.rotation);
            request.object_id = object_id;
            request.is_scene_object = true;
            match self.spawn(request) {
                Some(_) => spawned += 1,
                None => warn!(scene_path = %descriptor.scene_path, "scene object skipped"),
            }
        }
        info!(spawned, reorder, "scene loaded");
        spawned
    }
}
