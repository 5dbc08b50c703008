//! State synchronization dispatcher.
//!
//! Local writes to fields, lists and functions are turned into records on
//! the right peers' ordered streams; inbound batches are decoded, put back in
//! production order, resolved against the registry and applied. Anything
//! that cannot be resolved is logged and dropped: records routinely race an
//! object's teardown.

use serde::Serialize;
use serde::de::DeserializeOwned;
use strata_config::ChannelConfig;
use tracing::{debug, trace, warn};

use crate::behaviour::{ElementKind, SyncMode};
use crate::channel::{OrderedSender, decode_batch};
use crate::context::ReplicationContext;
use crate::error::{DispatchError, ResolveError};
use crate::hitreg::ValidatedHit;
use crate::identity::{DestroyReason, NetworkObject, ObjectId};
use crate::messages::{
    FieldDelta, FieldValue, FunctionCall, HitClaim, InitialList, ListOperation, ReplicationMessage, SpawnObject,
};
use crate::ownership::{ConnectionId, OwnerId};
use crate::sync::{ListOp, SyncField, SyncFunction, SyncList};
use crate::transport::{DeliveryMethod, MessageTransport};

/// Peer id under which a pure client addresses (and hears from) the authority.
pub const SERVER_PEER: ConnectionId = ConnectionId(u64::MAX);

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Who receives a remote function call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTarget {
    /// Every connection observing the object.
    AllSubscribers,
    /// The owning connection only.
    Owner,
    /// The authority.
    Server,
}

/// A function call delivered to this process.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedCall {
    /// Calling peer; the local peer id for hooked local calls.
    pub from: ConnectionId,
    /// Object the function belongs to.
    pub object_id: ObjectId,
    /// Function index.
    pub element_index: u8,
    /// The caller also ran the call locally.
    pub hook_callback: bool,
    /// Serialized arguments.
    pub payload: Vec<u8>,
}

impl ReceivedCall {
    /// Arguments decoded as `T`.
    pub fn args<T: DeserializeOwned>(&self) -> Option<T> {
        postcard::from_bytes(&self.payload).ok()
    }
}

/// Something gameplay code may want to react to, drained with
/// [`ReplicationContext::drain_events`].
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationEvent {
    /// An object was registered (spawned locally or replicated in).
    Spawned { object_id: ObjectId },
    /// An object left the registry.
    Destroyed { object_id: ObjectId, reason: DestroyReason },
    /// A connection started observing an object.
    SubscriberAdded { object_id: ObjectId, connection: ConnectionId },
    /// A connection stopped observing an object.
    SubscriberRemoved { object_id: ObjectId, connection: ConnectionId },
    /// Ownership moved.
    OwnerChanged {
        object_id: ObjectId,
        previous: OwnerId,
        owner: OwnerId,
    },
    /// A remote peer changed a field.
    FieldChanged { object_id: ObjectId, element_index: u8 },
    /// A remote peer changed a list.
    ListChanged { object_id: ObjectId, element_index: u8 },
    /// A function call arrived.
    FunctionCalled(ReceivedCall),
    /// A hit claim passed validation.
    HitAccepted(ValidatedHit),
}

// ---------------------------------------------------------------------------
// Element resolution
// ---------------------------------------------------------------------------

fn out_of_range(object: &NetworkObject, kind: ElementKind, index: u8) -> ResolveError {
    ResolveError::ElementOutOfRange {
        object: object.object_id(),
        kind,
        index,
        len: object.elements.len(kind),
    }
}

fn check_stamp(embedded: ObjectId, resolved: ObjectId) -> Result<(), ResolveError> {
    if embedded != resolved {
        return Err(ResolveError::MismatchedObjectId { embedded, resolved });
    }
    Ok(())
}

fn field_slot(object: &mut NetworkObject, embedded: ObjectId, index: u8) -> Result<&mut SyncField, ResolveError> {
    let missing = out_of_range(object, ElementKind::Field, index);
    let field = object.elements.field_mut(index).ok_or(missing)?;
    check_stamp(embedded, field.object_id())?;
    Ok(field)
}

fn list_slot(object: &mut NetworkObject, embedded: ObjectId, index: u8) -> Result<&mut SyncList, ResolveError> {
    let missing = out_of_range(object, ElementKind::List, index);
    let list = object.elements.list_mut(index).ok_or(missing)?;
    check_stamp(embedded, list.object_id())?;
    Ok(list)
}

fn function_slot(object: &NetworkObject, embedded: ObjectId, index: u8) -> Result<&SyncFunction, ResolveError> {
    let function = object
        .elements
        .function(index)
        .ok_or_else(|| out_of_range(object, ElementKind::Function, index))?;
    check_stamp(embedded, function.object_id())?;
    Ok(function)
}

fn sorted_subscribers(object: &NetworkObject) -> Vec<ConnectionId> {
    let mut subscribers: Vec<ConnectionId> = object.subscribers.iter().copied().collect();
    subscribers.sort_unstable();
    subscribers
}

/// Connections that receive an element update with `mode`.
fn recipients(mode: SyncMode, owner: OwnerId, subscribers: Vec<ConnectionId>) -> Vec<ConnectionId> {
    match mode {
        SyncMode::ServerToClients | SyncMode::ClientMulticast => subscribers,
        SyncMode::ServerToOwner => subscribers
            .into_iter()
            .filter(|c| owner.connection() == Some(*c))
            .collect(),
    }
}

fn encode<T: Serialize>(value: &T) -> Option<Vec<u8>> {
    match postcard::to_allocvec(value) {
        Ok(bytes) => Some(bytes),
        Err(error) => {
            warn!(%error, "value could not be serialized");
            None
        }
    }
}

/// Encodes and sends one connection's queue. Returns the records sent.
fn send_queue(
    transport: &mut dyn MessageTransport,
    to: ConnectionId,
    sender: &mut OrderedSender,
    config: &ChannelConfig,
) -> usize {
    match sender.flush(config) {
        Ok((_, 0)) => 0,
        Ok((bytes, records)) => {
            trace!(%to, records, bytes = bytes.len(), "batch sent");
            transport.send(to, DeliveryMethod::ReliableOrdered, &bytes);
            records
        }
        Err(error) => {
            warn!(%to, %error, "batch dropped");
            0
        }
    }
}

impl ReplicationContext {
    // --- Outbound queues ---

    /// Queues a record for `connection`. The listen server's own player
    /// shares this process's state and never receives records.
    pub(crate) fn enqueue(&mut self, connection: ConnectionId, message: ReplicationMessage) {
        if self.role.is_local_player(connection) {
            return;
        }
        match self.connections.get_mut(&connection) {
            Some(conn) => conn.link.sender.enqueue(message),
            None => debug!(%connection, kind = message.kind(), "record for unknown connection dropped"),
        }
    }

    fn enqueue_to_server(&mut self, message: ReplicationMessage) {
        self.server_link.sender.enqueue(message);
    }

    /// Routes an element update: fans out to `recipients` on the authority,
    /// goes upstream on a client.
    fn fan_out(
        &mut self,
        mode: SyncMode,
        owner: OwnerId,
        subscribers: Vec<ConnectionId>,
        except: Option<ConnectionId>,
        message: ReplicationMessage,
    ) {
        if !self.role.is_server {
            self.enqueue_to_server(message);
            return;
        }
        for connection in recipients(mode, owner, subscribers) {
            if Some(connection) != except {
                self.enqueue(connection, message.clone());
            }
        }
    }

    /// This process's id in [`ReceivedCall::from`] for local calls.
    fn local_peer(&self) -> ConnectionId {
        match self.role.local_connection {
            Some(connection) if !self.role.is_server => connection,
            _ => SERVER_PEER,
        }
    }

    /// Queues the records a new subscriber needs: the spawn with every
    /// initially synced field, then deferred fields as targeted deltas, then
    /// one burst per non-empty list. Owner-only elements go to the owner only.
    pub(crate) fn send_spawn_sequence(&mut self, connection: ConnectionId, object_id: ObjectId) {
        let Some(object) = self.registry.get_live(object_id) else {
            return;
        };
        let to_owner = object.is_owned_by_connection(connection);
        let visible = |mode: SyncMode| mode != SyncMode::ServerToOwner || to_owner;

        let fields = object.elements.fields();
        let initial_fields = fields
            .iter()
            .filter(|f| f.syncs_initially() && visible(f.mode()))
            .map(|f| FieldValue {
                element_index: f.index(),
                payload: f.value().to_vec(),
            })
            .collect();
        let mut records = vec![ReplicationMessage::Spawn(SpawnObject {
            asset_hash: object.asset_hash,
            object_id,
            owner_connection_id: object.owner.0,
            position: object.position,
            rotation: object.rotation,
            initial_fields,
        })];
        records.extend(
            fields
                .iter()
                .filter(|f| !f.syncs_initially() && visible(f.mode()))
                .map(|f| {
                    ReplicationMessage::FieldDelta(FieldDelta {
                        object_id,
                        element_index: f.index(),
                        payload: f.value().to_vec(),
                    })
                }),
        );
        records.extend(
            object
                .elements
                .lists()
                .iter()
                .filter(|l| !l.is_empty() && visible(l.mode()))
                .map(|l| {
                    ReplicationMessage::InitialList(InitialList {
                        object_id,
                        element_index: l.index(),
                        items: l.items().to_vec(),
                    })
                }),
        );

        for record in records {
            self.enqueue(connection, record);
        }
    }

    // --- Fields ---

    /// Current value of a field.
    pub fn field<T: DeserializeOwned>(&self, object_id: ObjectId, index: u8) -> Option<T> {
        self.registry.get_live(object_id)?.elements.field(index)?.get()
    }

    /// Writes a field and queues the delta for every recipient.
    ///
    /// The authority may write any field; an owning client may write its
    /// `ClientMulticast` fields, which travel to the authority and are relayed
    /// from there. Returns `false` for unresolvable or read-only fields and
    /// for writes filtered as unchanged.
    pub fn set_field<T: Serialize>(&mut self, object_id: ObjectId, index: u8, value: &T) -> bool {
        encode(value).is_some_and(|payload| self.set_field_bytes(object_id, index, payload))
    }

    /// [`set_field`](Self::set_field) with an already serialized value.
    pub fn set_field_bytes(&mut self, object_id: ObjectId, index: u8, payload: Vec<u8>) -> bool {
        match self.write_field(object_id, index, payload) {
            Ok(changed) => changed,
            Err(error) => {
                warn!(%object_id, index, %error, "field write refused");
                false
            }
        }
    }

    fn write_field(&mut self, object_id: ObjectId, index: u8, payload: Vec<u8>) -> Result<bool, ResolveError> {
        let role = self.role;
        let object = self.registry.resolve_mut(object_id)?;
        let mode = field_slot(object, object_id, index)?.mode();
        if !object.can_write(&role, mode) {
            return Err(ResolveError::NotWritable {
                object: object_id,
                kind: ElementKind::Field,
                index,
            });
        }
        let owner = object.owner;
        let subscribers = sorted_subscribers(object);
        if !field_slot(object, object_id, index)?.write(payload.clone()) {
            return Ok(false);
        }

        let delta = ReplicationMessage::FieldDelta(FieldDelta {
            object_id,
            element_index: index,
            payload,
        });
        self.fan_out(mode, owner, subscribers, None, delta);
        Ok(true)
    }

    // --- Lists ---

    /// Items of a list decoded as `T`.
    pub fn list_items<T: DeserializeOwned>(&self, object_id: ObjectId, index: u8) -> Option<Vec<T>> {
        Some(self.registry.get_live(object_id)?.elements.list(index)?.decoded())
    }

    /// Appends an item.
    pub fn list_add<T: Serialize>(&mut self, object_id: ObjectId, index: u8, item: &T) -> bool {
        encode(item).is_some_and(|payload| self.list_op(object_id, index, ListOp::Add, None, Some(payload)))
    }

    /// Replaces the item at `at`.
    pub fn list_set<T: Serialize>(&mut self, object_id: ObjectId, index: u8, at: i32, item: &T) -> bool {
        encode(item).is_some_and(|payload| self.list_op(object_id, index, ListOp::Set, Some(at), Some(payload)))
    }

    /// Inserts an item before `at`.
    pub fn list_insert<T: Serialize>(&mut self, object_id: ObjectId, index: u8, at: i32, item: &T) -> bool {
        encode(item).is_some_and(|payload| self.list_op(object_id, index, ListOp::Insert, Some(at), Some(payload)))
    }

    /// Removes the item at `at`.
    pub fn list_remove(&mut self, object_id: ObjectId, index: u8, at: i32) -> bool {
        self.list_op(object_id, index, ListOp::Remove, Some(at), None)
    }

    /// Removes every item.
    pub fn list_clear(&mut self, object_id: ObjectId, index: u8) -> bool {
        self.list_op(object_id, index, ListOp::Clear, None, None)
    }

    /// Applies one list operation locally and queues it for every recipient.
    /// Same write rules as [`set_field`](Self::set_field).
    pub fn list_op(
        &mut self,
        object_id: ObjectId,
        index: u8,
        op: ListOp,
        at: Option<i32>,
        payload: Option<Vec<u8>>,
    ) -> bool {
        match self.write_list(object_id, index, op, at, payload) {
            Ok(()) => true,
            Err(error) => {
                warn!(%object_id, index, ?op, %error, "list operation refused");
                false
            }
        }
    }

    fn write_list(
        &mut self,
        object_id: ObjectId,
        index: u8,
        op: ListOp,
        at: Option<i32>,
        payload: Option<Vec<u8>>,
    ) -> Result<(), DispatchError> {
        let role = self.role;
        let object = self.registry.resolve_mut(object_id)?;
        let mode = list_slot(object, object_id, index)?.mode();
        if !object.can_write(&role, mode) {
            return Err(ResolveError::NotWritable {
                object: object_id,
                kind: ElementKind::List,
                index,
            }
            .into());
        }
        let owner = object.owner;
        let subscribers = sorted_subscribers(object);
        list_slot(object, object_id, index)?.apply(op, at, payload.as_deref())?;

        let record = ReplicationMessage::ListOperation(ListOperation {
            object_id,
            element_index: index,
            op,
            index: at,
            payload,
        });
        self.fan_out(mode, owner, subscribers, None, record);
        Ok(())
    }

    // --- Functions ---

    /// Invokes a function remotely.
    ///
    /// On the authority the call goes to every subscriber or to the owner; a
    /// client can only call the authority, and only on objects it owns when
    /// the function requires it. With `hook_callback` the call is also
    /// surfaced locally as a [`ReplicationEvent::FunctionCalled`].
    pub fn call_function<T: Serialize>(
        &mut self,
        object_id: ObjectId,
        index: u8,
        target: CallTarget,
        args: &T,
        hook_callback: bool,
    ) -> bool {
        let Some(payload) = encode(args) else {
            return false;
        };
        match self.route_call(object_id, index, target, payload, hook_callback) {
            Ok(()) => true,
            Err(error) => {
                warn!(%object_id, index, ?target, %error, "function call refused");
                false
            }
        }
    }

    fn route_call(
        &mut self,
        object_id: ObjectId,
        index: u8,
        target: CallTarget,
        payload: Vec<u8>,
        hook_callback: bool,
    ) -> Result<(), DispatchError> {
        let role = self.role;
        let object = self.registry.resolve(object_id)?;
        let require_owner = function_slot(object, object_id, index)?.require_owner();
        let owner = object.owner;
        let subscribers = sorted_subscribers(object);

        let call = FunctionCall {
            object_id,
            element_index: index,
            hook_callback,
            payload,
        };
        let mut run_locally = hook_callback;

        if role.is_server {
            let targets = match target {
                CallTarget::AllSubscribers => subscribers,
                CallTarget::Owner => recipients(SyncMode::ServerToOwner, owner, subscribers),
                CallTarget::Server => {
                    run_locally = true;
                    Vec::new()
                }
            };
            for connection in targets {
                if role.is_local_player(connection) {
                    run_locally = true;
                } else {
                    self.enqueue(connection, ReplicationMessage::FunctionCall(call.clone()));
                }
            }
        } else {
            if target != CallTarget::Server {
                return Err(DispatchError::Unexpected { kind: "client_broadcast" });
            }
            let local = self.local_peer();
            if require_owner && owner != OwnerId::from_connection(local) {
                return Err(ResolveError::NotOwner {
                    connection: local,
                    object: object_id,
                }
                .into());
            }
            self.enqueue_to_server(ReplicationMessage::FunctionCall(call.clone()));
        }

        if run_locally {
            self.events.push(ReplicationEvent::FunctionCalled(ReceivedCall {
                from: self.local_peer(),
                object_id,
                element_index: index,
                hook_callback,
                payload: call.payload,
            }));
        }
        Ok(())
    }

    // --- Hit claims ---

    /// Submits a hit claim. A client sends it to the authority; the
    /// authority (including a listen server's own player) validates it in
    /// place. Returns `false` only when a local validation rejects it.
    pub fn send_hit_claim(&mut self, claim: HitClaim) -> bool {
        if self.role.is_server {
            return self.perform_validation(claim.attacker_object_id, &claim);
        }
        self.enqueue_to_server(ReplicationMessage::HitClaim(claim));
        true
    }

    // --- Tick flush ---

    /// Sends every queued record, one reliable ordered batch per peer, and
    /// clears the dirty flags of the fields written since the previous
    /// flush. Returns the number of records sent.
    pub fn flush_tick(&mut self, transport: &mut dyn MessageTransport) -> usize {
        let mut sent = 0;
        for connection in self.connection_ids() {
            let Some(conn) = self.connections.get_mut(&connection) else {
                continue;
            };
            if conn.link.sender.is_empty() {
                continue;
            }
            sent += send_queue(transport, connection, &mut conn.link.sender, &self.channel_config);
        }
        if !self.server_link.sender.is_empty() {
            sent += send_queue(transport, SERVER_PEER, &mut self.server_link.sender, &self.channel_config);
        }
        let changed = self.registry.iter_mut().map(|object| object.elements.clear_dirty()).sum::<usize>();
        if sent > 0 || changed > 0 {
            trace!(sent, changed, "tick flushed");
        }
        sent
    }

    // --- Inbound ---

    /// Decodes one batch from `from` and applies every record that is now in
    /// order. Returns the number of records applied; the rest are logged and
    /// dropped.
    pub fn receive(&mut self, from: ConnectionId, bytes: &[u8]) -> usize {
        let envelopes = match decode_batch(bytes) {
            Ok(envelopes) => envelopes,
            Err(error) => {
                warn!(%from, %error, "undecodable batch dropped");
                return 0;
            }
        };
        let link = if self.role.is_server {
            match self.connections.get_mut(&from) {
                Some(conn) => &mut conn.link,
                None => {
                    warn!(%from, "batch from unknown connection dropped");
                    return 0;
                }
            }
        } else {
            &mut self.server_link
        };
        let mut ready = Vec::new();
        for envelope in envelopes {
            ready.extend(link.receiver.receive(envelope));
        }

        let mut applied = 0;
        for message in ready {
            let object_id = message.object_id();
            let kind = message.kind();
            match self.apply_message(from, message) {
                Ok(()) => applied += 1,
                Err(error) => warn!(%from, %object_id, kind, %error, "record dropped"),
            }
        }
        applied
    }

    /// Applies one in-order record from `from`.
    pub fn apply_message(&mut self, from: ConnectionId, message: ReplicationMessage) -> Result<(), DispatchError> {
        if self.role.is_server {
            self.apply_from_client(from, message)
        } else {
            self.apply_from_server(message)
        }
    }

    fn apply_from_client(&mut self, from: ConnectionId, message: ReplicationMessage) -> Result<(), DispatchError> {
        match message {
            ReplicationMessage::FieldDelta(delta) => self.apply_client_field(from, delta),
            ReplicationMessage::ListOperation(operation) => self.apply_client_list(from, operation),
            ReplicationMessage::FunctionCall(call) => self.apply_client_call(from, call),
            ReplicationMessage::HitClaim(claim) => self.process_hit_claim(from, claim),
            other => Err(DispatchError::Unexpected { kind: other.kind() }),
        }
    }

    /// A `ClientMulticast` field written by its owner: applied, then relayed
    /// to every other subscriber.
    fn apply_client_field(&mut self, from: ConnectionId, delta: FieldDelta) -> Result<(), DispatchError> {
        let FieldDelta {
            object_id,
            element_index,
            payload,
        } = delta;
        let object = self.registry.resolve_mut(object_id)?;
        if !object.is_owned_by_connection(from) {
            return Err(ResolveError::NotOwner {
                connection: from,
                object: object_id,
            }
            .into());
        }
        let owner = object.owner;
        let subscribers = sorted_subscribers(object);
        let field = field_slot(object, object_id, element_index)?;
        if field.mode() != SyncMode::ClientMulticast {
            return Err(ResolveError::NotWritable {
                object: object_id,
                kind: ElementKind::Field,
                index: element_index,
            }
            .into());
        }
        if !field.write(payload.clone()) {
            return Ok(());
        }

        self.events.push(ReplicationEvent::FieldChanged {
            object_id,
            element_index,
        });
        let relay = ReplicationMessage::FieldDelta(FieldDelta {
            object_id,
            element_index,
            payload,
        });
        self.fan_out(SyncMode::ClientMulticast, owner, subscribers, Some(from), relay);
        Ok(())
    }

    fn apply_client_list(&mut self, from: ConnectionId, operation: ListOperation) -> Result<(), DispatchError> {
        let object_id = operation.object_id;
        let object = self.registry.resolve_mut(object_id)?;
        if !object.is_owned_by_connection(from) {
            return Err(ResolveError::NotOwner {
                connection: from,
                object: object_id,
            }
            .into());
        }
        let owner = object.owner;
        let subscribers = sorted_subscribers(object);
        let list = list_slot(object, object_id, operation.element_index)?;
        if list.mode() != SyncMode::ClientMulticast {
            return Err(ResolveError::NotWritable {
                object: object_id,
                kind: ElementKind::List,
                index: operation.element_index,
            }
            .into());
        }
        list.apply(operation.op, operation.index, operation.payload.as_deref())?;

        self.events.push(ReplicationEvent::ListChanged {
            object_id,
            element_index: operation.element_index,
        });
        self.fan_out(
            SyncMode::ClientMulticast,
            owner,
            subscribers,
            Some(from),
            ReplicationMessage::ListOperation(operation),
        );
        Ok(())
    }

    fn apply_client_call(&mut self, from: ConnectionId, call: FunctionCall) -> Result<(), DispatchError> {
        let object = self.registry.resolve(call.object_id)?;
        let function = function_slot(object, call.object_id, call.element_index)?;
        if function.require_owner() && !object.is_owned_by_connection(from) {
            return Err(ResolveError::NotOwner {
                connection: from,
                object: call.object_id,
            }
            .into());
        }
        self.events.push(ReplicationEvent::FunctionCalled(ReceivedCall {
            from,
            object_id: call.object_id,
            element_index: call.element_index,
            hook_callback: call.hook_callback,
            payload: call.payload,
        }));
        Ok(())
    }

    fn apply_from_server(&mut self, message: ReplicationMessage) -> Result<(), DispatchError> {
        match message {
            ReplicationMessage::Spawn(spawn) => self.apply_spawn(spawn),
            ReplicationMessage::Destroy(destroy) => {
                let object_id = destroy.object_id;
                self.registry
                    .remove(object_id)
                    .ok_or(ResolveError::UnknownObject(object_id))?;
                debug!(%object_id, reason = destroy.reason.0, "replica destroyed");
                self.events.push(ReplicationEvent::Destroyed {
                    object_id,
                    reason: destroy.reason,
                });
                Ok(())
            }
            ReplicationMessage::FieldDelta(delta) => {
                let object = self.registry.resolve_mut(delta.object_id)?;
                field_slot(object, delta.object_id, delta.element_index)?.apply_remote(delta.payload);
                self.events.push(ReplicationEvent::FieldChanged {
                    object_id: delta.object_id,
                    element_index: delta.element_index,
                });
                Ok(())
            }
            ReplicationMessage::ListOperation(operation) => {
                let object = self.registry.resolve_mut(operation.object_id)?;
                list_slot(object, operation.object_id, operation.element_index)?.apply(
                    operation.op,
                    operation.index,
                    operation.payload.as_deref(),
                )?;
                self.events.push(ReplicationEvent::ListChanged {
                    object_id: operation.object_id,
                    element_index: operation.element_index,
                });
                Ok(())
            }
            ReplicationMessage::InitialList(burst) => {
                let object = self.registry.resolve_mut(burst.object_id)?;
                list_slot(object, burst.object_id, burst.element_index)?.replace(burst.items)?;
                self.events.push(ReplicationEvent::ListChanged {
                    object_id: burst.object_id,
                    element_index: burst.element_index,
                });
                Ok(())
            }
            ReplicationMessage::FunctionCall(call) => {
                let object = self.registry.resolve(call.object_id)?;
                function_slot(object, call.object_id, call.element_index)?;
                self.events.push(ReplicationEvent::FunctionCalled(ReceivedCall {
                    from: SERVER_PEER,
                    object_id: call.object_id,
                    element_index: call.element_index,
                    hook_callback: call.hook_callback,
                    payload: call.payload,
                }));
                Ok(())
            }
            ReplicationMessage::OwnerChange(change) => {
                let object = self.registry.resolve_mut(change.object_id)?;
                let previous = object.owner;
                object.owner = OwnerId(change.owner_connection_id);
                self.events.push(ReplicationEvent::OwnerChanged {
                    object_id: change.object_id,
                    previous,
                    owner: object.owner,
                });
                Ok(())
            }
            other => Err(DispatchError::Unexpected { kind: other.kind() }),
        }
    }

    /// Builds a replica from a spawn record.
    fn apply_spawn(&mut self, spawn: SpawnObject) -> Result<(), DispatchError> {
        let object_id = spawn.object_id;
        if self.registry.contains(object_id) {
            return Err(DispatchError::DuplicateSpawn(object_id));
        }
        let template = self.templates.get(spawn.asset_hash)?;
        let mut object = NetworkObject::new(object_id, template);
        object.owner = OwnerId(spawn.owner_connection_id);
        object.position = spawn.position;
        object.rotation = spawn.rotation;
        object.is_spawned = true;
        for value in spawn.initial_fields {
            field_slot(&mut object, object_id, value.element_index)?.apply_remote(value.payload);
        }
        if !self.registry.insert(object) {
            return Err(DispatchError::DuplicateSpawn(object_id));
        }
        debug!(%object_id, asset_hash = %spawn.asset_hash, "replica spawned");
        self.events.push(ReplicationEvent::Spawned { object_id });
        Ok(())
    }
}

#[cfg(test)]
#[path = "dispatch_tests.rs"]
mod tests;
