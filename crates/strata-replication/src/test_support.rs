//! Shared fixtures for unit tests.

use std::sync::Arc;

use strata_config::Config;

use crate::behaviour::{BehaviourDef, SyncBehaviour, SyncMode};
use crate::context::ReplicationContext;
use crate::dispatch::SERVER_PEER;
use crate::identity::{Hitbox, ObjectTemplate, SpawnRequest};
use crate::messages::ReplicationMessage;
use crate::ownership::{ConnectionId, LocalRole, OwnerId};
use crate::transport::{LoopbackTransport, ManualClock};

pub(crate) const PLAYER: &str = "player";

// Field indices of the player template.
pub(crate) const HP: u8 = 0;
pub(crate) const AMMO: u8 = 1;
pub(crate) const TITLE: u8 = 2;
pub(crate) const AIM: u8 = 3;
// List indices.
pub(crate) const BUFFS: u8 = 0;
pub(crate) const QUESTS: u8 = 1;
// Function indices.
pub(crate) const EMOTE: u8 = 0;
pub(crate) const USE_ITEM: u8 = 1;

pub(crate) fn player_template() -> ObjectTemplate {
    ObjectTemplate::new(PLAYER)
        .with_behaviour(
            BehaviourDef::new("stats")
                .field("hp", &100u32, SyncBehaviour::Default, SyncMode::ServerToClients)
                .field("ammo", &30u32, SyncBehaviour::Default, SyncMode::ServerToOwner)
                .field(
                    "title",
                    &String::from("rookie"),
                    SyncBehaviour::DoNotSyncInitialDataImmediately,
                    SyncMode::ServerToClients,
                )
                .list("buffs", SyncMode::ServerToClients)
                .list("quests", SyncMode::ServerToOwner),
        )
        .with_behaviour(
            BehaviourDef::new("control")
                .field("aim", &0.0f32, SyncBehaviour::Default, SyncMode::ClientMulticast)
                .function("emote", false)
                .function("use_item", true),
        )
        .with_hitbox(Hitbox::cube(0.5))
}

pub(crate) fn context_for(role: LocalRole, clock: Arc<ManualClock>) -> ReplicationContext {
    let mut ctx = ReplicationContext::new(role, &Config::default(), clock);
    ctx.register_template(player_template()).unwrap();
    ctx
}

pub(crate) fn context_with_template() -> ReplicationContext {
    context_for(LocalRole::server(), Arc::new(ManualClock::new(0)))
}

pub(crate) fn client_context(connection: ConnectionId) -> ReplicationContext {
    context_for(LocalRole::client(connection), Arc::new(ManualClock::new(0)))
}

pub(crate) fn player_request(owner: OwnerId) -> SpawnRequest {
    SpawnRequest::new(PLAYER).owned_by(owner)
}

pub(crate) fn ready_connection(ctx: &mut ReplicationContext, id: u64) -> ConnectionId {
    let connection = ConnectionId(id);
    ctx.add_connection(connection);
    ctx.set_connection_ready(connection, true);
    connection
}

/// Takes the records queued for `connection` without encoding them.
pub(crate) fn drain_records(ctx: &mut ReplicationContext, connection: ConnectionId) -> Vec<ReplicationMessage> {
    ctx.connections
        .get_mut(&connection)
        .map(|c| c.link.sender.drain().into_iter().map(|e| e.message).collect())
        .unwrap_or_default()
}

/// Flushes the server and delivers everything addressed to `connection` to
/// `client`. Returns the number of records the client applied.
pub(crate) fn pump(
    server: &mut ReplicationContext,
    client: &mut ReplicationContext,
    connection: ConnectionId,
) -> usize {
    let mut transport = LoopbackTransport::new();
    server.flush_tick(&mut transport);
    transport
        .drain_for(connection)
        .iter()
        .map(|bytes| client.receive(SERVER_PEER, bytes))
        .sum()
}

/// Flushes the client and delivers its traffic to the server as `connection`.
pub(crate) fn pump_upstream(
    client: &mut ReplicationContext,
    server: &mut ReplicationContext,
    connection: ConnectionId,
) -> usize {
    let mut transport = LoopbackTransport::new();
    client.flush_tick(&mut transport);
    transport
        .drain_for(SERVER_PEER)
        .iter()
        .map(|bytes| server.receive(connection, bytes))
        .sum()
}

/// Asserts `object.subscribers ∋ c ⇔ controlled(c).subscribing ∋ object`
/// for every connection and object.
pub(crate) fn assert_symmetric(ctx: &ReplicationContext) {
    for id in ctx.connection_ids() {
        let view = ctx
            .connection(id)
            .and_then(|c| c.controlled_object())
            .and_then(|c| ctx.object(c))
            .map(|o| o.subscribing().clone())
            .unwrap_or_default();
        for object in ctx.registry().iter() {
            assert_eq!(
                object.subscribers().contains(&id),
                view.contains(&object.object_id()),
                "asymmetric subscription between {id} and {}",
                object.object_id()
            );
        }
    }
}
