//! Unit tests for the dispatcher: server and client contexts exchanging
//! batches over the loopback transport.

use std::sync::Arc;

use strata_config::Config;

use super::*;
use crate::channel::OrderedSender;
use crate::identity::SpawnRequest;
use crate::ownership::LocalRole;
use crate::test_support::{
    AIM, AMMO, BUFFS, EMOTE, HP, PLAYER, QUESTS, TITLE, USE_ITEM, client_context, context_for, context_with_template,
    drain_records, player_request, pump, pump_upstream, ready_connection,
};
use crate::transport::{LoopbackTransport, ManualClock};

/// Server with two ready players, each with an avatar, and both clients
/// caught up.
struct World {
    server: ReplicationContext,
    client1: ReplicationContext,
    client2: ReplicationContext,
    avatar1: ObjectId,
    avatar2: ObjectId,
}

const CONN1: ConnectionId = ConnectionId(1);
const CONN2: ConnectionId = ConnectionId(2);

fn world() -> World {
    let mut server = context_with_template();
    ready_connection(&mut server, 1);
    ready_connection(&mut server, 2);
    let avatar1 = server.spawn(player_request(OwnerId(1))).unwrap();
    let avatar2 = server.spawn(player_request(OwnerId(2))).unwrap();
    let mut client1 = client_context(CONN1);
    let mut client2 = client_context(CONN2);
    catch_up(&mut server, &mut client1, &mut client2);
    client1.drain_events();
    client2.drain_events();
    World {
        server,
        client1,
        client2,
        avatar1,
        avatar2,
    }
}

/// Flushes the server once and routes each connection's batch.
fn catch_up(server: &mut ReplicationContext, client1: &mut ReplicationContext, client2: &mut ReplicationContext) {
    let mut transport = LoopbackTransport::new();
    server.flush_tick(&mut transport);
    for bytes in transport.drain_for(CONN1) {
        client1.receive(SERVER_PEER, &bytes);
    }
    for bytes in transport.drain_for(CONN2) {
        client2.receive(SERVER_PEER, &bytes);
    }
}

fn calls(events: &[ReplicationEvent]) -> Vec<&ReceivedCall> {
    events
        .iter()
        .filter_map(|e| match e {
            ReplicationEvent::FunctionCalled(call) => Some(call),
            _ => None,
        })
        .collect()
}

// --- Spawn sequence ---

#[test]
fn test_spawn_sequence_builds_full_replica() {
    let mut server = context_with_template();
    let conn = ready_connection(&mut server, 1);
    let avatar = server.spawn(player_request(OwnerId(1))).unwrap();
    assert!(server.set_field(avatar, TITLE, &String::from("veteran")));

    let mut client = client_context(conn);
    assert_eq!(pump(&mut server, &mut client, conn), 3);

    let replica = client.object(avatar).unwrap();
    assert_eq!(replica.owner(), OwnerId(1));
    assert!(replica.is_spawned());
    assert_eq!(client.field::<u32>(avatar, HP), Some(100));
    assert_eq!(client.field::<u32>(avatar, AMMO), Some(30));
    assert_eq!(client.field::<String>(avatar, TITLE).as_deref(), Some("veteran"));
    assert!(client.drain_events().contains(&ReplicationEvent::Spawned { object_id: avatar }));
}

#[test]
fn test_deferred_field_follows_spawn() {
    let mut server = context_with_template();
    let conn = ready_connection(&mut server, 1);
    let avatar = server.spawn(player_request(OwnerId(1))).unwrap();

    let records = drain_records(&mut server, conn);
    assert_eq!(records.len(), 2);
    let ReplicationMessage::Spawn(spawn) = &records[0] else {
        panic!("expected spawn first, got {:?}", records[0]);
    };
    assert!(spawn.initial_fields.iter().all(|f| f.element_index != TITLE));
    assert!(matches!(
        &records[1],
        ReplicationMessage::FieldDelta(d) if d.object_id == avatar && d.element_index == TITLE
    ));
}

#[test]
fn test_owner_only_fields_withheld_from_other_observers() {
    let mut server = context_with_template();
    ready_connection(&mut server, 1);
    let avatar1 = server.spawn(player_request(OwnerId(1))).unwrap();
    assert!(server.set_field(avatar1, AMMO, &5u32));
    assert!(server.list_add(avatar1, QUESTS, &String::from("find the key")));

    ready_connection(&mut server, 2);
    server.spawn(player_request(OwnerId(2))).unwrap();

    let records = drain_records(&mut server, CONN2);
    let spawn = records
        .iter()
        .find_map(|r| match r {
            ReplicationMessage::Spawn(s) if s.object_id == avatar1 => Some(s),
            _ => None,
        })
        .unwrap();
    assert!(spawn.initial_fields.iter().any(|f| f.element_index == HP));
    assert!(spawn.initial_fields.iter().all(|f| f.element_index != AMMO));
    assert!(!records.iter().any(|r| matches!(r, ReplicationMessage::InitialList(l) if l.object_id == avatar1)));

    let owner_records = drain_records(&mut server, CONN1);
    assert!(owner_records.iter().any(|r| matches!(
        r,
        ReplicationMessage::FieldDelta(d) if d.object_id == avatar1 && d.element_index == AMMO
    )));
}

// --- Fields ---

#[test]
fn test_field_deltas_apply_in_production_order() {
    let mut w = world();
    for hp in [90u32, 80, 70] {
        assert!(w.server.set_field(w.avatar1, HP, &hp));
    }
    assert_eq!(pump(&mut w.server, &mut w.client1, CONN1), 3);
    assert_eq!(w.client1.field::<u32>(w.avatar1, HP), Some(70));

    let changes = w
        .client1
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, ReplicationEvent::FieldChanged { element_index: HP, .. }))
        .count();
    assert_eq!(changes, 3);
}

#[test]
fn test_unchanged_write_is_filtered() {
    let mut w = world();
    assert!(!w.server.set_field(w.avatar1, HP, &100u32));
    assert_eq!(w.server.connection(CONN1).unwrap().pending_records(), 0);
}

#[test]
fn test_flush_clears_dirty_flags() {
    let mut w = world();
    w.server.set_field(w.avatar1, HP, &5u32);
    let dirty = |ctx: &ReplicationContext| ctx.object(w.avatar1).unwrap().elements().dirty_fields();
    assert_eq!(dirty(&w.server), vec![HP]);
    assert!(dirty(&w.client1).is_empty());

    let mut transport = LoopbackTransport::new();
    w.server.flush_tick(&mut transport);
    assert!(dirty(&w.server).is_empty());

    // Values applied from the wire were not produced here.
    for bytes in transport.drain_for(CONN1) {
        w.client1.receive(SERVER_PEER, &bytes);
    }
    assert_eq!(w.client1.field::<u32>(w.avatar1, HP), Some(5));
    assert!(dirty(&w.client1).is_empty());
}

#[test]
fn test_unencodable_record_leaves_stream_intact() {
    let mut w = world();
    w.server.enqueue(
        CONN1,
        ReplicationMessage::InitialList(crate::messages::InitialList {
            object_id: w.avatar1,
            element_index: BUFFS,
            items: vec![Vec::new(); 300],
        }),
    );
    assert!(w.server.set_field(w.avatar1, HP, &60u32));
    assert_eq!(pump(&mut w.server, &mut w.client1, CONN1), 1);
    assert_eq!(w.client1.field::<u32>(w.avatar1, HP), Some(60));

    // Later ticks are not held back behind a missing sequence number.
    assert!(w.server.set_field(w.avatar1, HP, &50u32));
    assert_eq!(pump(&mut w.server, &mut w.client1, CONN1), 1);
    assert_eq!(w.client1.field::<u32>(w.avatar1, HP), Some(50));
}

#[test]
fn test_client_cannot_write_authoritative_field() {
    let mut w = world();
    assert!(!w.client1.set_field(w.avatar1, HP, &1u32));
    assert!(!w.server.set_field(w.avatar1, 40, &1u32));
    assert!(!w.server.set_field(ObjectId(999), HP, &1u32));
}

#[test]
fn test_client_multicast_field_relayed_to_other_observers() {
    let mut w = world();
    assert!(w.client1.set_field(w.avatar1, AIM, &1.5f32));
    assert!(!w.client1.set_field(w.avatar2, AIM, &9.0f32), "not the owner");

    assert_eq!(pump_upstream(&mut w.client1, &mut w.server, CONN1), 1);
    assert_eq!(w.server.field::<f32>(w.avatar1, AIM), Some(1.5));
    assert_eq!(w.server.connection(CONN1).unwrap().pending_records(), 0);

    pump(&mut w.server, &mut w.client2, CONN2);
    assert_eq!(w.client2.field::<f32>(w.avatar1, AIM), Some(1.5));
}

#[test]
fn test_server_drops_forged_field_deltas() {
    let mut w = world();
    let forged = |element_index| {
        ReplicationMessage::FieldDelta(FieldDelta {
            object_id: w.avatar1,
            element_index,
            payload: vec![1],
        })
    };
    assert_eq!(
        w.server.apply_message(CONN2, forged(AIM)),
        Err(DispatchError::Resolve(ResolveError::NotOwner {
            connection: CONN2,
            object: w.avatar1,
        }))
    );
    assert_eq!(
        w.server.apply_message(CONN1, forged(HP)),
        Err(DispatchError::Resolve(ResolveError::NotWritable {
            object: w.avatar1,
            kind: ElementKind::Field,
            index: HP,
        }))
    );
    assert_eq!(w.server.field::<u32>(w.avatar1, HP), Some(100));
}

// --- Lists ---

#[test]
fn test_list_operations_and_initial_burst() {
    let mut w = world();
    assert!(w.server.list_add(w.avatar1, BUFFS, &String::from("haste")));
    assert!(w.server.list_add(w.avatar1, BUFFS, &String::from("shield")));
    assert!(w.server.list_insert(w.avatar1, BUFFS, 0, &String::from("regen")));
    assert!(w.server.list_set(w.avatar1, BUFFS, 2, &String::from("ward")));
    assert!(!w.server.list_remove(w.avatar1, BUFFS, 5));
    pump(&mut w.server, &mut w.client1, CONN1);

    let expected = vec!["regen".to_string(), "haste".to_string(), "ward".to_string()];
    assert_eq!(w.client1.list_items::<String>(w.avatar1, BUFFS), Some(expected.clone()));

    // A late observer gets the contents as one burst.
    ready_connection(&mut w.server, 3);
    w.server.spawn(player_request(OwnerId(3))).unwrap();
    let records = drain_records(&mut w.server, ConnectionId(3));
    let bursts: Vec<_> = records
        .iter()
        .filter(|r| matches!(r, ReplicationMessage::InitialList(l) if l.object_id == w.avatar1))
        .collect();
    assert_eq!(bursts.len(), 1);
    assert!(!records.iter().any(|r| matches!(r, ReplicationMessage::ListOperation(_))));

    assert!(w.server.list_clear(w.avatar1, BUFFS));
    pump(&mut w.server, &mut w.client1, CONN1);
    assert_eq!(w.client1.list_items::<String>(w.avatar1, BUFFS), Some(Vec::new()));
}

#[test]
fn test_owner_only_list_reaches_owner_only() {
    let mut w = world();
    assert!(w.server.list_add(w.avatar1, QUESTS, &String::from("q1")));
    catch_up(&mut w.server, &mut w.client1, &mut w.client2);
    assert_eq!(w.client1.list_items::<String>(w.avatar1, QUESTS), Some(vec!["q1".to_string()]));
    assert_eq!(w.client2.list_items::<String>(w.avatar1, QUESTS), Some(Vec::new()));
}

// --- Functions ---

#[test]
fn test_server_call_reaches_subscribers() {
    let mut w = world();
    assert!(
        w.server
            .call_function(w.avatar1, EMOTE, CallTarget::AllSubscribers, &String::from("wave"), false)
    );
    assert!(w.server.call_function(w.avatar1, USE_ITEM, CallTarget::Owner, &7u32, false));
    catch_up(&mut w.server, &mut w.client1, &mut w.client2);

    let events1 = w.client1.drain_events();
    let received = calls(&events1);
    assert_eq!(received.len(), 2);
    assert_eq!(received[0].from, SERVER_PEER);
    assert_eq!(received[0].args::<String>().as_deref(), Some("wave"));
    assert_eq!(received[1].element_index, USE_ITEM);

    let events2 = w.client2.drain_events();
    let received = calls(&events2);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].element_index, EMOTE);
    assert!(calls(&w.server.drain_events()).is_empty());
}

#[test]
fn test_client_call_with_hook_runs_locally_and_upstream() {
    let mut w = world();
    assert!(w.client1.call_function(w.avatar1, USE_ITEM, CallTarget::Server, &3u32, true));
    let local = w.client1.drain_events();
    let local_calls = calls(&local);
    assert_eq!(local_calls.len(), 1);
    assert_eq!(local_calls[0].from, CONN1);

    assert_eq!(pump_upstream(&mut w.client1, &mut w.server, CONN1), 1);
    let events = w.server.drain_events();
    let received = calls(&events);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].from, CONN1);
    assert!(received[0].hook_callback);
    assert_eq!(received[0].args::<u32>(), Some(3));
}

#[test]
fn test_owner_gated_calls() {
    let mut w = world();
    assert!(!w.client2.call_function(w.avatar1, USE_ITEM, CallTarget::Server, &1u32, false));
    assert!(w.client2.call_function(w.avatar1, EMOTE, CallTarget::Server, &(), false));
    assert!(!w.client1.call_function(w.avatar1, EMOTE, CallTarget::AllSubscribers, &(), false));

    let forged = ReplicationMessage::FunctionCall(FunctionCall {
        object_id: w.avatar1,
        element_index: USE_ITEM,
        hook_callback: false,
        payload: Vec::new(),
    });
    assert!(matches!(
        w.server.apply_message(CONN2, forged),
        Err(DispatchError::Resolve(ResolveError::NotOwner { .. }))
    ));
}

// --- Resolution failures ---

#[test]
fn test_stale_records_are_dropped() {
    let mut w = world();
    let unknown = ReplicationMessage::FieldDelta(FieldDelta {
        object_id: ObjectId(999),
        element_index: HP,
        payload: vec![0],
    });
    assert_eq!(
        w.client1.apply_message(SERVER_PEER, unknown),
        Err(DispatchError::Resolve(ResolveError::UnknownObject(ObjectId(999))))
    );

    let out_of_range = ReplicationMessage::ListOperation(ListOperation {
        object_id: w.avatar1,
        element_index: 9,
        op: ListOp::Clear,
        index: None,
        payload: None,
    });
    assert_eq!(
        w.client1.apply_message(SERVER_PEER, out_of_range),
        Err(DispatchError::Resolve(ResolveError::ElementOutOfRange {
            object: w.avatar1,
            kind: ElementKind::List,
            index: 9,
            len: 2,
        }))
    );

    let unexpected = ReplicationMessage::Destroy(crate::messages::DestroyObject {
        object_id: w.avatar2,
        reason: DestroyReason::REQUESTED_TO_DESTROY,
    });
    assert_eq!(
        w.server.apply_message(CONN1, unexpected),
        Err(DispatchError::Unexpected { kind: "destroy" })
    );
    assert!(w.server.object(w.avatar2).is_some());
}

#[test]
fn test_undecodable_and_unknown_peer_batches_are_ignored() {
    let mut w = world();
    assert_eq!(w.client1.receive(SERVER_PEER, &[]), 0);
    assert_eq!(w.client1.receive(SERVER_PEER, &[0x7F, 1, 2]), 0);

    let mut sender = OrderedSender::new();
    sender.enqueue(ReplicationMessage::FieldDelta(FieldDelta {
        object_id: w.avatar1,
        element_index: AIM,
        payload: vec![0; 4],
    }));
    let bytes = crate::channel::encode_batch(&sender.drain(), &Config::default().channel).unwrap();
    assert_eq!(w.server.receive(ConnectionId(77), &bytes), 0);
}

#[test]
fn test_duplicate_spawn_is_refused() {
    let mut w = world();
    let spawn = ReplicationMessage::Spawn(SpawnObject {
        asset_hash: crate::identity::compute_asset_hash(PLAYER),
        object_id: w.avatar1,
        owner_connection_id: -1,
        position: glam::Vec3::ZERO,
        rotation: glam::Quat::IDENTITY,
        initial_fields: Vec::new(),
    });
    assert_eq!(
        w.client1.apply_message(SERVER_PEER, spawn),
        Err(DispatchError::DuplicateSpawn(w.avatar1))
    );
    assert_eq!(w.client1.object(w.avatar1).unwrap().owner(), OwnerId(1));
}

// --- Lifecycle propagation ---

#[test]
fn test_destroy_and_owner_change_reach_replicas() {
    let mut w = world();
    let chest = w.server.spawn(SpawnRequest::new(PLAYER)).unwrap();
    let crate_ = w.server.spawn(SpawnRequest::new(PLAYER)).unwrap();
    pump(&mut w.server, &mut w.client1, CONN1);
    assert!(w.client1.object(chest).is_some());

    assert!(w.server.destroy(chest, DestroyReason(3)));
    assert!(w.server.set_owner(crate_, OwnerId(1)));
    w.client1.drain_events();
    pump(&mut w.server, &mut w.client1, CONN1);

    assert!(w.client1.object(chest).is_none());
    assert_eq!(w.client1.object(crate_).unwrap().owner(), OwnerId(1));
    let events = w.client1.drain_events();
    assert!(events.contains(&ReplicationEvent::Destroyed {
        object_id: chest,
        reason: DestroyReason(3),
    }));
    assert!(events.contains(&ReplicationEvent::OwnerChanged {
        object_id: crate_,
        previous: OwnerId::HOST,
        owner: OwnerId(1),
    }));
}

#[test]
fn test_out_of_order_batches_are_reassembled() {
    let mut server = context_with_template();
    let conn = ready_connection(&mut server, 1);
    let avatar = server.spawn(player_request(OwnerId(1))).unwrap();
    let mut first = LoopbackTransport::new();
    server.flush_tick(&mut first);
    server.set_field(avatar, HP, &50u32);
    let mut second = LoopbackTransport::new();
    server.flush_tick(&mut second);

    let mut client = client_context(conn);
    let late = second.drain_for(conn);
    let early = first.drain_for(conn);
    assert_eq!(client.receive(SERVER_PEER, &late[0]), 0);
    assert!(client.object(avatar).is_none());
    assert_eq!(client.receive(SERVER_PEER, &early[0]), 3);
    assert_eq!(client.field::<u32>(avatar, HP), Some(50));
}

// --- Host mode ---

#[test]
fn test_listen_server_never_queues_records_for_its_own_player() {
    let clock = Arc::new(ManualClock::new(0));
    let mut host = context_for(LocalRole::host(CONN1), clock);
    ready_connection(&mut host, 1);
    let avatar1 = host.spawn(player_request(OwnerId(1))).unwrap();
    assert!(host.object(avatar1).unwrap().is_host_and_owner(&host.role()));
    assert!(host.object(avatar1).unwrap().subscribers().contains(&CONN1));
    assert_eq!(host.connection(CONN1).unwrap().pending_records(), 0);

    ready_connection(&mut host, 2);
    host.spawn(player_request(OwnerId(2))).unwrap();
    assert!(host.connection(CONN2).unwrap().pending_records() > 0);

    host.drain_events();
    assert!(host.call_function(avatar1, EMOTE, CallTarget::Owner, &(), false));
    let events = host.drain_events();
    let received = calls(&events);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].from, SERVER_PEER);
    assert_eq!(host.connection(CONN1).unwrap().pending_records(), 0);
}
