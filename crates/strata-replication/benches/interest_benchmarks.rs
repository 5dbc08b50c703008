use std::sync::Arc;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use glam::Vec3;
use strata_config::Config;
use strata_replication::interest::VisibilityPolicies;
use strata_replication::*;

/// Server with `players` ready connections and as many avatars on a grid,
/// plus one scenery object per avatar.
fn crowded_world(players: u64) -> ReplicationContext {
    let mut ctx = ReplicationContext::new(LocalRole::server(), &Config::default(), Arc::new(ManualClock::new(0)));
    ctx.register_template(
        ObjectTemplate::new("avatar")
            .with_behaviour(BehaviourDef::new("stats").field("hp", &100u32, SyncBehaviour::Default, SyncMode::ServerToClients))
            .with_hitbox(Hitbox::cube(0.5)),
    )
    .expect("template");
    ctx.register_template(ObjectTemplate::new("crate")).expect("template");

    for i in 0..players {
        let connection = ConnectionId(i + 1);
        ctx.add_connection(connection);
        ctx.set_connection_ready(connection, true);
        let position = Vec3::new((i % 32) as f32 * 15.0, 0.0, (i / 32) as f32 * 15.0);
        ctx.spawn(SpawnRequest::new("avatar").owned_by(OwnerId::from_connection(connection)).at(position));
        ctx.spawn(SpawnRequest::new("crate").at(position + Vec3::new(5.0, 0.0, 5.0)));
    }
    ctx
}

fn bench_update_interest_256(c: &mut Criterion) {
    let mut ctx = crowded_world(256);
    c.bench_function("update_interest_256_players", |bencher| {
        bencher.iter(|| black_box(ctx.update_interest()))
    });
}

fn bench_update_interest_after_movement(c: &mut Criterion) {
    let mut ctx = crowded_world(128);
    let ids = ctx.registry().sorted_ids();
    let mut step = 0.0f32;
    c.bench_function("update_interest_128_players_moving", |bencher| {
        bencher.iter(|| {
            step += 1.0;
            for id in &ids {
                if let Some(object) = ctx.object_mut(*id) {
                    object.position.x += step.sin() * 3.0;
                }
            }
            black_box(ctx.update_interest())
        })
    });
}

fn bench_should_hide(c: &mut Criterion) {
    let ctx = crowded_world(2);
    let ids = ctx.registry().sorted_ids();
    let subject = ctx.object(ids[0]).expect("subject");
    let observer = ctx.object(ids[2]).expect("observer");
    let mut policies = VisibilityPolicies::default();
    policies.add_force_hide(|subject, _observer| subject.is_hide);
    policies.add_hide_exception(|_subject, observer| observer.position.y > 100.0);
    c.bench_function("should_hide_with_predicates", |bencher| {
        bencher.iter(|| black_box(should_hide(black_box(subject), black_box(observer), &policies)))
    });
}

criterion_group!(
    benches,
    bench_update_interest_256,
    bench_update_interest_after_movement,
    bench_should_hide,
);
criterion_main!(benches);
