//! Requests and returns a batch of pooled entities, demonstrating that a
//! returned entity's prototype components are restored on its next
//! request (spec scenario 4).

use whisker::world::World;

#[derive(Clone)]
struct Position(f32, f32);
#[derive(Clone)]
struct Health(i32);

fn main() {
    let mut world = World::new();
    let pool_id = world.create_pool(1000, 256);
    world.set_pool_prototype_named_component(pool_id, "Position", Position(0.0, 0.0));
    world.set_pool_prototype_named_component(pool_id, "Health", Health(100));

    let mut requested = Vec::new();
    for _ in 0..1000 {
        requested.push(world.request_from_pool(pool_id));
    }
    world.drain_with(|_| {});

    for entity in requested.iter().take(500) {
        world.enqueue_set("Position", *entity, Position(9.0, 9.0));
    }
    world.drain_with(|_| {});

    for entity in requested.drain(..) {
        world.destroy_deferred(entity);
    }
    world.drain_with(|_| {});

    let mut restored = Vec::new();
    for _ in 0..500 {
        restored.push(world.request_from_pool(pool_id));
    }
    world.drain_with(|_| {});

    let stats = world.pool(pool_id).unwrap().stats();
    println!(
        "requests={}, returns={}, misses={}",
        stats.total_requests, stats.total_returns, stats.cache_misses
    );
    for entity in restored {
        let position = world.get::<Position>("Position", entity).unwrap();
        assert_eq!((position.0, position.1), (0.0, 0.0));
    }
}
