//! Registers a single `on_update` system that integrates `Velocity` into
//! `Position`, then drives the world for a second of simulated time.

use whisker::scheduler::SystemContext;
use whisker::world::World;

struct Position(f32);
struct Velocity(f32);

fn movement(ctx: &mut SystemContext) {
    let entities = ctx.entities;
    let components = ctx.components;
    let (thread_id, thread_max, delta_time) = (ctx.thread_id, ctx.thread_max, ctx.delta_time);
    let position_id = entities.lookup_named("Position").unwrap();
    let velocity_id = entities.lookup_named("Velocity").unwrap();

    let state = ctx.query(0, &["Position"], &["Velocity"], &[]);
    let matched: Vec<_> = state.iter(components, entities, thread_id, thread_max).collect();

    for entity in matched {
        if let Some(delta) = components.get::<Velocity>(velocity_id, entity).map(|v| v.0) {
            unsafe {
                if let Some(position) = components.get_mut_unchecked::<Position>(position_id, entity) {
                    position.0 += delta * delta_time as f32;
                }
            }
        }
    }
}

fn main() {
    tracing_subscriber::fmt::init();

    let mut world = World::new();
    world.register_phase("w_phase_on_update", 60.0, false);
    world.register_system("movement", "w_phase_on_update", 0, movement);

    let a = world.create_named("a");
    let b = world.create_named("b");
    world.set("Position", a, Position(1.0));
    world.set("Position", b, Position(1.0));
    world.set("Velocity", b, Velocity(1.0));

    for _ in 0..60 {
        world.update();
    }

    println!(
        "a.position = {}, b.position = {}",
        world.get::<Position>("Position", a).unwrap().0,
        world.get::<Position>("Position", b).unwrap().0,
    );
}
