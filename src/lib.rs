//! Whisker: an archetype-free, sparse-set entity component system for
//! real-time simulation.
//!
//! Components live in per-id [`SparseSet`](sparse_set::SparseSet)-backed
//! columns rather than archetype tables, so adding or removing a
//! component from an entity never moves unrelated data. Mutations raised
//! while a phase is running (`set`/`remove`/entity create or destroy) are
//! deferred and drained between phases, so a system never observes a
//! storage shape changing out from under its own iteration.
//!
//! ```
//! use whisker::world::World;
//! use whisker::scheduler::SystemContext;
//!
//! struct Position(f32);
//! struct Velocity(f32);
//!
//! fn movement(ctx: &mut SystemContext) {
//!     let entities = ctx.entities;
//!     let components = ctx.components;
//!     let (thread_id, thread_max, delta_time) = (ctx.thread_id, ctx.thread_max, ctx.delta_time);
//!     let position_id = entities.lookup_named("Position").unwrap();
//!     let velocity_id = entities.lookup_named("Velocity").unwrap();
//!
//!     let state = ctx.query(0, &["Position"], &["Velocity"], &[]);
//!     let matched: Vec<_> = state.iter(components, entities, thread_id, thread_max).collect();
//!
//!     for entity in matched {
//!         if let Some(delta) = components.get::<Velocity>(velocity_id, entity).map(|v| v.0) {
//!             unsafe {
//!                 if let Some(position) = components.get_mut_unchecked::<Position>(position_id, entity) {
//!                     position.0 += delta * delta_time as f32;
//!                 }
//!             }
//!         }
//!     }
//! }
//!
//! let mut world = World::new();
//! world.register_phase("update", 60.0, false);
//! world.register_system("movement", "update", 0, movement);
//!
//! let entity = world.create();
//! world.set("Position", entity, Position(0.0));
//! world.set("Velocity", entity, Velocity(1.0));
//! world.update();
//! ```

pub mod alloc;
pub mod component;
pub mod entity;
pub mod error;
pub mod pool;
pub mod query;
pub mod scheduler;
pub mod sparse_set;
pub mod time;
pub mod world;

/// Re-exports the most commonly used items.
pub mod prelude {
    pub use crate::alloc::{AllocFailureHook, NoopAllocHook, TracingAllocHook};
    pub use crate::component::{Component, ComponentId, ComponentStore, ObservedAction};
    pub use crate::entity::{Entity, EntityRegistry, NULL_ENTITY};
    pub use crate::error::{Result, WhiskerError};
    pub use crate::pool::{EntityPool, PoolStats};
    pub use crate::query::{QueryIter, QueryState};
    pub use crate::scheduler::{Scheduler, SystemContext, SystemFn, POST_PHASE, PRE_PHASE};
    pub use crate::sparse_set::SparseSet;
    pub use crate::time::TimeStep;
    pub use crate::world::World;
}
