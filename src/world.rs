//! The top-level handle bundling the entity registry, component store,
//! scheduler, and entity pools into one unit of simulation state.

use rustc_hash::FxHashMap;

use crate::alloc::{AllocFailureHook, TracingAllocHook};
use crate::component::{Component, ComponentId, ComponentStore, ObservedAction};
use crate::entity::{Entity, EntityRegistry};
use crate::pool::EntityPool;
use crate::query::{QueryIter, QueryState};
use crate::scheduler::{Scheduler, SystemFn};

/// Bundles every piece of Whisker runtime state an application needs: the
/// entity registry, the component store and its deferred pipeline, the
/// system scheduler, and any entity pools registered against it.
pub struct World {
    /// Entity allocation, recycling, and naming.
    pub entities: EntityRegistry,
    /// Component columns and the deferred mutation queue.
    pub components: ComponentStore,
    /// Named process phases and registered systems.
    pub scheduler: Scheduler,
    pools: FxHashMap<u32, EntityPool>,
    next_pool_id: u32,
    sort_pool: rayon::ThreadPool,
    alloc_hook: Box<dyn AllocFailureHook>,
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl World {
    /// Creates an empty world: slot 0 reserved as the sentinel entity, the
    /// reserved pre/post phases registered, no components or pools yet.
    #[must_use]
    pub fn new() -> Self {
        let entities = EntityRegistry::new();
        let scheduler = Scheduler::new(&entities);
        Self {
            entities,
            components: ComponentStore::new(),
            scheduler,
            pools: FxHashMap::default(),
            next_pool_id: 0,
            sort_pool: rayon::ThreadPoolBuilder::new()
                .num_threads(num_cpus_for_sort())
                .thread_name(|i| format!("whisker-sort-{i}"))
                .build()
                .expect("failed to build the sort thread pool"),
            alloc_hook: Box::new(TracingAllocHook),
        }
    }

    /// Installs a custom allocation-growth hook, replacing the default
    /// `tracing`-backed one.
    pub fn set_alloc_hook(&mut self, hook: impl AllocFailureHook + 'static) {
        self.alloc_hook = Box::new(hook);
    }

    /// Current allocation-growth hook, exposed so the sparse set and pool
    /// growth paths elsewhere in the crate can share it.
    #[must_use]
    pub fn alloc_hook(&self) -> &dyn AllocFailureHook {
        self.alloc_hook.as_ref()
    }

    // -- entities --------------------------------------------------------

    /// Allocates a new, unnamed entity immediately.
    pub fn create(&self) -> Entity {
        self.entities.create()
    }

    /// Allocates (or looks up) a named entity immediately.
    pub fn create_named(&self, name: &str) -> Entity {
        self.entities.create_named(name)
    }

    /// Requests an entity creation that takes effect at the next drain.
    pub fn create_deferred(&self) -> Entity {
        self.entities.create_deferred()
    }

    /// Destroys an entity immediately, removing all of its components.
    pub fn destroy(&mut self, entity: Entity) {
        self.components.remove_all(entity);
        self.entities.destroy(entity);
    }

    /// Requests destruction at the next drain. If `entity` belongs to a
    /// pool, the drain routes it back to that pool instead of recycling
    /// its registry slot.
    pub fn destroy_deferred(&self, entity: Entity) {
        self.entities.destroy_deferred(entity);
    }

    /// Whether `entity`'s version is still current.
    #[must_use]
    pub fn is_alive(&self, entity: Entity) -> bool {
        self.entities.is_alive(entity)
    }

    // -- components --------------------------------------------------------

    /// Registers a named component type, returning its id. Idempotent.
    pub fn register_component<T: Component>(&mut self, name: &str) -> ComponentId {
        let id = self.entities.create_named(name);
        self.components.register::<T>(id);
        id
    }

    /// Resolves a component name to its id without the source's ordinary
    /// "lookup creates the name" behavior (§7) — for tooling that wants to
    /// ask "has this component ever been registered" without the asking
    /// itself bringing the name into existence.
    pub fn try_component_id(&self, name: &str) -> crate::error::Result<ComponentId> {
        self.entities
            .lookup_named(name)
            .ok_or_else(|| crate::error::WhiskerError::UnknownComponentName(name.to_owned()))
    }

    /// Writes a component value directly by name, registering the
    /// component's column on first use.
    pub fn set<T: Component>(&mut self, name: &str, entity: Entity, value: T) {
        let id = self.register_component::<T>(name);
        self.components.set(id, entity, value);
    }

    /// Reads a component value directly by name.
    #[must_use]
    pub fn get<T: Component>(&self, name: &str, entity: Entity) -> Option<&T> {
        let id = self.entities.lookup_named(name)?;
        self.components.get(id, entity)
    }

    /// Mutably reads a component value directly by name.
    #[must_use]
    pub fn get_mut<T: Component>(&mut self, name: &str, entity: Entity) -> Option<&mut T> {
        let id = self.entities.lookup_named(name)?;
        self.components.get_mut(id, entity)
    }

    /// Enqueues a deferred `SET`, applied at the next drain.
    pub fn enqueue_set<T: Component>(&mut self, name: &str, entity: Entity, value: T) {
        let id = self.register_component::<T>(name);
        self.components.enqueue_set(id, entity, value, true);
    }

    /// Enqueues a deferred `REMOVE`, applied at the next drain.
    pub fn enqueue_remove(&self, name: &str, entity: Entity) {
        if let Some(id) = self.entities.lookup_named(name) {
            self.components.enqueue_remove(id, entity, true);
        }
    }

    // -- querying --------------------------------------------------------

    /// Resolves a one-off query plan by component name, for ad hoc use
    /// outside a scheduled system (which should prefer
    /// [`crate::scheduler::SystemContext::query`] so the plan is cached
    /// across frames).
    #[must_use]
    pub fn query(&self, read: &[&str], write: &[&str], optional: &[&str]) -> QueryState {
        let resolve = |names: &[&str]| -> Vec<Entity> {
            names.iter().map(|name| self.entities.create_named(name)).collect()
        };
        QueryState::new(&self.components, &resolve(read), &resolve(write), &resolve(optional))
    }

    /// Iterates every entity matching `state`, single-threaded.
    #[must_use]
    pub fn iter<'w>(&'w self, state: &'w QueryState) -> QueryIter<'w> {
        state.iter(&self.components, &self.entities, 0, 1)
    }

    // -- pools --------------------------------------------------------

    /// Creates a new, empty entity pool and returns its id.
    pub fn create_pool(&mut self, initial_size: usize, realloc_block_size: usize) -> u32 {
        let id = self.next_pool_id;
        self.next_pool_id += 1;
        self.pools
            .insert(id, EntityPool::new(id, &self.entities, initial_size, realloc_block_size));
        id
    }

    /// Shared access to a previously created pool.
    #[must_use]
    pub fn pool(&self, id: u32) -> Option<&EntityPool> {
        self.pools.get(&id)
    }

    /// Mutable access to a previously created pool, for setting prototype
    /// components.
    pub fn pool_mut(&mut self, id: u32) -> Option<&mut EntityPool> {
        self.pools.get_mut(&id)
    }

    /// Requests an entity from a pool.
    ///
    /// # Panics
    ///
    /// Panics if `pool_id` doesn't name a pool created on this world —
    /// requesting from an unknown pool is a caller bug, not a recoverable
    /// condition.
    pub fn request_from_pool(&self, pool_id: u32) -> Entity {
        let pool = self.pools.get(&pool_id).expect("unknown entity pool");
        pool.request(&self.entities, &self.components)
    }

    /// Returns a pool-owned entity directly, without going through
    /// [`destroy_deferred`](Self::destroy_deferred). Most callers should
    /// prefer `destroy_deferred` so pool ownership routing happens
    /// automatically during the next drain.
    ///
    /// # Panics
    ///
    /// Panics if `pool_id` doesn't name a pool created on this world.
    pub fn return_to_pool(&self, pool_id: u32, entity: Entity) {
        let pool = self.pools.get(&pool_id).expect("unknown entity pool");
        pool.return_entity(&self.entities, &self.components, entity);
    }

    /// Sets a prototype component on a pool by id, registering the
    /// column if this is the first time `component_id` has been used.
    ///
    /// # Panics
    ///
    /// Panics if `pool_id` doesn't name a pool created on this world.
    pub fn set_pool_prototype_component<T: Component + Clone>(&mut self, pool_id: u32, component_id: ComponentId, value: T) {
        let World { pools, components, .. } = self;
        pools
            .get_mut(&pool_id)
            .expect("unknown entity pool")
            .set_prototype_component(components, component_id, value);
    }

    /// Sets a prototype component on a pool by name. Convenience over
    /// [`set_pool_prototype_component`](Self::set_pool_prototype_component)
    /// that resolves (or creates) the component id first.
    ///
    /// # Panics
    ///
    /// Panics if `pool_id` doesn't name a pool created on this world.
    pub fn set_pool_prototype_named_component<T: Component + Clone>(&mut self, pool_id: u32, name: &str, value: T) {
        let id = self.register_component::<T>(name);
        self.set_pool_prototype_component(pool_id, id, value);
    }

    // -- systems --------------------------------------------------------

    /// Registers a system function under a process phase, creating the
    /// phase (at a default 60Hz rate) if it doesn't exist yet.
    pub fn register_system(&mut self, name: &str, phase_name: &str, thread_count: usize, run: SystemFn) -> Entity {
        self.scheduler.register_system(&self.entities, name, phase_name, thread_count, run)
    }

    /// Registers a phase at a specific update rate. `update_rate_sec` of
    /// `0.0` paired with `uncapped: true` runs the phase once per call to
    /// [`update`](Self::update) using the real frame delta instead of a
    /// fixed step.
    pub fn register_phase(&mut self, name: &str, update_rate_sec: f64, uncapped: bool) -> Entity {
        self.scheduler.register_phase(&self.entities, name, update_rate_sec, uncapped)
    }

    /// Resolves an already-registered phase's id by name without
    /// creating it. See [`Scheduler::try_phase_id`].
    pub fn try_phase_id(&self, name: &str) -> crate::error::Result<Entity> {
        self.scheduler.try_phase_id(&self.entities, name)
    }

    /// Re-sorts registered phases to run in `order`, creating any named
    /// phase that doesn't exist yet. See [`Scheduler::set_phase_order`].
    pub fn set_phase_order(&mut self, order: &[&str]) {
        self.scheduler.set_phase_order(&self.entities, order);
    }

    /// Runs one frame: every non-manual phase (wrapped in the reserved
    /// pre/post phases) for as many fixed updates as it has accumulated,
    /// draining deferred actions between each phase.
    pub fn update(&mut self) {
        let entities = &self.entities;
        let pools = &self.pools;
        let sort_pool = &self.sort_pool;

        self.scheduler.update(entities, &mut self.components, |entities, components| {
            Self::drain_deferred(entities, components, pools, sort_pool);
        });
    }

    /// Applies the entire deferred-action pipeline once, in the fixed
    /// order: pre-process destroyed entities (routing pool-managed ones
    /// back to their pool instead of the registry), apply queued
    /// component actions, sort any columns that changed, then apply
    /// queued entity create/destroy actions.
    fn drain_deferred(
        entities: &EntityRegistry,
        components: &mut ComponentStore,
        pools: &FxHashMap<u32, EntityPool>,
        sort_pool: &rayon::ThreadPool,
    ) {
        let mut pool_managed = Vec::new();
        entities.for_each_pending_destroy(|entity| {
            if let Some(pool_id) = entities.managed_by(entity) {
                pool_managed.push((entity, pool_id));
            } else {
                components.enqueue_remove_all(entity, true);
            }
        });
        for (entity, pool_id) in &pool_managed {
            if let Some(pool) = pools.get(pool_id) {
                pool.handle_pre_destroy(entities, components, *entity);
            }
        }

        components.drain_with(|_action: ObservedAction| {});
        components.sort_changed(sort_pool);

        let pool_managed_set: std::collections::HashSet<Entity> =
            pool_managed.iter().map(|(e, _)| *e).collect();
        entities.drain_deferred(|entity| pool_managed_set.contains(&entity));
    }

    /// Runs the deferred-action pipeline once, invoking `observer` for
    /// every propagating component action. Equivalent to calling
    /// [`update`](Self::update) but without advancing the scheduler —
    /// useful for a reactive pass run outside the normal frame loop.
    pub fn drain_with(&mut self, mut observer: impl FnMut(ObservedAction)) {
        let mut pool_managed = Vec::new();
        self.entities.for_each_pending_destroy(|entity| {
            if let Some(pool_id) = self.entities.managed_by(entity) {
                pool_managed.push((entity, pool_id));
            } else {
                self.components.enqueue_remove_all(entity, true);
            }
        });
        for (entity, pool_id) in &pool_managed {
            if let Some(pool) = self.pools.get(pool_id) {
                pool.handle_pre_destroy(&self.entities, &self.components, *entity);
            }
        }

        self.components.drain_with(&mut observer);
        self.components.sort_changed(&self.sort_pool);

        let pool_managed_set: std::collections::HashSet<Entity> =
            pool_managed.iter().map(|(e, _)| *e).collect();
        self.entities.drain_deferred(|entity| pool_managed_set.contains(&entity));
    }
}

fn num_cpus_for_sort() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Position(f32);
    struct Velocity(f32);

    #[test]
    fn deferred_set_is_invisible_until_drain() {
        let mut world = World::new();
        let entity = world.create();
        world.enqueue_set("Position", entity, Position(1.0));
        assert!(world.get::<Position>("Position", entity).is_none());

        world.drain_with(|_| {});
        assert_eq!(world.get::<Position>("Position", entity).unwrap().0, 1.0);
    }

    #[test]
    fn destroy_deferred_removes_all_components_on_drain() {
        let mut world = World::new();
        let entity = world.create();
        world.set("Position", entity, Position(1.0));
        world.set("Velocity", entity, Velocity(2.0));

        world.destroy_deferred(entity);
        world.drain_with(|_| {});

        assert!(world.get::<Position>("Position", entity).is_none());
        assert!(world.get::<Velocity>("Velocity", entity).is_none());
        assert!(!world.is_alive(entity));
    }

    #[test]
    fn pool_destroy_deferred_returns_to_pool_instead_of_registry() {
        let mut world = World::new();
        let pool_id = world.create_pool(0, 4);
        world.register_component::<Position>("Position");
        let component_id = world.entities.lookup_named("Position").unwrap();
        {
            let World { pools, components, .. } = &mut world;
            pools
                .get_mut(&pool_id)
                .unwrap()
                .set_prototype_component(components, component_id, Position(0.0));
        }

        let entity = world.request_from_pool(pool_id);
        world.drain_with(|_| {});
        assert!(world.get::<Position>("Position", entity).is_some());

        world.destroy_deferred(entity);
        world.drain_with(|_| {});

        let recycled = world.request_from_pool(pool_id);
        assert_eq!(recycled.index(), entity.index());
        assert_eq!(recycled.version(), entity.version() + 1);
    }

    #[test]
    fn movement_system_updates_position_from_velocity() {
        fn movement(ctx: &mut crate::scheduler::SystemContext) {
            // Copy out everything needed after the query call up front:
            // `ctx.query` reborrows `ctx` mutably for as long as the
            // returned `&QueryState` is alive, so nothing else can borrow
            // `ctx` again until the state goes unused.
            let entities = ctx.entities;
            let components = ctx.components;
            let thread_id = ctx.thread_id;
            let thread_max = ctx.thread_max;
            let delta_time = ctx.delta_time;
            let position_id = entities.lookup_named("Position").unwrap();
            let velocity_id = entities.lookup_named("Velocity").unwrap();

            let state = ctx.query(0, &["Position"], &["Velocity"], &[]);
            let matched: Vec<Entity> = state.iter(components, entities, thread_id, thread_max).collect();

            for entity in matched {
                if let Some(velocity) = components.get::<Velocity>(velocity_id, entity) {
                    let delta = velocity.0 * delta_time as f32;
                    unsafe {
                        if let Some(position) = components.get_mut_unchecked::<Position>(position_id, entity) {
                            position.0 += delta;
                        }
                    }
                }
            }
        }

        let mut world = World::new();
        world.register_phase("update", 60.0, false);
        world.register_system("movement", "update", 0, movement);

        let entity = world.create();
        world.set("Position", entity, Position(0.0));
        world.set("Velocity", entity, Velocity(1.0));

        for _ in 0..60 {
            world.update();
        }

        let position = world.get::<Position>("Position", entity).unwrap();
        assert!(position.0 > 0.0);
    }
}
