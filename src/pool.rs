//! Entity pool: pre-allocated, prototype-initialized entities for cheap
//! reuse of a common component footprint.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::component::{Component, ComponentId, ComponentStore};
use crate::entity::{Entity, EntityRegistry};
use crate::sparse_set::SparseSet;

struct PrototypeComponent {
    id: ComponentId,
    copy_to: Box<dyn Fn(&ComponentStore, Entity, Entity, bool) + Send + Sync>,
}

/// Tallies how effectively a pool is being reused.
#[derive(Debug, Default, Clone, Copy)]
pub struct PoolStats {
    /// Total [`EntityPool::request`] calls.
    pub total_requests: u64,
    /// Total [`EntityPool::return_entity`] calls.
    pub total_returns: u64,
    /// Requests that found the free list empty and had to create a fresh
    /// entity instead of recycling one.
    pub cache_misses: u64,
}

/// A set of entities that share a prototype component footprint, reused
/// via a free list instead of being destroyed and recreated.
///
/// Every request copies the prototype entity's registered components onto
/// the returned entity through the ordinary deferred `SET` queue — so a
/// requested entity's components only become visible after the next
/// drain, same as any other deferred write.
pub struct EntityPool {
    id: u32,
    prototype: Entity,
    components: Vec<PrototypeComponent>,
    component_ids_set: SparseSet<()>,
    free_list: Mutex<Vec<Entity>>,
    initial_size: usize,
    realloc_block_size: usize,
    propagate_component_changes: bool,
    stat_total_requests: AtomicU64,
    stat_total_returns: AtomicU64,
    stat_cache_misses: AtomicU64,
}

impl EntityPool {
    /// Creates a pool with a fresh, unmanaged prototype entity. `id` must
    /// be unique among pools sharing an [`EntityRegistry`]; the world
    /// assigns it.
    #[must_use]
    pub fn new(id: u32, entities: &EntityRegistry, initial_size: usize, realloc_block_size: usize) -> Self {
        let prototype = entities.create();
        entities.set_unmanaged(prototype);
        Self {
            id,
            prototype,
            components: Vec::new(),
            component_ids_set: SparseSet::new(),
            free_list: Mutex::new(Vec::new()),
            initial_size,
            realloc_block_size: realloc_block_size.max(1),
            propagate_component_changes: true,
            stat_total_requests: AtomicU64::new(0),
            stat_total_returns: AtomicU64::new(0),
            stat_cache_misses: AtomicU64::new(0),
        }
    }

    /// This pool's id, as recorded on every entity it manages.
    #[inline]
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The prototype entity whose component values are copied onto every
    /// requested entity.
    #[inline]
    #[must_use]
    pub fn prototype(&self) -> Entity {
        self.prototype
    }

    /// Whether `component_id` is part of this pool's prototype footprint.
    #[must_use]
    pub fn contains_component(&self, component_id: ComponentId) -> bool {
        self.component_ids_set.contains(component_id.index())
    }

    /// Sets a prototype component value directly on the prototype entity,
    /// registering it with the pool's footprint if this is the first time
    /// `component_id` has been set on this pool.
    pub fn set_prototype_component<T: Component + Clone>(
        &mut self,
        store: &mut ComponentStore,
        component_id: ComponentId,
        value: T,
    ) {
        store.register::<T>(component_id);
        store.set(component_id, self.prototype, value);

        if !self.component_ids_set.contains(component_id.index()) {
            self.component_ids_set.insert(component_id.index(), ());
            self.components.push(PrototypeComponent {
                id: component_id,
                copy_to: Box::new(move |store, prototype, entity, propagate| {
                    if let Some(value) = store.get::<T>(component_id, prototype) {
                        store.enqueue_set(component_id, entity, value.clone(), propagate);
                    }
                }),
            });
        }
    }

    /// Convenience over [`set_prototype_component`](Self::set_prototype_component)
    /// that resolves (or creates) a named component id first.
    pub fn set_prototype_named_component<T: Component + Clone>(
        &mut self,
        entities: &EntityRegistry,
        store: &mut ComponentStore,
        name: &str,
        value: T,
    ) {
        let component_id = entities.create_named(name);
        self.set_prototype_component(store, component_id, value);
    }

    /// Current usage statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            total_requests: self.stat_total_requests.load(Ordering::Relaxed),
            total_returns: self.stat_total_returns.load(Ordering::Relaxed),
            cache_misses: self.stat_cache_misses.load(Ordering::Relaxed),
        }
    }

    /// Requests an entity: pops one off the free list, or allocates a
    /// fresh one on a cache miss. Either way the prototype's components
    /// are (re-)applied via deferred `SET`, and the entity is marked
    /// managed so it becomes visible to queries once the actions drain.
    pub fn request(&self, entities: &EntityRegistry, store: &ComponentStore) -> Entity {
        self.stat_total_requests.fetch_add(1, Ordering::Relaxed);

        let entity = {
            let mut free_list = self.free_list.lock().unwrap();
            free_list.pop()
        };

        let entity = match entity {
            Some(entity) => entity,
            None => {
                self.stat_cache_misses.fetch_add(1, Ordering::Relaxed);
                self.create_managed_entity(entities)
            }
        };

        self.init_entity(entities, store, entity);
        entity
    }

    fn create_managed_entity(&self, entities: &EntityRegistry) -> Entity {
        let entity = entities.create_deferred();
        entities.set_unmanaged(entity);
        entities.set_managed_by(entity, self.id);
        entity
    }

    fn init_entity(&self, entities: &EntityRegistry, store: &ComponentStore, entity: Entity) {
        for component in &self.components {
            (component.copy_to)(store, self.prototype, entity, self.propagate_component_changes);
            store.enqueue_dummy_add(component.id, entity, self.propagate_component_changes);
        }
        entities.set_managed(entity);
    }

    fn deinit_entity(&self, entities: &EntityRegistry, store: &ComponentStore, entity: Entity) {
        for component in &self.components {
            store.enqueue_dummy_remove(component.id, entity, self.propagate_component_changes);
        }
        entities.set_unmanaged(entity);
    }

    /// Returns an entity to the pool's free list directly. Most callers
    /// should instead call [`EntityRegistry::destroy_deferred`] on a
    /// pool-managed entity and let the world's drain route it here
    /// automatically (see [`Self::handle_pre_destroy`]).
    pub fn return_entity(&self, entities: &EntityRegistry, store: &ComponentStore, entity: Entity) {
        let bumped = entities.bump_version(entity);
        self.free_list.lock().unwrap().push(bumped);
        self.deinit_entity(entities, store, entity);
        self.stat_total_returns.fetch_add(1, Ordering::Relaxed);
    }

    /// Called from the world's deferred-action pre-processing pass for an
    /// entity this pool owns that was marked for destruction. Removes any
    /// component the entity picked up beyond the prototype footprint
    /// (prototype components are left in place — the next request
    /// overwrites them anyway), then routes the entity back to the free
    /// list instead of letting the registry recycle the slot.
    pub fn handle_pre_destroy(&self, entities: &EntityRegistry, store: &ComponentStore, entity: Entity) {
        for &component_id in store.component_ids() {
            if self.contains_component(component_id) {
                continue;
            }
            if store.has(component_id, entity) {
                store.enqueue_remove(component_id, entity, true);
            }
        }

        entities.clear_destroyed_flag(entity);
        self.return_entity(entities, store, entity);
    }

    /// Tops up the free list by pre-creating and immediately returning a
    /// batch of entities, scaled by recent cache-miss pressure: the first
    /// top-up uses `initial_size`, later ones scale with
    /// `realloc_block_size * cache_misses` the way a repeatedly-starved
    /// pool grows faster than a barely-used one.
    pub fn refill(&self, entities: &EntityRegistry, store: &ComponentStore) {
        let misses = self.stat_cache_misses.load(Ordering::Relaxed);
        let count = if misses <= 1 {
            self.initial_size
        } else {
            self.realloc_block_size * misses as usize
        };

        for _ in 0..count {
            let entity = self.create_managed_entity(entities);
            self.init_entity(entities, store, entity);
            self.deinit_entity(entities, store, entity);
            self.return_entity(entities, store, entity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct Health(i32);

    #[test]
    fn request_copies_prototype_component_via_deferred_set() {
        let entities = EntityRegistry::new();
        let mut store = ComponentStore::new();
        let health_id = entities.create_named("Health");

        let mut pool = EntityPool::new(0, &entities, 0, 4);
        pool.set_prototype_component(&mut store, health_id, Health(100));

        let entity = pool.request(&entities, &store);
        assert!(store.get::<Health>(health_id, entity).is_none());

        store.drain();
        assert_eq!(store.get::<Health>(health_id, entity), Some(&Health(100)));
    }

    #[test]
    fn returned_entities_are_reused_before_creating_new_ones() {
        let entities = EntityRegistry::new();
        let mut store = ComponentStore::new();
        let health_id = entities.create_named("Health");
        let mut pool = EntityPool::new(0, &entities, 0, 4);
        pool.set_prototype_component(&mut store, health_id, Health(10));

        let first = pool.request(&entities, &store);
        store.drain();
        pool.return_entity(&entities, &store, first);
        store.drain();

        let second = pool.request(&entities, &store);
        assert_eq!(second.index(), first.index());
        assert_eq!(second.version(), first.version() + 1);
        assert_eq!(pool.stats().cache_misses, 1);
    }

    #[test]
    fn refill_grows_free_list_without_requests() {
        let entities = EntityRegistry::new();
        let store = ComponentStore::new();
        let pool = EntityPool::new(0, &entities, 3, 4);
        pool.refill(&entities, &store);
        assert_eq!(pool.free_list.lock().unwrap().len(), 3);
    }
}
