//! Type-erased component columns and the deferred mutation pipeline that
//! feeds them.

use std::any::{Any, TypeId};
use std::sync::Mutex;

use rustc_hash::FxHashMap;

use crate::entity::Entity;
use crate::sparse_set::SparseSet;

/// Marker for anything storable as a component. Blanket-implemented; no
/// methods of its own, it just bounds what [`ComponentStore::register`]
/// will accept.
pub trait Component: Any + Send + Sync {}
impl<T: Any + Send + Sync> Component for T {}

/// Components and process phases are both just entities; this alias
/// documents call sites that mean "an entity used as a component key".
pub type ComponentId = Entity;

/// Object-safe face of a typed column, letting the store and the query
/// engine work with columns without knowing their element type.
trait AnyColumn: Send + Sync {
    fn len(&self) -> usize;
    fn mutation_count(&self) -> u64;
    fn keys(&self) -> &[u32];
    fn entity_at(&self, dense_index: usize) -> Option<Entity>;
    fn remove_raw(&mut self, key: u32) -> bool;
    fn set_erased(&mut self, entity: Entity, value: Box<dyn Any + Send>) -> bool;
    fn sort(&mut self);
    fn type_id(&self) -> TypeId;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

struct Column<T> {
    set: SparseSet<(Entity, T)>,
}

impl<T: Component> Column<T> {
    fn new() -> Self {
        Self { set: SparseSet::new() }
    }
}

impl<T: Component> AnyColumn for Column<T> {
    fn len(&self) -> usize {
        self.set.len()
    }

    fn mutation_count(&self) -> u64 {
        self.set.mutation_count()
    }

    fn keys(&self) -> &[u32] {
        self.set.keys()
    }

    fn entity_at(&self, dense_index: usize) -> Option<Entity> {
        self.set.values().get(dense_index).map(|(e, _)| *e)
    }

    fn remove_raw(&mut self, key: u32) -> bool {
        self.set.remove(key).is_some()
    }

    fn set_erased(&mut self, entity: Entity, value: Box<dyn Any + Send>) -> bool {
        match value.downcast::<T>() {
            Ok(value) => {
                self.set.insert(entity.index(), (entity, *value));
                true
            }
            Err(_) => false,
        }
    }

    fn sort(&mut self) {
        self.set.sort_by_key(|(entity, _)| entity.index());
    }

    fn type_id(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A deferred mutation, resolved into a real one at the next drain (§4.3).
///
/// `Set` carries a type-erased payload because callers enqueue from system
/// threads that can't hold a borrow into the store; it downcasts against
/// the column's element type when the queue drains, and is silently
/// dropped with a `tracing` warning on a type mismatch (a caller bug, not
/// a recoverable condition).
enum DeferredAction {
    Set {
        component: ComponentId,
        entity: Entity,
        value: Box<dyn Any + Send>,
        propagate: bool,
    },
    Remove {
        component: ComponentId,
        entity: Entity,
        propagate: bool,
    },
    RemoveAll {
        entity: Entity,
        propagate: bool,
    },
    /// Signals an observer-visible "add" without touching storage — the
    /// value was already written directly (e.g. the entity pool's
    /// prototype copy), this just lets observers react to it.
    DummyAdd {
        component: ComponentId,
        entity: Entity,
        propagate: bool,
    },
    /// Observer-visible "remove" companion to `DummyAdd`.
    DummyRemove {
        component: ComponentId,
        entity: Entity,
        propagate: bool,
    },
}

/// The action an observer sees, stripped of the erased payload.
#[derive(Debug, Clone, Copy)]
pub enum ObservedAction {
    /// A component was set on an entity.
    Set { component: ComponentId, entity: Entity },
    /// A single component was removed from an entity.
    Remove { component: ComponentId, entity: Entity },
    /// Every component was removed from an entity (entity destruction).
    RemoveAll { entity: Entity },
    /// A component add was signalled without a storage mutation.
    DummyAdd { component: ComponentId, entity: Entity },
    /// A component remove was signalled without a storage mutation.
    DummyRemove { component: ComponentId, entity: Entity },
}

/// Owns every component column plus the queue of not-yet-applied
/// mutations enqueued against them.
///
/// Reads and in-place mutations (`get`, `get_mut`) go straight through to
/// the column; anything that changes which entities are present —
/// `set`/`remove`/`remove_all` as seen from system code — should normally
/// go through the deferred queue instead, so every system in a phase
/// observes the same storage shape.
#[derive(Default)]
pub struct ComponentStore {
    columns: FxHashMap<u32, Box<dyn AnyColumn>>,
    component_ids: Vec<ComponentId>,
    deferred: Mutex<Vec<DeferredAction>>,
}

impl ComponentStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a column for `component_id` if one doesn't already
    /// exist. Idempotent.
    pub fn register<T: Component>(&mut self, component_id: ComponentId) {
        self.columns
            .entry(component_id.index())
            .or_insert_with(|| Box::new(Column::<T>::new()));
        if !self.component_ids.contains(&component_id) {
            self.component_ids.push(component_id);
        }
    }

    /// Every component id with a registered column, in registration
    /// order. The order the deferred-sort pass and the pool's non-matching
    /// removal pass both iterate in.
    #[must_use]
    pub fn component_ids(&self) -> &[ComponentId] {
        &self.component_ids
    }

    fn column<'a>(&'a self, component_id: ComponentId) -> Option<&'a dyn AnyColumn> {
        self.columns.get(&component_id.index()).map(|c| c.as_ref())
    }

    pub(crate) fn mutation_count(&self, component_id: ComponentId) -> Option<u64> {
        self.column(component_id).map(AnyColumn::mutation_count)
    }

    pub(crate) fn column_len(&self, component_id: ComponentId) -> Option<usize> {
        self.column(component_id).map(AnyColumn::len)
    }

    pub(crate) fn column_keys(&self, component_id: ComponentId) -> Option<&[u32]> {
        self.column(component_id).map(AnyColumn::keys)
    }

    pub(crate) fn entity_at(&self, component_id: ComponentId, dense_index: usize) -> Option<Entity> {
        self.column(component_id).and_then(|c| c.entity_at(dense_index))
    }

    /// Whether `entity` has a value in `component_id`'s column.
    #[must_use]
    pub fn has(&self, component_id: ComponentId, entity: Entity) -> bool {
        self.column(component_id)
            .is_some_and(|c| c.keys().binary_search(&entity.index()).is_ok())
    }

    /// Reads a component's value directly (no deferral).
    #[must_use]
    pub fn get<T: Component>(&self, component_id: ComponentId, entity: Entity) -> Option<&T> {
        let column = self.columns.get(&component_id.index())?;
        let column = column.as_any().downcast_ref::<Column<T>>()?;
        column.set.get(entity.index()).map(|(_, value)| value)
    }

    /// Mutably reads a component's value directly (no deferral).
    #[must_use]
    pub fn get_mut<T: Component>(&mut self, component_id: ComponentId, entity: Entity) -> Option<&mut T> {
        let column = self.columns.get_mut(&component_id.index())?;
        let column = column.as_any_mut().downcast_mut::<Column<T>>()?;
        column.set.get_mut(entity.index()).map(|(_, value)| value)
    }

    /// Like [`get`](Self::get), but distinguishes "no column registered
    /// for this id" (`Ok(None)`) from "a column exists, but was
    /// registered with a different type than `T`"
    /// (`Err(WhiskerError::ComponentTypeMismatch)`). Most call sites
    /// should prefer `get`, which folds both cases into the source's
    /// ordinary sentinel-style absence; this is for callers (tooling,
    /// bindings) that need to tell a caller bug apart from a normal miss.
    pub fn try_get<T: Component>(&self, component_id: ComponentId, entity: Entity) -> crate::error::Result<Option<&T>> {
        let Some(column) = self.columns.get(&component_id.index()) else {
            return Ok(None);
        };
        match column.as_any().downcast_ref::<Column<T>>() {
            Some(column) => Ok(column.set.get(entity.index()).map(|(_, value)| value)),
            None => Err(crate::error::WhiskerError::ComponentTypeMismatch { component: component_id }),
        }
    }

    /// Mutable counterpart to [`try_get`](Self::try_get).
    pub fn try_get_mut<T: Component>(&mut self, component_id: ComponentId, entity: Entity) -> crate::error::Result<Option<&mut T>> {
        let Some(column) = self.columns.get_mut(&component_id.index()) else {
            return Ok(None);
        };
        match column.as_any_mut().downcast_mut::<Column<T>>() {
            Some(column) => Ok(column.set.get_mut(entity.index()).map(|(_, value)| value)),
            None => Err(crate::error::WhiskerError::ComponentTypeMismatch { component: component_id }),
        }
    }

    /// Mutably reads a component's value through a shared reference to
    /// the store.
    ///
    /// # Safety
    ///
    /// The caller must ensure no two live calls (on this thread or any
    /// other) return overlapping references into the same column at the
    /// same time — the same discipline [`crate::query::QueryState`]'s
    /// thread-sliced iteration already guarantees by construction, since
    /// each worker thread only visits entities in its own cursor range.
    /// Mirrors the "caller-checked aliasing" contract the rest of the
    /// crate's per-system dispatch already relies on.
    #[must_use]
    pub unsafe fn get_mut_unchecked<T: Component>(&self, component_id: ComponentId, entity: Entity) -> Option<&mut T> {
        let column = self.columns.get(&component_id.index())?;
        let column = column.as_any().downcast_ref::<Column<T>>()?;
        let set = std::ptr::addr_of!(column.set).cast_mut();
        unsafe { (*set).get_mut(entity.index()).map(|(_, value)| value) }
    }

    /// Writes a component's value directly, bypassing the deferred queue.
    /// Used by the entity pool to seed prototype copies and by tests; most
    /// gameplay code should prefer [`enqueue_set`](Self::enqueue_set).
    pub fn set<T: Component>(&mut self, component_id: ComponentId, entity: Entity, value: T) {
        let column = self
            .columns
            .get_mut(&component_id.index())
            .and_then(|c| c.as_any_mut().downcast_mut::<Column<T>>())
            .expect("component column registered before use");
        column.set.insert(entity.index(), (entity, value));
    }

    /// Removes a component's value directly, bypassing the deferred
    /// queue.
    pub fn remove<T: Component>(&mut self, component_id: ComponentId, entity: Entity) -> Option<T> {
        let column = self.columns.get_mut(&component_id.index())?;
        let column = column.as_any_mut().downcast_mut::<Column<T>>()?;
        column.set.remove(entity.index()).map(|(_, value)| value)
    }

    /// Removes every component from `entity` directly.
    pub fn remove_all(&mut self, entity: Entity) {
        for column in self.columns.values_mut() {
            column.remove_raw(entity.index());
        }
    }

    /// Enqueues a `SET` action, resolved at the next drain.
    pub fn enqueue_set<T: Component>(&self, component_id: ComponentId, entity: Entity, value: T, propagate: bool) {
        self.deferred.lock().unwrap().push(DeferredAction::Set {
            component: component_id,
            entity,
            value: Box::new(value),
            propagate,
        });
    }

    /// Enqueues a `REMOVE` action.
    pub fn enqueue_remove(&self, component_id: ComponentId, entity: Entity, propagate: bool) {
        self.deferred.lock().unwrap().push(DeferredAction::Remove {
            component: component_id,
            entity,
            propagate,
        });
    }

    /// Enqueues a `REMOVE_ALL` action (every component on `entity`).
    pub fn enqueue_remove_all(&self, entity: Entity, propagate: bool) {
        self.deferred
            .lock()
            .unwrap()
            .push(DeferredAction::RemoveAll { entity, propagate });
    }

    /// Enqueues a `DUMMY_ADD` observer notification with no storage
    /// effect.
    pub fn enqueue_dummy_add(&self, component_id: ComponentId, entity: Entity, propagate: bool) {
        self.deferred.lock().unwrap().push(DeferredAction::DummyAdd {
            component: component_id,
            entity,
            propagate,
        });
    }

    /// Enqueues a `DUMMY_REMOVE` observer notification with no storage
    /// effect.
    pub fn enqueue_dummy_remove(&self, component_id: ComponentId, entity: Entity, propagate: bool) {
        self.deferred.lock().unwrap().push(DeferredAction::DummyRemove {
            component: component_id,
            entity,
            propagate,
        });
    }

    /// Whether any deferred action is currently enqueued.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.deferred.lock().unwrap().is_empty()
    }

    /// Applies every queued action in FIFO order, then clears the queue.
    /// Equivalent to [`drain_with`](Self::drain_with) with a no-op
    /// observer.
    pub fn drain(&mut self) {
        self.drain_with(|_| {});
    }

    /// Applies every queued action in FIFO order, invoking `observer` for
    /// each one (after it has taken effect, for `Set`/`Remove`/`RemoveAll`;
    /// dummy actions carry no storage effect at all). This is the hook
    /// point for reactive systems that want to run on component change
    /// without being scheduled as a phase.
    pub fn drain_with(&mut self, mut observer: impl FnMut(ObservedAction)) {
        let pending = std::mem::take(&mut *self.deferred.lock().unwrap());
        for action in pending {
            match action {
                DeferredAction::Set {
                    component,
                    entity,
                    value,
                    propagate,
                } => {
                    let applied = self
                        .columns
                        .get_mut(&component.index())
                        .is_some_and(|c| c.set_erased(entity, value));
                    if !applied {
                        tracing::warn!(?component, ?entity, "dropped SET with mismatched component type");
                        continue;
                    }
                    if propagate {
                        observer(ObservedAction::Set { component, entity });
                    }
                }
                DeferredAction::Remove {
                    component,
                    entity,
                    propagate,
                } => {
                    if let Some(column) = self.columns.get_mut(&component.index()) {
                        column.remove_raw(entity.index());
                    }
                    if propagate {
                        observer(ObservedAction::Remove { component, entity });
                    }
                }
                DeferredAction::RemoveAll { entity, propagate } => {
                    self.remove_all(entity);
                    if propagate {
                        observer(ObservedAction::RemoveAll { entity });
                    }
                }
                DeferredAction::DummyAdd {
                    component,
                    entity,
                    propagate,
                } => {
                    if propagate {
                        observer(ObservedAction::DummyAdd { component, entity });
                    }
                }
                DeferredAction::DummyRemove {
                    component,
                    entity,
                    propagate,
                } => {
                    if propagate {
                        observer(ObservedAction::DummyRemove { component, entity });
                    }
                }
            }
        }
    }

    /// Sorts every column whose dense contents changed since its last
    /// sort, keeping keys ascending so the query engine's merge-join can
    /// binary-search it. Each dirty column is pulled out of the map and
    /// sorted on a `rayon` thread pool, one task per column, then put
    /// back — genuinely parallel, since by that point each task owns its
    /// column outright.
    pub fn sort_changed(&mut self, pool: &rayon::ThreadPool) {
        use rayon::prelude::*;

        let dirty_keys: Vec<u32> = self
            .component_ids
            .iter()
            .map(|id| id.index())
            .filter(|key| self.columns.get(key).is_some_and(|c| c.mutation_count() > 0))
            .collect();

        if dirty_keys.is_empty() {
            return;
        }

        let mut taken: Vec<(u32, Box<dyn AnyColumn>)> = dirty_keys
            .into_iter()
            .filter_map(|key| self.columns.remove(&key).map(|c| (key, c)))
            .collect();

        pool.install(|| {
            taken.par_iter_mut().for_each(|(_, column)| column.sort());
        });

        self.columns.extend(taken);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityRegistry;

    struct Position(f32);

    #[test]
    fn direct_set_and_get_round_trip() {
        let entities = EntityRegistry::new();
        let mut store = ComponentStore::new();
        let position = entities.create_named("Position");
        let target = entities.create();

        store.register::<Position>(position);
        store.set(position, target, Position(3.5));

        assert_eq!(store.get::<Position>(position, target).unwrap().0, 3.5);
        assert!(store.has(position, target));
    }

    #[test]
    fn deferred_set_applies_on_drain() {
        let entities = EntityRegistry::new();
        let mut store = ComponentStore::new();
        let position = entities.create_named("Position");
        let target = entities.create();
        store.register::<Position>(position);

        store.enqueue_set(position, target, Position(1.0), true);
        assert!(store.get::<Position>(position, target).is_none());

        let mut observed = Vec::new();
        store.drain_with(|action| observed.push(action));

        assert_eq!(store.get::<Position>(position, target).unwrap().0, 1.0);
        assert_eq!(observed.len(), 1);
    }

    #[test]
    fn remove_all_clears_every_column() {
        let entities = EntityRegistry::new();
        let mut store = ComponentStore::new();
        let position = entities.create_named("Position");
        let target = entities.create();
        store.register::<Position>(position);
        store.set(position, target, Position(1.0));

        store.enqueue_remove_all(target, true);
        store.drain();

        assert!(store.get::<Position>(position, target).is_none());
    }

    #[test]
    fn dummy_actions_do_not_mutate_storage() {
        let entities = EntityRegistry::new();
        let mut store = ComponentStore::new();
        let position = entities.create_named("Position");
        let target = entities.create();
        store.register::<Position>(position);
        store.set(position, target, Position(9.0));

        store.enqueue_dummy_remove(position, target, true);
        let mut observed = Vec::new();
        store.drain_with(|action| observed.push(action));

        assert_eq!(store.get::<Position>(position, target).unwrap().0, 9.0);
        assert_eq!(observed.len(), 1);
    }
}
