//! Entity identity: allocation, recycling, naming, and deferred lifecycle actions.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use rustc_hash::FxHashMap;

/// A 64-bit entity handle.
///
/// The high and low halves can be read either as `(index, version)` — the
/// form the core uses for every allocation and alive-check — or as
/// `(entity_a, entity_b)`, a raw pair encoding relationships ("pairs") that
/// the core never interprets itself but always preserves.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Entity(u64);

/// Reserved sentinel entity. Slot 0 is created when the registry is
/// initialized and is a valid, addressable entity like any other.
pub const NULL_ENTITY: Entity = Entity(0);

impl Entity {
    /// Builds an entity from its raw 64-bit value.
    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Returns the raw 64-bit value.
    #[inline]
    #[must_use]
    pub const fn to_bits(self) -> u64 {
        self.0
    }

    /// Builds an entity from an `(index, version)` pair.
    #[inline]
    #[must_use]
    pub const fn from_parts(index: u32, version: u32) -> Self {
        Self(((version as u64) << 32) | index as u64)
    }

    /// Builds a "pair" entity from two raw halves. The core stores and
    /// returns this value but never interprets it; it exists for callers
    /// that want relationship-style ids.
    #[inline]
    #[must_use]
    pub const fn from_pair(entity_a: u32, entity_b: u32) -> Self {
        Self::from_parts(entity_a, entity_b)
    }

    /// The registry slot this entity occupies.
    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }

    /// The generation this entity was allocated at.
    #[inline]
    #[must_use]
    pub const fn version(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// The first half of the pair interpretation. Identical to [`index`](Self::index).
    #[inline]
    #[must_use]
    pub const fn entity_a(self) -> u32 {
        self.index()
    }

    /// The second half of the pair interpretation. Identical to [`version`](Self::version).
    #[inline]
    #[must_use]
    pub const fn entity_b(self) -> u32 {
        self.version()
    }
}

impl std::fmt::Debug for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Entity")
            .field(&self.index())
            .field(&self.version())
            .finish()
    }
}

/// Action queued against a specific entity slot, applied during the
/// deferred-entity-action drain (§4.5 step 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityAction {
    /// Clears the `destroyed` flag set optimistically at enqueue time.
    Create,
    /// Recycles the slot: bumps `version`, frees the name, pushes onto the
    /// destroyed stack. Pool-owned entities are skipped here — they were
    /// already routed back to their pool during pre-processing.
    Destroy,
}

struct PendingAction {
    entity: Entity,
    action: EntityAction,
}

/// Per-slot bookkeeping. One record exists per allocated index for the
/// lifetime of the registry; slots are recycled, never freed.
struct EntityRecord {
    id: Entity,
    destroyed: AtomicBool,
    unmanaged: AtomicBool,
    /// Opaque pool identifier. `None` when the entity isn't pool-managed.
    managed_by: Option<u32>,
    name: Option<Box<str>>,
}

impl EntityRecord {
    fn new(index: u32) -> Self {
        Self {
            id: Entity::from_parts(index, 0),
            destroyed: AtomicBool::new(false),
            unmanaged: AtomicBool::new(false),
            managed_by: None,
            name: None,
        }
    }
}

/// Allocates entity ids, recycles them, tracks names, and stages deferred
/// creates/destroys.
///
/// `create`/`destroy` are immediate and serialized by a single mutex on the
/// records vector; deferred variants only need to flip an atomic flag and
/// push to a queue guarded by its own lock, so they stay cheap to call from
/// any system thread.
pub struct EntityRegistry {
    records: Mutex<Vec<EntityRecord>>,
    destroyed_stack: Mutex<Vec<u32>>,
    names: Mutex<FxHashMap<Box<str>, u32>>,
    deferred: Mutex<Vec<PendingAction>>,
    len: AtomicU32,
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityRegistry {
    /// Creates a registry with slot 0 already allocated as the reserved
    /// sentinel entity.
    #[must_use]
    pub fn new() -> Self {
        let registry = Self {
            records: Mutex::new(Vec::new()),
            destroyed_stack: Mutex::new(Vec::new()),
            names: Mutex::new(FxHashMap::default()),
            deferred: Mutex::new(Vec::new()),
            len: AtomicU32::new(0),
        };
        let sentinel = registry.create();
        debug_assert_eq!(sentinel, NULL_ENTITY);
        registry
    }

    /// Allocates a new entity, recycling a destroyed slot if one is
    /// available. Thread-safe; serialized by an internal mutex.
    pub fn create(&self) -> Entity {
        let mut records = self.records.lock().unwrap();
        self.create_locked(&mut records)
    }

    fn create_locked(&self, records: &mut Vec<EntityRecord>) -> Entity {
        let mut destroyed = self.destroyed_stack.lock().unwrap();
        if let Some(index) = destroyed.pop() {
            let record = &mut records[index as usize];
            record.destroyed.store(false, Ordering::Release);
            return record.id;
        }
        drop(destroyed);

        let index = records.len() as u32;
        records.push(EntityRecord::new(index));
        self.len.store(records.len() as u32, Ordering::Release);
        records[index as usize].id
    }

    /// Creates (or looks up) a named entity. Calling this twice with the
    /// same name is idempotent and returns the same id (§8 "Name
    /// uniqueness").
    pub fn create_named(&self, name: &str) -> Entity {
        let mut records = self.records.lock().unwrap();
        let mut names = self.names.lock().unwrap();
        if let Some(&index) = names.get(name) {
            return records[index as usize].id;
        }
        let entity = self.create_locked(&mut records);
        names.insert(name.into(), entity.index());
        records[entity.index() as usize].name = Some(name.into());
        entity
    }

    /// Allocates the slot immediately (so the returned id is stable) but
    /// marks it destroyed and enqueues a [`EntityAction::Create`]; the
    /// `destroyed` flag clears when the action drains.
    pub fn create_deferred(&self) -> Entity {
        let entity = self.create();
        self.mark_pending_create(entity);
        entity
    }

    /// Same as [`create_deferred`](Self::create_deferred) but binds a name
    /// first.
    pub fn create_named_deferred(&self, name: &str) -> Entity {
        let entity = self.create_named(name);
        self.mark_pending_create(entity);
        entity
    }

    fn mark_pending_create(&self, entity: Entity) {
        let records = self.records.lock().unwrap();
        records[entity.index() as usize]
            .destroyed
            .store(true, Ordering::Release);
        drop(records);
        self.deferred.lock().unwrap().push(PendingAction {
            entity,
            action: EntityAction::Create,
        });
    }

    /// Destroys an entity immediately: bumps `version`, clears its name,
    /// and pushes it onto the destroyed stack. A no-op if already
    /// destroyed.
    pub fn destroy(&self, entity: Entity) {
        let mut records = self.records.lock().unwrap();
        let record = &mut records[entity.index() as usize];
        if record
            .destroyed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.recycle_locked(&mut records, entity.index());
    }

    fn recycle_locked(&self, records: &mut [EntityRecord], index: u32) {
        let record = &mut records[index as usize];
        record.id = Entity::from_parts(index, record.id.version().wrapping_add(1));
        if let Some(name) = record.name.take() {
            self.names.lock().unwrap().remove(&*name);
        }
        record.managed_by = None;
        self.destroyed_stack.lock().unwrap().push(index);
    }

    /// Requests destruction at the next deferred drain. Idempotent under
    /// concurrent callers: the `destroyed` flag is flipped by a single
    /// compare-exchange, so only the winning caller enqueues the action.
    ///
    /// The entity is considered dead to [`is_alive`](Self::is_alive)
    /// immediately — `version` does not bump until the action is actually
    /// drained (§9 Open Question, resolved).
    pub fn destroy_deferred(&self, entity: Entity) {
        let records = self.records.lock().unwrap();
        let record = &records[entity.index() as usize];
        if record
            .destroyed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        drop(records);
        self.deferred.lock().unwrap().push(PendingAction {
            entity,
            action: EntityAction::Destroy,
        });
    }

    /// Marks an entity unmanaged: hidden from iteration and scheduler
    /// dispatch without being destroyed.
    pub fn set_unmanaged(&self, entity: Entity) {
        let records = self.records.lock().unwrap();
        records[entity.index() as usize]
            .unmanaged
            .store(true, Ordering::Release);
    }

    /// Clears the unmanaged flag, making the entity visible again.
    pub fn set_managed(&self, entity: Entity) {
        let records = self.records.lock().unwrap();
        records[entity.index() as usize]
            .unmanaged
            .store(false, Ordering::Release);
    }

    /// Whether the entity is currently hidden from iteration/dispatch.
    #[must_use]
    pub fn is_unmanaged(&self, entity: Entity) -> bool {
        let records = self.records.lock().unwrap();
        records
            .get(entity.index() as usize)
            .is_some_and(|r| r.unmanaged.load(Ordering::Acquire))
    }

    /// Records which pool owns an entity, so destroy requests route to it.
    pub(crate) fn set_managed_by(&self, entity: Entity, pool_id: u32) {
        let mut records = self.records.lock().unwrap();
        records[entity.index() as usize].managed_by = Some(pool_id);
    }

    /// Returns the pool id that owns this entity, if any.
    #[must_use]
    pub(crate) fn managed_by(&self, entity: Entity) -> Option<u32> {
        let records = self.records.lock().unwrap();
        records.get(entity.index() as usize).and_then(|r| r.managed_by)
    }

    /// Clears pool ownership, returning the entity to direct registry
    /// management.
    pub(crate) fn clear_managed_by(&self, entity: Entity) {
        let mut records = self.records.lock().unwrap();
        records[entity.index() as usize].managed_by = None;
    }

    /// Bumps the version at `entity`'s slot without recycling it through
    /// the registry's own destroyed stack or touching its name — pools
    /// manage the free list themselves and call this when an entity comes
    /// back to them instead of to the registry.
    pub(crate) fn bump_version(&self, entity: Entity) -> Entity {
        let mut records = self.records.lock().unwrap();
        let record = &mut records[entity.index() as usize];
        record.id = Entity::from_parts(entity.index(), record.id.version().wrapping_add(1));
        record.id
    }

    /// Clears the `destroyed` flag directly, without going through
    /// [`EntityAction::Create`]. Used when a pool intercepts a destroy
    /// request for an entity it owns and returns it to its free list
    /// instead of letting the registry recycle the slot.
    pub(crate) fn clear_destroyed_flag(&self, entity: Entity) {
        let records = self.records.lock().unwrap();
        records[entity.index() as usize]
            .destroyed
            .store(false, Ordering::Release);
    }

    /// Whether `entity`'s version still matches the live slot's version.
    #[must_use]
    pub fn is_alive(&self, entity: Entity) -> bool {
        let records = self.records.lock().unwrap();
        match records.get(entity.index() as usize) {
            Some(record) => {
                record.id.version() == entity.version()
                    && !record.destroyed.load(Ordering::Acquire)
            }
            None => false,
        }
    }

    /// Whether `entity`'s slot is currently marked destroyed (including
    /// entities that are pending-destroyed but not yet recycled).
    #[must_use]
    pub fn is_destroyed(&self, entity: Entity) -> bool {
        let records = self.records.lock().unwrap();
        records
            .get(entity.index() as usize)
            .is_some_and(|r| r.destroyed.load(Ordering::Acquire))
    }

    /// Looks up an entity's current id by name.
    #[must_use]
    pub fn lookup_named(&self, name: &str) -> Option<Entity> {
        let names = self.names.lock().unwrap();
        let index = *names.get(name)?;
        drop(names);
        let records = self.records.lock().unwrap();
        Some(records[index as usize].id)
    }

    /// Returns the name bound to an entity, if any.
    #[must_use]
    pub fn name_of(&self, entity: Entity) -> Option<String> {
        let records = self.records.lock().unwrap();
        records
            .get(entity.index() as usize)
            .and_then(|r| r.name.as_deref().map(str::to_owned))
    }

    /// Number of allocated slots, alive and destroyed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire) as usize
    }

    /// Whether no slots have been allocated (never true once `new` has run,
    /// since slot 0 always exists).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Applies every queued [`EntityAction`] in enqueue order, then clears
    /// the queue. `is_pool_managed` lets the caller (the scheduler's drain
    /// driver) skip recycling entities a pool already reclaimed in its
    /// pre-processing pass.
    pub fn drain_deferred(&self, mut is_pool_managed: impl FnMut(Entity) -> bool) {
        let pending = std::mem::take(&mut *self.deferred.lock().unwrap());
        let mut records = self.records.lock().unwrap();
        for pending in pending {
            match pending.action {
                EntityAction::Create => {
                    records[pending.entity.index() as usize]
                        .destroyed
                        .store(false, Ordering::Release);
                }
                EntityAction::Destroy => {
                    if is_pool_managed(pending.entity) {
                        continue;
                    }
                    self.recycle_locked(&mut records, pending.entity.index());
                }
            }
        }
    }

    /// Iterates every pending deferred entity action without draining it,
    /// for the pre-processing destroy pass (§4.5 step 1).
    pub(crate) fn for_each_pending_destroy(&self, mut f: impl FnMut(Entity)) {
        for pending in self.deferred.lock().unwrap().iter() {
            if pending.action == EntityAction::Destroy {
                f(pending.entity);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_zero_is_reserved_and_alive() {
        let registry = EntityRegistry::new();
        assert_eq!(registry.len(), 1);
        assert!(registry.is_alive(NULL_ENTITY));
    }

    #[test]
    fn recycling_bumps_version_and_reuses_index() {
        let registry = EntityRegistry::new();
        let a = registry.create();
        let b = registry.create();
        registry.destroy(a);
        registry.destroy(b);

        let a2 = registry.create();
        let b2 = registry.create();

        assert_eq!(a2.index(), b.index());
        assert_eq!(b2.index(), a.index());
        assert_eq!(b2.version(), a.version() + 1);
        assert!(!registry.is_alive(a));
        assert!(!registry.is_alive(b));
    }

    #[test]
    fn create_named_is_idempotent() {
        let registry = EntityRegistry::new();
        let first = registry.create_named("Player");
        let second = registry.create_named("Player");
        assert_eq!(first, second);
        assert_eq!(registry.lookup_named("Player"), Some(first));
    }

    #[test]
    fn destroy_deferred_marks_dead_before_drain() {
        let registry = EntityRegistry::new();
        let entity = registry.create();
        registry.destroy_deferred(entity);

        assert!(!registry.is_alive(entity));
        assert_eq!(entity.version(), 0);

        registry.drain_deferred(|_| false);
        assert!(!registry.is_alive(entity));

        let recycled = registry.create();
        assert_eq!(recycled.index(), entity.index());
        assert_eq!(recycled.version(), entity.version() + 1);
    }

    #[test]
    fn double_destroy_is_a_no_op() {
        let registry = EntityRegistry::new();
        let entity = registry.create();
        registry.destroy(entity);
        let after_first = registry.name_of(entity);
        registry.destroy(entity);
        assert_eq!(registry.name_of(entity), after_first);
    }
}
