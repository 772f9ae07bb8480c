//! Multi-component query engine: picks a master column, merge-joins the
//! rest against it, and slices the master's range across worker threads.

use crate::component::ComponentStore;
use crate::entity::{Entity, EntityRegistry};

/// A resolved, reusable query plan.
///
/// Built once per call site and cached by the scheduler under a small
/// integer key (see [`crate::scheduler::SystemContext::query`]) so the
/// name-to-id resolution and master-column selection only happen when the
/// underlying columns have actually changed shape, not on every iteration.
pub struct QueryState {
    /// Components that must be present; drives the merge-join.
    read_write: Vec<Entity>,
    /// Subset of `read_write` the caller intends to write through —
    /// tracked separately only so callers can assert write access without
    /// re-deriving it, the merge itself doesn't care.
    write_only: Vec<Entity>,
    /// Components fetched opportunistically when present, never required.
    optional: Vec<Entity>,
    master: usize,
    /// Mutation counters observed for every `read_write` column the last
    /// time the master was (re-)selected, used to detect staleness.
    snapshot: Vec<u64>,
}

impl QueryState {
    /// Resolves a plan over the given component ids. `read` and `write`
    /// are concatenated into the merge-join set in that order; `optional`
    /// components participate in no cursor matching and are just along
    /// for lookups after a match is found.
    #[must_use]
    pub fn new(store: &ComponentStore, read: &[Entity], write: &[Entity], optional: &[Entity]) -> Self {
        let mut read_write = Vec::with_capacity(read.len() + write.len());
        read_write.extend_from_slice(read);
        read_write.extend_from_slice(write);

        let mut state = Self {
            read_write,
            write_only: write.to_vec(),
            optional: optional.to_vec(),
            master: usize::MAX,
            snapshot: Vec::new(),
        };
        state.select_master(store);
        state
    }

    /// Components participating in the merge-join.
    #[must_use]
    pub fn read_write_ids(&self) -> &[Entity] {
        &self.read_write
    }

    /// The subset of [`read_write_ids`](Self::read_write_ids) marked for
    /// writing.
    #[must_use]
    pub fn write_ids(&self) -> &[Entity] {
        &self.write_only
    }

    /// Components fetched without being required.
    #[must_use]
    pub fn optional_ids(&self) -> &[Entity] {
        &self.optional
    }

    fn select_master(&mut self, store: &ComponentStore) {
        self.master = usize::MAX;
        self.snapshot.clear();
        let mut smallest = u64::MAX;
        for (i, &id) in self.read_write.iter().enumerate() {
            let Some(len) = store.column_len(id) else {
                self.master = usize::MAX;
                return;
            };
            self.snapshot.push(store.mutation_count(id).unwrap_or(0));
            let len = len as u64;
            if len < smallest {
                smallest = len;
                self.master = i;
            }
        }
    }

    /// Re-selects the master column if any tracked column's mutation
    /// count moved since the plan was built or last refreshed.
    pub fn refresh_if_stale(&mut self, store: &ComponentStore) {
        let stale = self
            .read_write
            .iter()
            .zip(self.snapshot.iter())
            .any(|(&id, &seen)| store.mutation_count(id) != Some(seen));
        if stale || self.master == usize::MAX {
            self.select_master(store);
        }
    }

    /// Builds the iterator for one thread's slice of this query.
    ///
    /// `thread_id` and `thread_max` describe the caller's position among
    /// the system's worker threads. `thread_max == u64::MAX` is a
    /// dedicated sentinel meaning "match nothing" — used by a thread
    /// context that exists only to satisfy the `thread_count + 1` context
    /// array but should never actually run a slice of work.
    #[must_use]
    pub fn iter<'s>(
        &'s self,
        store: &'s ComponentStore,
        entities: &'s EntityRegistry,
        thread_id: u64,
        thread_max: u64,
    ) -> QueryIter<'s> {
        if self.master == usize::MAX || thread_max == u64::MAX {
            return QueryIter::empty(self, store, entities);
        }

        let master_id = self.read_write[self.master];
        let master_len = store.column_len(master_id).unwrap_or(0) as u64;

        let (cursor_start, cursor_max) = if thread_max > 1 {
            let chunk = master_len / thread_max;
            let start = thread_id * chunk;
            let end = if thread_id == thread_max - 1 {
                master_len
            } else {
                start + chunk
            };
            (start, end)
        } else {
            (0, master_len)
        };

        QueryIter {
            state: self,
            store,
            entities,
            cursor: cursor_start,
            cursor_max,
        }
    }
}

/// Iterates the entities matching one thread's slice of a [`QueryState`].
///
/// Yields entity ids in master-column order; callers fetch typed
/// component data afterward via [`ComponentStore::get`] /
/// [`ComponentStore::get_mut`]. Keeping the merge-join decoupled from
/// typed access avoids needing unsafe aliasing tricks to borrow several
/// columns mutably at once.
pub struct QueryIter<'s> {
    state: &'s QueryState,
    store: &'s ComponentStore,
    entities: &'s EntityRegistry,
    cursor: u64,
    cursor_max: u64,
}

impl<'s> QueryIter<'s> {
    fn empty(state: &'s QueryState, store: &'s ComponentStore, entities: &'s EntityRegistry) -> Self {
        Self {
            state,
            store,
            entities,
            cursor: 0,
            cursor_max: 0,
        }
    }

    /// Whether an entity has an entry in every component of the
    /// read/write set other than the master, via binary search over each
    /// column's sorted key slice.
    fn matches_all(&self, entity_key: u32) -> bool {
        for (i, &id) in self.state.read_write.iter().enumerate() {
            if i == self.state.master {
                continue;
            }
            let Some(keys) = self.store.column_keys(id) else {
                return false;
            };
            if keys.binary_search(&entity_key).is_err() {
                return false;
            }
        }
        true
    }
}

impl<'s> Iterator for QueryIter<'s> {
    type Item = Entity;

    fn next(&mut self) -> Option<Entity> {
        if self.state.master == usize::MAX {
            return None;
        }
        let master_id = self.state.read_write[self.state.master];
        let master_keys = self.store.column_keys(master_id)?;

        loop {
            if self.cursor >= self.cursor_max {
                return None;
            }
            let key = *master_keys.get(self.cursor as usize)?;
            let entity = self
                .store
                .entity_at(master_id, self.cursor as usize)
                .unwrap_or_else(|| Entity::from_parts(key, 0));

            self.cursor += 1;

            if self.entities.is_unmanaged(entity) {
                continue;
            }
            if self.matches_all(key) {
                return Some(entity);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentStore;
    use crate::entity::EntityRegistry;

    #[derive(Debug, PartialEq)]
    struct Position(f32);
    #[derive(Debug, PartialEq)]
    struct Velocity(f32);

    #[test]
    fn merge_join_only_yields_entities_present_in_every_column() {
        let entities = EntityRegistry::new();
        let mut store = ComponentStore::new();

        let position = entities.create_named("Position");
        let velocity = entities.create_named("Velocity");

        let with_both = entities.create();
        let position_only = entities.create();

        store.register::<Position>(position);
        store.register::<Velocity>(velocity);

        store.set(position, with_both, Position(0.0));
        store.set(velocity, with_both, Velocity(1.0));
        store.set(position, position_only, Position(2.0));

        let state = QueryState::new(&store, &[position, velocity], &[], &[]);
        let matched: Vec<Entity> = state.iter(&store, &entities, 0, 1).collect();

        assert_eq!(matched, vec![with_both]);
    }

    #[test]
    fn thread_slicing_partitions_master_without_overlap() {
        let entities = EntityRegistry::new();
        let mut store = ComponentStore::new();
        let position = entities.create_named("Position");
        store.register::<Position>(position);

        let mut made = Vec::new();
        for i in 0..10 {
            let e = entities.create();
            store.set(position, e, Position(i as f32));
            made.push(e);
        }

        let state = QueryState::new(&store, &[position], &[], &[]);
        let mut seen = Vec::new();
        for thread_id in 0..4 {
            seen.extend(state.iter(&store, &entities, thread_id, 4));
        }
        seen.sort_by_key(Entity::index);
        let mut expected = made;
        expected.sort_by_key(Entity::index);
        assert_eq!(seen, expected);
    }

    #[test]
    fn unmanaged_entities_are_skipped() {
        let entities = EntityRegistry::new();
        let mut store = ComponentStore::new();
        let position = entities.create_named("Position");
        store.register::<Position>(position);

        let visible = entities.create();
        let hidden = entities.create();
        store.set(position, visible, Position(0.0));
        store.set(position, hidden, Position(0.0));
        entities.set_unmanaged(hidden);

        let state = QueryState::new(&store, &[position], &[], &[]);
        let matched: Vec<Entity> = state.iter(&store, &entities, 0, 1).collect();
        assert_eq!(matched, vec![visible]);
    }
}
