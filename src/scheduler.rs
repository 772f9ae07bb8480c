//! Process-phase scheduler: groups systems into named phases, wraps every
//! phase with reserved pre/post phases, and drives each phase's fixed-step
//! update count from its own [`TimeStep`].

use rustc_hash::FxHashMap;

use crate::component::ComponentStore;
use crate::entity::{Entity, EntityRegistry};
use crate::query::QueryState;
use crate::time::TimeStep;

/// Phase every other phase runs before, every frame, regardless of which
/// phases are actually registered. Systems that must see a fully-settled
/// world before anything else runs belong here.
pub const PRE_PHASE: &str = "w_phase_pre_phase_";
/// Phase every other phase runs after, every frame.
pub const POST_PHASE: &str = "w_phase_post_phase_";

const DEFAULT_UPDATE_RATE: f64 = 60.0;

/// A system function. Receives a fresh [`SystemContext`] scoped to its own
/// thread slot for this dispatch.
pub type SystemFn = fn(&mut SystemContext);

struct ThreadSlot {
    thread_id: u64,
    thread_max: u64,
    queries: FxHashMap<u32, QueryState>,
}

struct RegisteredSystem {
    id: Entity,
    phase: Entity,
    run: SystemFn,
    pool: Option<rayon::ThreadPool>,
    slots: Vec<ThreadSlot>,
}

struct RegisteredPhase {
    id: Entity,
    time_step_index: usize,
    manual: bool,
}

struct PhaseTimeStep {
    time_step: TimeStep,
    update_count: u32,
    updated: bool,
}

impl PhaseTimeStep {
    fn advance(&mut self) -> u32 {
        if !self.updated {
            self.update_count = self.time_step.update_count();
            self.updated = true;
        }
        self.update_count
    }

    fn reset(&mut self) {
        self.updated = false;
    }
}

/// Per-dispatch execution context handed to a system.
///
/// Carries shared (not exclusive) access to storage because every
/// structural mutation goes through the deferred queue
/// ([`ComponentStore::enqueue_set`] and friends), which only needs `&self`
/// — this is what lets the scheduler dispatch a multi-threaded system's
/// slots concurrently without synchronizing on a single `&mut`.
pub struct SystemContext<'w> {
    /// The world's entity registry, shared for the duration of this
    /// dispatch.
    pub entities: &'w EntityRegistry,
    /// The world's component store, shared for the duration of this
    /// dispatch.
    pub components: &'w ComponentStore,
    /// The fixed delta time for this system's phase, in seconds.
    pub delta_time: f64,
    /// This thread's position among the system's worker threads, `0` if
    /// the system isn't multi-threaded.
    pub thread_id: u64,
    /// Total worker threads for this system, `1` if not multi-threaded.
    pub thread_max: u64,
    queries: &'w mut FxHashMap<u32, QueryState>,
}

impl<'w> SystemContext<'w> {
    /// Resolves (or returns the cached) query plan at `itor_index`,
    /// re-deriving its master column only if the store changed shape
    /// since last time. `itor_index` just needs to be stable and unique
    /// per query call site within one system — a small sequential counter
    /// is the usual choice.
    pub fn query(&mut self, itor_index: u32, read: &[&str], write: &[&str], optional: &[&str]) -> &QueryState {
        if !self.queries.contains_key(&itor_index) {
            let resolve = |names: &[&str]| -> Vec<Entity> {
                names.iter().map(|name| self.entities.create_named(name)).collect()
            };
            let state = QueryState::new(self.components, &resolve(read), &resolve(write), &resolve(optional));
            self.queries.insert(itor_index, state);
        } else {
            self.queries.get_mut(&itor_index).unwrap().refresh_if_stale(self.components);
        }
        self.queries.get(&itor_index).unwrap()
    }

    /// Iterates the entities matching `state` for this thread's slice.
    pub fn iter<'s>(&'s self, state: &'s QueryState) -> crate::query::QueryIter<'s> {
        state.iter(self.components, self.entities, self.thread_id, self.thread_max)
    }
}

/// Groups systems into process phases and drives their per-phase fixed
/// update counts.
pub struct Scheduler {
    systems: Vec<RegisteredSystem>,
    phases: Vec<RegisteredPhase>,
    phase_systems: FxHashMap<u32, Vec<usize>>,
    time_steps: Vec<PhaseTimeStep>,
    pre_phase: Entity,
    post_phase: Entity,
}

impl Scheduler {
    /// Creates a scheduler with the reserved pre/post phases already
    /// registered on a shared 60Hz time step.
    #[must_use]
    pub fn new(entities: &EntityRegistry) -> Self {
        let mut scheduler = Self {
            systems: Vec::new(),
            phases: Vec::new(),
            phase_systems: FxHashMap::default(),
            time_steps: Vec::new(),
            pre_phase: crate::entity::NULL_ENTITY,
            post_phase: crate::entity::NULL_ENTITY,
        };

        let reserved_ts = scheduler.register_time_step(DEFAULT_UPDATE_RATE, false);
        scheduler.pre_phase = scheduler.register_phase_with_time_step(entities, PRE_PHASE, reserved_ts);
        scheduler.post_phase = scheduler.register_phase_with_time_step(entities, POST_PHASE, reserved_ts);
        scheduler.phase_mut(scheduler.pre_phase).manual = true;
        scheduler.phase_mut(scheduler.post_phase).manual = true;

        scheduler
    }

    fn phase_mut(&mut self, id: Entity) -> &mut RegisteredPhase {
        self.phases.iter_mut().find(|p| p.id == id).expect("phase was just registered")
    }

    /// Re-points the reserved pre/post phases at the first non-manual
    /// phase's time step, so they always tick in lockstep with whatever
    /// phase they currently wrap instead of a time step of their own. A
    /// no-op before both reserved phases exist (during construction) or
    /// if no non-manual phase has been registered yet.
    fn reanchor_reserved_phases(&mut self) {
        if self.pre_phase == crate::entity::NULL_ENTITY || self.post_phase == crate::entity::NULL_ENTITY {
            return;
        }
        let Some(ts_index) = self.phases.iter().find(|p| !p.manual).map(|p| p.time_step_index) else {
            return;
        };
        let pre_phase = self.pre_phase;
        let post_phase = self.post_phase;
        self.phase_mut(pre_phase).time_step_index = ts_index;
        self.phase_mut(post_phase).time_step_index = ts_index;
    }

    /// Registers an independent [`TimeStep`] that one or more phases can
    /// share, returning its index for use with
    /// [`register_phase_with_time_step`](Self::register_phase_with_time_step).
    pub fn register_time_step(&mut self, update_rate_sec: f64, uncapped: bool) -> usize {
        self.time_steps.push(PhaseTimeStep {
            time_step: TimeStep::new(update_rate_sec, uncapped),
            update_count: 0,
            updated: false,
        });
        self.time_steps.len() - 1
    }

    /// Registers a named phase bound to an existing time step index, or
    /// returns the existing phase's id if `name` is already registered.
    pub fn register_phase_with_time_step(&mut self, entities: &EntityRegistry, name: &str, time_step_index: usize) -> Entity {
        let id = entities.create_named(name);
        if self.phases.iter().any(|p| p.id == id) {
            return id;
        }
        self.phases.push(RegisteredPhase {
            id,
            time_step_index,
            manual: false,
        });
        self.reanchor_reserved_phases();
        id
    }

    /// Registers a named phase at its own dedicated update rate.
    pub fn register_phase(&mut self, entities: &EntityRegistry, name: &str, update_rate_sec: f64, uncapped: bool) -> Entity {
        if let Some(id) = entities.lookup_named(name) {
            if self.phases.iter().any(|p| p.id == id) {
                return id;
            }
        }
        let ts = self.register_time_step(update_rate_sec, uncapped);
        self.register_phase_with_time_step(entities, name, ts)
    }

    /// Resolves an already-registered phase's id by name, without
    /// creating it if it doesn't exist yet — unlike
    /// [`register_phase`](Self::register_phase), which always creates.
    /// Useful for strict callers (e.g. a tool validating a scene's phase
    /// references) that want to treat an unknown phase as a reportable
    /// error instead of silently standing one up.
    pub fn try_phase_id(&self, entities: &EntityRegistry, name: &str) -> crate::error::Result<Entity> {
        let id = entities
            .lookup_named(name)
            .ok_or_else(|| crate::error::WhiskerError::UnknownPhase(name.to_owned()))?;
        if self.phases.iter().any(|p| p.id == id) {
            Ok(id)
        } else {
            Err(crate::error::WhiskerError::UnknownPhase(name.to_owned()))
        }
    }

    /// Re-sorts the registered phases to match the caller's explicit
    /// `order`, creating any phase named in it that doesn't exist yet (at
    /// the default 60Hz rate, matching [`register_phase`](Self::register_phase)'s
    /// auto-create behavior) and leaving phases absent from `order` in
    /// their existing relative position, trailing the ordered ones. The
    /// reserved pre/post phases are then re-anchored to the new leading
    /// non-manual phase's time step — the Rust equivalent of the source's
    /// `whisker_ecs_set_process_phase_order`, which rebuilds the process
    /// phase list from the caller's order and re-registers the reserved
    /// phases against the reordered list's first time step.
    pub fn set_phase_order(&mut self, entities: &EntityRegistry, order: &[&str]) {
        for name in order {
            self.register_phase(entities, name, DEFAULT_UPDATE_RATE, false);
        }

        let rank = |id: Entity| -> usize {
            order
                .iter()
                .position(|name| entities.lookup_named(name) == Some(id))
                .unwrap_or(usize::MAX)
        };
        self.phases.sort_by_key(|phase| rank(phase.id));

        self.reanchor_reserved_phases();
    }

    /// Registers a system function under `phase_name`, creating the
    /// phase with a default 60Hz time step if it doesn't already exist.
    /// `thread_count` of `0` runs the system inline on the calling
    /// thread; anything higher dispatches it across a dedicated
    /// `rayon::ThreadPool` of that size.
    pub fn register_system(
        &mut self,
        entities: &EntityRegistry,
        name: &str,
        phase_name: &str,
        thread_count: usize,
        run: SystemFn,
    ) -> Entity {
        let phase = self.register_phase(entities, phase_name, DEFAULT_UPDATE_RATE, false);
        let id = entities.create_named(name);

        let thread_max = thread_count.max(1) as u64;
        let slots = (0..thread_max)
            .map(|thread_id| ThreadSlot {
                thread_id,
                thread_max,
                queries: FxHashMap::default(),
            })
            .collect();

        let pool = if thread_count > 0 {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(thread_count)
                    .thread_name(move |i| format!("{name}-{i}"))
                    .build()
                    .expect("failed to build system thread pool"),
            )
        } else {
            None
        };

        self.systems.push(RegisteredSystem {
            id,
            phase,
            run,
            pool,
            slots,
        });
        self.phase_systems
            .entry(phase.index())
            .or_default()
            .push(self.systems.len() - 1);

        id
    }

    /// Runs one full frame: every non-manual phase, wrapped in the
    /// reserved pre/post phases, each run for however many fixed updates
    /// its time step has accumulated. `drain` is invoked once per phase
    /// after its pre/phase/post systems have all run, and should apply
    /// the component store's deferred queue and sort any changed columns
    /// — the scheduler doesn't reach into the store for anything beyond
    /// running queries, so it stays agnostic to how draining happens.
    pub fn update(
        &mut self,
        entities: &EntityRegistry,
        components: &mut ComponentStore,
        mut drain: impl FnMut(&EntityRegistry, &mut ComponentStore),
    ) {
        let phase_order: Vec<Entity> = self
            .phases
            .iter()
            .filter(|p| !p.manual)
            .map(|p| p.id)
            .collect();

        let pre_phase = self.pre_phase;
        let post_phase = self.post_phase;

        for phase_id in phase_order {
            self.run_phase(pre_phase, entities, components);
            self.run_phase(phase_id, entities, components);
            self.run_phase(post_phase, entities, components);
            drain(entities, components);
        }

        for ts in &mut self.time_steps {
            ts.reset();
        }
    }

    fn run_phase(&mut self, phase_id: Entity, entities: &EntityRegistry, components: &ComponentStore) {
        if entities.is_unmanaged(phase_id) {
            return;
        }
        let Some(phase) = self.phases.iter().find(|p| p.id == phase_id) else {
            return;
        };
        let ts_index = phase.time_step_index;
        let update_count = self.time_steps[ts_index].advance();
        let delta_time = self.time_steps[ts_index].time_step.delta_seconds();

        let Some(system_indices) = self.phase_systems.get(&phase_id.index()).cloned() else {
            return;
        };

        for _ in 0..update_count {
            for &sys_idx in &system_indices {
                self.dispatch(sys_idx, entities, components, delta_time);
            }
        }
    }

    fn dispatch(&mut self, sys_idx: usize, entities: &EntityRegistry, components: &ComponentStore, delta_time: f64) {
        use rayon::prelude::*;

        let RegisteredSystem { run, pool, slots, .. } = &mut self.systems[sys_idx];
        let run = *run;

        match pool {
            Some(pool) => {
                pool.install(|| {
                    slots.par_iter_mut().for_each(|slot| {
                        let mut ctx = SystemContext {
                            entities,
                            components,
                            delta_time,
                            thread_id: slot.thread_id,
                            thread_max: slot.thread_max,
                            queries: &mut slot.queries,
                        };
                        run(&mut ctx);
                    });
                });
            }
            None => {
                let slot = &mut slots[0];
                let mut ctx = SystemContext {
                    entities,
                    components,
                    delta_time,
                    thread_id: slot.thread_id,
                    thread_max: slot.thread_max,
                    queries: &mut slot.queries,
                };
                run(&mut ctx);
            }
        }
    }

    /// Every registered system's entity id, in registration order.
    #[must_use]
    pub fn system_ids(&self) -> Vec<Entity> {
        self.systems.iter().map(|s| s.id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static CALL_COUNT: AtomicU32 = AtomicU32::new(0);

    fn counting_system(_ctx: &mut SystemContext) {
        CALL_COUNT.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn uncapped_phase_runs_once_per_frame() {
        let entities = EntityRegistry::new();
        let components = ComponentStore::new();
        let mut scheduler = Scheduler::new(&entities);
        scheduler.register_phase(&entities, "update", 0.0, true);
        scheduler.register_system(&entities, "counter", "update", 0, counting_system);

        CALL_COUNT.store(0, Ordering::SeqCst);
        scheduler.update(&entities, &components, |_, _| {});
        assert_eq!(CALL_COUNT.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unmanaged_phase_is_skipped() {
        let entities = EntityRegistry::new();
        let components = ComponentStore::new();
        let mut scheduler = Scheduler::new(&entities);
        let phase = scheduler.register_phase(&entities, "update", 0.0, true);
        scheduler.register_system(&entities, "counter", "update", 0, counting_system);
        entities.set_unmanaged(phase);

        CALL_COUNT.store(0, Ordering::SeqCst);
        scheduler.update(&entities, &components, |_, _| {});
        assert_eq!(CALL_COUNT.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn reserved_phases_share_the_first_non_manual_phases_time_step() {
        let entities = EntityRegistry::new();
        let mut scheduler = Scheduler::new(&entities);
        scheduler.register_phase(&entities, "render", 0.0, true);

        let render_ts = scheduler.phases.iter().find(|p| !p.manual).unwrap().time_step_index;
        let pre_ts = scheduler.phases.iter().find(|p| p.id == scheduler.pre_phase).unwrap().time_step_index;
        let post_ts = scheduler.phases.iter().find(|p| p.id == scheduler.post_phase).unwrap().time_step_index;
        assert_eq!(pre_ts, render_ts);
        assert_eq!(post_ts, render_ts);
    }

    #[test]
    fn set_phase_order_creates_phases_not_yet_registered() {
        let entities = EntityRegistry::new();
        let mut scheduler = Scheduler::new(&entities);
        scheduler.set_phase_order(&entities, &["new_phase"]);
        assert!(scheduler.try_phase_id(&entities, "new_phase").is_ok());
    }

    static ORDER: std::sync::Mutex<Vec<&str>> = std::sync::Mutex::new(Vec::new());

    fn record_a(_ctx: &mut SystemContext) {
        ORDER.lock().unwrap().push("a");
    }
    fn record_b(_ctx: &mut SystemContext) {
        ORDER.lock().unwrap().push("b");
    }
    fn record_c(_ctx: &mut SystemContext) {
        ORDER.lock().unwrap().push("c");
    }

    #[test]
    fn set_phase_order_runs_phases_in_the_caller_requested_order() {
        let entities = EntityRegistry::new();
        let components = ComponentStore::new();
        let mut scheduler = Scheduler::new(&entities);
        scheduler.register_phase(&entities, "a", 0.0, true);
        scheduler.register_phase(&entities, "b", 0.0, true);
        scheduler.register_phase(&entities, "c", 0.0, true);
        scheduler.register_system(&entities, "record_a", "a", 0, record_a);
        scheduler.register_system(&entities, "record_b", "b", 0, record_b);
        scheduler.register_system(&entities, "record_c", "c", 0, record_c);

        scheduler.set_phase_order(&entities, &["c", "a"]);

        ORDER.lock().unwrap().clear();
        scheduler.update(&entities, &components, |_, _| {});
        // "c" and "a" run in the requested order; "b", absent from the
        // order, keeps its prior relative position and trails them.
        assert_eq!(*ORDER.lock().unwrap(), vec!["c", "a", "b"]);
    }

    #[test]
    fn drain_runs_once_per_phase_per_frame() {
        let entities = EntityRegistry::new();
        let components = ComponentStore::new();
        let mut scheduler = Scheduler::new(&entities);
        scheduler.register_phase(&entities, "update", 0.0, true);
        scheduler.register_system(&entities, "counter", "update", 0, counting_system);

        let drains = std::cell::Cell::new(0);
        scheduler.update(&entities, &components, |_, _| drains.set(drains.get() + 1));
        assert_eq!(drains.get(), 1);
    }
}
