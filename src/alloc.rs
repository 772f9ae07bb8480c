//! A single pluggable point for observing storage growth.
//!
//! Rust's global allocator already aborts the process on genuine
//! allocation failure, so there is no failure path left for this module
//! to handle. What's left is the diagnostic hook: a place every large
//! `Vec` grow funnels through, so a host application can log or sample
//! it instead of it happening silently.

/// Notified when a backing `Vec` grows past its current capacity.
pub trait AllocFailureHook: Send + Sync {
    /// `what` names the storage that grew (e.g. `"component:Position"`,
    /// `"pool:free_list"`), useful for attributing growth to a subsystem
    /// in a trace.
    fn on_grow(&self, what: &str, old_capacity: usize, new_capacity: usize);
}

/// Default hook: emits a `tracing` debug event. Growth is routine, not a
/// warning sign, so it's logged at `debug` rather than `warn`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAllocHook;

impl AllocFailureHook for TracingAllocHook {
    fn on_grow(&self, what: &str, old_capacity: usize, new_capacity: usize) {
        tracing::debug!(what, old_capacity, new_capacity, "storage grew");
    }
}

/// A hook that does nothing, for callers that don't want the tracing
/// dependency on the hot path.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAllocHook;

impl AllocFailureHook for NoopAllocHook {
    fn on_grow(&self, _what: &str, _old_capacity: usize, _new_capacity: usize) {}
}

/// Reserves capacity for at least `min_capacity` total elements, notifying
/// `hook` if this actually grew the backing allocation. Mirrors the
/// block-sized `ensure_alloc` growth helpers used throughout the original
/// C arrays, reworked around `Vec::reserve` instead of manual
/// realloc/memcpy.
pub fn ensure_capacity<T>(vec: &mut Vec<T>, min_capacity: usize, hook: &dyn AllocFailureHook, what: &str) {
    if vec.capacity() >= min_capacity {
        return;
    }
    let old_capacity = vec.capacity();
    let additional = min_capacity - vec.len();
    vec.reserve(additional);
    hook.on_grow(what, old_capacity, vec.capacity());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHook(AtomicUsize);
    impl AllocFailureHook for CountingHook {
        fn on_grow(&self, _what: &str, _old: usize, _new: usize) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn ensure_capacity_only_notifies_on_actual_growth() {
        let hook = CountingHook(AtomicUsize::new(0));
        let mut v: Vec<u32> = Vec::new();
        ensure_capacity(&mut v, 100, &hook, "test");
        ensure_capacity(&mut v, 50, &hook, "test");
        assert_eq!(hook.0.load(Ordering::Relaxed), 1);
    }
}
