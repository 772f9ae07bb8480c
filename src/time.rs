//! Fixed-step time accumulator driving the scheduler's update loop.

use std::time::Instant;

const TIME_RESOLUTION: u64 = 1_000_000_000;
const SNAP_ERROR_MULTIPLIER: f64 = 0.0002;
const SNAP_FREQ_COUNT: usize = 8;
const AVG_SAMPLE_COUNT: usize = 4;
const DELTA_SNAP_BASE: u64 = 60;

/// Tracks real elapsed time, smooths it against common display refresh
/// rates, and accumulates it into a whole number of fixed updates per
/// frame.
///
/// Built around a nanosecond-resolution accumulator rather than a plain
/// `f64` delta so repeated snapping/averaging can't drift: every step
/// works in integer nanoseconds and only converts to seconds for the
/// value callers actually read ([`delta_seconds`](Self::delta_seconds)).
pub struct TimeStep {
    update_rate_sec: f64,
    uncapped: bool,
    update_multiplier: u32,

    delta_time_fixed: f64,
    update_time_target: u64,
    delta_snap_max_error: u64,
    delta_snap_frequencies: [u64; SNAP_FREQ_COUNT],

    delta_averages: [u64; AVG_SAMPLE_COUNT],
    delta_average_residual: u64,

    update_time_prev: Instant,
    delta_accumulation: u64,
    delta_time_real: u64,
    delta_time_variable: f64,

    tick_count: u64,
}

impl TimeStep {
    /// Creates a stepper targeting `update_rate_sec` updates per second. If
    /// `uncapped` is set, [`update_count`](Self::update_count) always
    /// returns 1 and the real frame delta is used directly, with no
    /// snapping, averaging, or accumulation.
    #[must_use]
    pub fn new(update_rate_sec: f64, uncapped: bool) -> Self {
        let mut step = Self {
            update_rate_sec,
            uncapped,
            update_multiplier: 1,
            delta_time_fixed: 0.0,
            update_time_target: 0,
            delta_snap_max_error: (TIME_RESOLUTION as f64 * SNAP_ERROR_MULTIPLIER) as u64,
            delta_snap_frequencies: [0; SNAP_FREQ_COUNT],
            delta_averages: [0; AVG_SAMPLE_COUNT],
            delta_average_residual: 0,
            update_time_prev: Instant::now(),
            delta_accumulation: 0,
            delta_time_real: 0,
            delta_time_variable: 0.0,
            tick_count: 0,
        };
        step.set_update_rate(update_rate_sec);
        step
    }

    /// Changes the target update rate, recomputing the fixed delta, the
    /// snap frequency table, and reseeding the rolling average with the
    /// new target so a rate change doesn't cause a transient stutter.
    pub fn set_update_rate(&mut self, update_rate_sec: f64) {
        self.update_rate_sec = update_rate_sec;
        self.delta_time_fixed = 1.0 / update_rate_sec;
        self.update_time_target = (TIME_RESOLUTION as f64 / update_rate_sec) as u64;

        for (i, slot) in self.delta_snap_frequencies.iter_mut().enumerate() {
            *slot = (TIME_RESOLUTION / DELTA_SNAP_BASE) * (i as u64 + 1);
        }
        self.delta_averages = [self.update_time_target; AVG_SAMPLE_COUNT];
        self.delta_average_residual = 0;
    }

    /// The fixed per-update delta in seconds (`1 / update_rate_sec`), the
    /// value systems should multiply their rates by.
    #[inline]
    #[must_use]
    pub fn delta_seconds(&self) -> f64 {
        self.delta_time_fixed
    }

    /// The most recent real (post-snap, post-average) frame delta, in
    /// seconds. In uncapped mode this equals the raw measured delta.
    #[inline]
    #[must_use]
    pub fn variable_delta_seconds(&self) -> f64 {
        self.delta_time_variable
    }

    /// Total elapsed real time since creation, in nanoseconds.
    #[inline]
    #[must_use]
    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Whether this stepper ignores the fixed-step target and always
    /// requests exactly one update using the real frame delta.
    #[inline]
    #[must_use]
    pub fn is_uncapped(&self) -> bool {
        self.uncapped
    }

    /// Multiplies the update target, e.g. to run two fixed updates for
    /// every accumulated tick.
    pub fn set_update_multiplier(&mut self, multiplier: u32) {
        self.update_multiplier = multiplier.max(1);
    }

    /// Advances the stepper by the real time elapsed since the previous
    /// call and returns how many fixed updates the caller should run this
    /// frame. Call exactly once per frame; the scheduler then runs every
    /// non-manual phase that many times.
    pub fn update_count(&mut self) -> u32 {
        let now = Instant::now();
        let elapsed = now.duration_since(self.update_time_prev).as_nanos() as u64;
        self.update_time_prev = now;
        self.advance(elapsed)
    }

    /// Same fixed-step accounting as [`update_count`](Self::update_count),
    /// but takes the elapsed time since the previous call directly instead
    /// of reading the system clock. Lets callers — tests, replay tooling —
    /// drive the accumulator with an exact, reproducible delta instead of
    /// real (and therefore flaky) wall-clock time.
    pub fn advance(&mut self, elapsed_nanos: u64) -> u32 {
        self.step(elapsed_nanos);

        if self.uncapped {
            self.delta_time_fixed = self.delta_time_variable;
            return 1;
        }

        let target = self.update_time_target * self.update_multiplier as u64;
        let mut count = 0u32;
        while self.delta_accumulation >= target {
            self.delta_accumulation -= self.update_time_target;
            count += 1;
        }
        count
    }

    fn step(&mut self, elapsed_nanos: u64) {
        self.delta_time_real = elapsed_nanos;
        self.tick_count += self.delta_time_real;

        if !self.uncapped {
            let clamp_ceiling = self.update_time_target * SNAP_FREQ_COUNT as u64;
            if self.delta_time_real > clamp_ceiling {
                self.delta_time_real = clamp_ceiling;
            }

            for &frequency in &self.delta_snap_frequencies {
                let diff = self.delta_time_real.abs_diff(frequency);
                if diff < self.delta_snap_max_error {
                    self.delta_time_real = frequency;
                    break;
                }
            }

            self.delta_averages.rotate_left(1);
            *self.delta_averages.last_mut().unwrap() = self.delta_time_real;

            let sum: u64 = self.delta_averages.iter().sum();
            self.delta_time_real = sum / AVG_SAMPLE_COUNT as u64;

            self.delta_average_residual += sum % AVG_SAMPLE_COUNT as u64;
            self.delta_time_real += self.delta_average_residual / AVG_SAMPLE_COUNT as u64;
            self.delta_average_residual %= AVG_SAMPLE_COUNT as u64;

            self.delta_accumulation += self.delta_time_real;

            // spiral-of-death guard: a debugger pause or long stall would
            // otherwise force many catch-up updates in a single frame.
            let spiral_ceiling = self.update_time_target * SNAP_FREQ_COUNT as u64;
            if self.delta_accumulation > spiral_ceiling {
                self.delta_accumulation = 0;
                self.delta_time_real = self.update_time_target;
            }
        }

        self.delta_time_variable = self.delta_time_real as f64 / TIME_RESOLUTION as f64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_rate_sets_fixed_delta() {
        let step = TimeStep::new(60.0, false);
        assert!((step.delta_seconds() - 1.0 / 60.0).abs() < 1e-9);
    }

    #[test]
    fn uncapped_always_requests_one_update() {
        let mut step = TimeStep::new(60.0, true);
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(step.update_count(), 1);
    }

    #[test]
    fn a_long_stall_clamps_the_real_delta_to_the_ceiling_not_to_a_handful_of_nanoseconds() {
        let mut step = TimeStep::new(60.0, false);
        std::thread::sleep(std::time::Duration::from_millis(400));
        step.update_count();

        // Averaged against three target-length reseeded samples, a delta
        // clamped down to the ceiling still pulls the rolling average well
        // above one target period; a delta collapsed to a handful of
        // nanoseconds would pull it well below.
        assert!(step.delta_time_real > step.update_time_target);
    }

    #[test]
    fn snap_frequencies_are_multiples_of_base() {
        let step = TimeStep::new(60.0, false);
        for (i, &frequency) in step.delta_snap_frequencies.iter().enumerate() {
            assert_eq!(frequency, (TIME_RESOLUTION / DELTA_SNAP_BASE) * (i as u64 + 1));
        }
    }

    #[test]
    fn changing_update_rate_reseeds_averages_at_new_target() {
        let mut step = TimeStep::new(30.0, false);
        step.set_update_rate(60.0);
        assert_eq!(step.delta_averages, [step.update_time_target; AVG_SAMPLE_COUNT]);
    }

    #[test]
    fn advance_with_exactly_one_targets_worth_of_elapsed_time_yields_one_update() {
        let mut step = TimeStep::new(60.0, false);
        let target = step.update_time_target;
        // Fed the same, exact target-length delta every call, the snap
        // table leaves it untouched (it already sits on snap frequency
        // zero) and the rolling average stays put, so the accumulator
        // fills to exactly one update and drains back to zero every time
        // — deterministic, with no dependence on wall-clock scheduling.
        for _ in 0..5 {
            assert_eq!(step.advance(target), 1);
            assert_eq!(step.delta_accumulation, 0);
        }
    }

    #[test]
    fn advance_in_uncapped_mode_always_returns_one_regardless_of_elapsed_time() {
        let mut step = TimeStep::new(60.0, true);
        assert_eq!(step.advance(1), 1);
        assert_eq!(step.advance(500_000_000), 1);
    }
}
