//! Registers three independently-rated phases — a capped 60Hz phase, an
//! uncapped render-style phase, and a capped 30Hz phase — and shows how
//! many times each phase's system fires over two seconds of simulated
//! wall-clock time (spec scenario 5).

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use whisker::scheduler::SystemContext;
use whisker::world::World;

static FIXED_60: AtomicU32 = AtomicU32::new(0);
static VARIABLE: AtomicU32 = AtomicU32::new(0);
static FIXED_30: AtomicU32 = AtomicU32::new(0);

fn tick_60(_ctx: &mut SystemContext) {
    FIXED_60.fetch_add(1, Ordering::Relaxed);
}

fn tick_variable(_ctx: &mut SystemContext) {
    VARIABLE.fetch_add(1, Ordering::Relaxed);
}

fn tick_30(_ctx: &mut SystemContext) {
    FIXED_30.fetch_add(1, Ordering::Relaxed);
}

fn main() {
    let mut world = World::new();
    world.register_phase("phase_a", 60.0, false);
    world.register_phase("phase_b", 0.0, true);
    world.register_phase("phase_c", 30.0, false);
    world.register_system("tick_60", "phase_a", 0, tick_60);
    world.register_system("tick_variable", "phase_b", 0, tick_variable);
    world.register_system("tick_30", "phase_c", 0, tick_30);

    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(2) {
        world.update();
        std::thread::sleep(Duration::from_millis(1));
    }

    println!(
        "phase_a={} phase_b={} phase_c={}",
        FIXED_60.load(Ordering::Relaxed),
        VARIABLE.load(Ordering::Relaxed),
        FIXED_30.load(Ordering::Relaxed),
    );
}
