//! The idle task tickles the watchdog after every sanity pass, well within
//! the watchdog interval, even when nothing else is going on.
use std::sync::atomic::{AtomicU32, Ordering};
use tern_kernel::{sanity, task, time, watchdog, KernelCfg, StaticStack, TIMEOUT_NEVER};

use crate::KernelTestUtil;

tern_port_std::use_port!(unsafe struct SystemTraits);
impl KernelCfg for SystemTraits {
    const WATCHDOG_INTERVAL_MS: u32 = 4000;
    const SANITY_INTERVAL_MS: u32 = 3500;
}

static TEST_UTIL: KernelTestUtil = KernelTestUtil::new();
static WORKER_STACK: StaticStack<256> = StaticStack::new();
static CHECKINS: AtomicU32 = AtomicU32::new(0);

/// `SANITY_INTERVAL_MS` in ticks
const MAX_SPACING: u64 = 448;

fn main_body(_: usize) {
    // A task with its own sanity check, which it keeps alive
    task::task_init::<SystemTraits>(
        "worker",
        worker_body,
        0,
        150,
        100,
        WORKER_STACK.take().unwrap(),
    )
    .unwrap();

    // About 20 seconds
    time::time_delay::<SystemTraits>(128 * 20).unwrap();

    let tickles = tern_port_std::watchdog_tickles::<SystemTraits>();
    log::debug!("tickles: {tickles:?}");
    assert!(tickles.len() >= 5, "{tickles:?}");
    assert!(tickles[0] <= MAX_SPACING);
    for pair in tickles.windows(2) {
        let spacing = pair[1] - pair[0];
        assert!(spacing > 0 && spacing <= MAX_SPACING, "{tickles:?}");
        assert!(time::ticks_to_ms_with(spacing as u32, 128) <= 3500);
        // 4000 ms at 128 Hz
        assert!(spacing < 512);
    }

    // `watchdog_enable` counts as one
    assert_eq!(
        watchdog::tickle_count::<SystemTraits>() as usize,
        tickles.len() + 1
    );
    assert!(CHECKINS.load(Ordering::Relaxed) >= 20 * 128 / 50);

    TEST_UTIL.success::<SystemTraits>();
}

fn worker_body(_: usize) {
    loop {
        sanity::sanity_task_checkin::<SystemTraits>(None).unwrap();
        CHECKINS.fetch_add(1, Ordering::Relaxed);
        time::time_delay::<SystemTraits>(50).unwrap();
    }
}

#[test]
fn run() {
    TEST_UTIL.run::<SystemTraits>(main_body);
}
