//! A task hogging the processor starves the idle task. The software monitor
//! notices first, then the hardware watchdog resets the system.
use std::sync::atomic::{AtomicU64, Ordering};
use tern_kernel::{time, KernelCfg};
use tern_port_std::ResetCause;

use crate::{KernelTestUtil, SeqTracker};

tern_port_std::use_port!(unsafe struct SystemTraits);
impl KernelCfg for SystemTraits {
    const WATCHDOG_INTERVAL_MS: u32 = 4000;
    const SANITY_INTERVAL_MS: u32 = 3500;

    fn watchdog_monitor_expired() {
        MONITOR_EXPIRED_AT.store(time::time_get::<Self>() as u64, Ordering::Relaxed);
    }
}

static TEST_UTIL: KernelTestUtil = KernelTestUtil::new();
static SEQ: SeqTracker = SeqTracker::new();
static MONITOR_EXPIRED_AT: AtomicU64 = AtomicU64::new(0);

fn main_body(_: usize) {
    SEQ.expect_and_replace(0, 1);

    // Never blocks, so the idle task can't tickle the watchdog
    tern_port_std::busy_wait_ticks::<SystemTraits>(600);

    SEQ.expect_and_replace(1, 2);
}

#[test]
fn run() {
    let cause = TEST_UTIL.run_until_reset::<SystemTraits>(main_body);

    assert_eq!(cause, Some(ResetCause::Watchdog));
    assert_eq!(SEQ.get(), 1);
    assert_ne!(MONITOR_EXPIRED_AT.load(Ordering::Relaxed), 0);
    assert!(tern_port_std::watchdog_tickles::<SystemTraits>().is_empty());
}
