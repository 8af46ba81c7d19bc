//! A shutdown callback that never releases trips the shutdown timer.
use std::sync::atomic::{AtomicU64, Ordering};
use tern_kernel::{
    os,
    sysdown::{RebootReason, SysdownFn, SysdownStatus},
    time, KernelCfg, TIMEOUT_NEVER,
};
use tern_port_std::ResetCause;

use crate::KernelTestUtil;

tern_port_std::use_port!(unsafe struct SystemTraits);
impl KernelCfg for SystemTraits {
    const SYSDOWN_TIMEOUT_MS: u32 = 1000;

    fn sysdown_handlers() -> &'static [SysdownFn] {
        &[never_done]
    }

    fn sysdown_panic() {
        TIMED_OUT_AT.store(tern_port_std::sim_ticks::<Self>(), Ordering::Relaxed);
        os::os_system_reset::<Self>();
    }
}

static TEST_UTIL: KernelTestUtil = KernelTestUtil::new();
static TIMED_OUT_AT: AtomicU64 = AtomicU64::new(0);
static STARTED_AT: AtomicU64 = AtomicU64::new(0);

fn never_done(_: RebootReason) -> SysdownStatus {
    SysdownStatus::InProgress
}

fn main_body(_: usize) {
    // Let some time pass first
    time::time_delay::<SystemTraits>(50).unwrap();

    STARTED_AT.store(tern_port_std::sim_ticks::<SystemTraits>(), Ordering::Relaxed);
    os::os_reboot::<SystemTraits>(RebootReason::Requested).unwrap();

    time::time_delay::<SystemTraits>(TIMEOUT_NEVER).unwrap();
}

#[test]
fn run() {
    let cause = TEST_UTIL.run_until_reset::<SystemTraits>(main_body);

    assert_eq!(cause, Some(ResetCause::Software));

    // 1000 ms at 128 Hz
    let elapsed = TIMED_OUT_AT.load(Ordering::Relaxed) - STARTED_AT.load(Ordering::Relaxed);
    assert!((128..=140).contains(&elapsed), "{elapsed}");
}
