//! A controlled shutdown waits until every callback that reported
//! `InProgress` has released, then resets the system.
use std::sync::Mutex;
use tern_kernel::{
    os,
    sysdown::{self, RebootReason, SysdownFn, SysdownStatus},
    time, KernelCfg, SysdownError,
};
use tern_port_std::ResetCause;

use crate::{KernelTestUtil, SeqTracker};

tern_port_std::use_port!(unsafe struct SystemTraits);
impl KernelCfg for SystemTraits {
    fn sysdown_handlers() -> &'static [SysdownFn] {
        &[flush_log, stop_radio, save_config]
    }

    fn sysdown_panic() {
        panic!("the shutdown timed out");
    }
}

static TEST_UTIL: KernelTestUtil = KernelTestUtil::new();
static SEQ: SeqTracker = SeqTracker::new();
static CALLED: Mutex<Vec<(&'static str, RebootReason)>> = Mutex::new(Vec::new());

fn flush_log(reason: RebootReason) -> SysdownStatus {
    CALLED.lock().unwrap().push(("flush_log", reason));
    SysdownStatus::InProgress
}

fn stop_radio(reason: RebootReason) -> SysdownStatus {
    CALLED.lock().unwrap().push(("stop_radio", reason));
    SysdownStatus::Failed(-5)
}

fn save_config(reason: RebootReason) -> SysdownStatus {
    CALLED.lock().unwrap().push(("save_config", reason));
    SysdownStatus::InProgress
}

fn main_body(_: usize) {
    assert_eq!(sysdown::sysdown_is_active::<SystemTraits>(), Ok(false));

    os::os_reboot::<SystemTraits>(RebootReason::SoftwareUpdate).unwrap();
    SEQ.expect_and_replace(0, 1);

    assert_eq!(sysdown::sysdown_is_active::<SystemTraits>(), Ok(true));
    assert_eq!(sysdown::sysdown_in_progress_count::<SystemTraits>(), Ok(2));
    assert_eq!(
        sysdown::sysdown_reason::<SystemTraits>(),
        Ok(Some(RebootReason::SoftwareUpdate))
    );
    assert_eq!(
        os::os_reboot::<SystemTraits>(RebootReason::Requested),
        Err(SysdownError::AlreadyInProgress)
    );

    sysdown::sysdown_release::<SystemTraits>().unwrap();
    assert_eq!(sysdown::sysdown_in_progress_count::<SystemTraits>(), Ok(1));

    // The system keeps running until the last release
    time::time_delay::<SystemTraits>(5).unwrap();
    SEQ.expect_and_replace(1, 2);

    sysdown::sysdown_release::<SystemTraits>().unwrap();
    unreachable!("the system should have reset");
}

#[test]
fn run() {
    let cause = TEST_UTIL.run_until_reset::<SystemTraits>(main_body);

    assert_eq!(cause, Some(ResetCause::Software));
    assert_eq!(SEQ.get(), 2);
    assert_eq!(
        *CALLED.lock().unwrap(),
        [
            ("flush_log", RebootReason::SoftwareUpdate),
            ("stop_radio", RebootReason::SoftwareUpdate),
            ("save_config", RebootReason::SoftwareUpdate),
        ]
    );
}
