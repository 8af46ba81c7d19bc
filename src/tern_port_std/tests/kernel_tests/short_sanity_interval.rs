//! A sanity interval shorter than one tick still makes the idle task tickle
//! the watchdog instead of disabling the sanity pass.
use tern_kernel::{time, KernelCfg};

use crate::KernelTestUtil;

tern_port_std::use_port!(unsafe struct SystemTraits);
impl KernelCfg for SystemTraits {
    const WATCHDOG_INTERVAL_MS: u32 = 4000;
    // Less than a tick at 128 Hz
    const SANITY_INTERVAL_MS: u32 = 5;
}

static TEST_UTIL: KernelTestUtil = KernelTestUtil::new();

fn main_body(_: usize) {
    // Longer than the watchdog interval
    time::time_delay::<SystemTraits>(128 * 20).unwrap();

    let tickles = tern_port_std::watchdog_tickles::<SystemTraits>();
    assert!(!tickles.is_empty());
    assert!(tickles[0] <= 1, "{:?}", &tickles[..1]);
    assert!(tickles.windows(2).all(|pair| pair[1] - pair[0] <= 1));

    TEST_UTIL.success::<SystemTraits>();
}

#[test]
fn run() {
    TEST_UTIL.run::<SystemTraits>(main_body);
}
