//! A system that sleeps forever runs into the simulated time limit instead of
//! hanging the test.
use tern_kernel::{time, KernelCfg, TIMEOUT_NEVER};

use crate::KernelTestUtil;

tern_port_std::use_port!(unsafe struct SystemTraits);
impl KernelCfg for SystemTraits {}

static TEST_UTIL: KernelTestUtil = KernelTestUtil::new();

fn main_body(_: usize) {
    time::time_delay::<SystemTraits>(TIMEOUT_NEVER).unwrap();
}

#[test]
#[should_panic(expected = "exceeded the limit")]
fn run() {
    tern_port_std::set_time_limit_secs::<SystemTraits>(60);
    TEST_UTIL.run::<SystemTraits>(main_body);
}
