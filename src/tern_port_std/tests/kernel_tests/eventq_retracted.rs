//! A consumer woken up by an event that is removed before the consumer runs
//! keeps waiting for the rest of its timeout.
use std::sync::OnceLock;
use tern_kernel::{
    callout::{self, CalloutId},
    eventq, task, time, GetEventTimeoutError, KernelCfg, StaticStack, TIMEOUT_NEVER,
};

use crate::{KernelTestUtil, SeqTracker};

tern_port_std::use_port!(unsafe struct SystemTraits);
impl KernelCfg for SystemTraits {}

static TEST_UTIL: KernelTestUtil = KernelTestUtil::new();
static SEQ: SeqTracker = SeqTracker::new();

static CALLOUT: OnceLock<CalloutId> = OnceLock::new();
static CANCELLER_STACK: StaticStack<256> = StaticStack::new();

fn main_body(_: usize) {
    let q = eventq::eventq_init::<SystemTraits>().unwrap();
    let co = callout::callout_init::<SystemTraits>(Some(q), None, 0).unwrap();
    CALLOUT.set(co).unwrap();

    let start = time::time_get::<SystemTraits>();

    // Wakes up on the same tick as the callout, and runs first
    task::task_init::<SystemTraits>(
        "canceller",
        canceller_body,
        0,
        10,
        TIMEOUT_NEVER,
        CANCELLER_STACK.take().unwrap(),
    )
    .unwrap();
    SEQ.expect_and_replace(1, 2);

    callout::callout_reset::<SystemTraits>(co, 5).unwrap();
    assert_eq!(
        eventq::eventq_get_timeout::<SystemTraits>(q, 20),
        Err(GetEventTimeoutError::Timeout)
    );
    SEQ.expect_and_replace(3, 4);
    assert!(time::time_get::<SystemTraits>().wrapping_sub(start) >= 20);

    TEST_UTIL.success::<SystemTraits>();
}

fn canceller_body(_: usize) {
    let co = *CALLOUT.get().unwrap();
    SEQ.expect_and_replace(0, 1);

    time::time_delay::<SystemTraits>(5).unwrap();

    // The callout has just put its event, and `main` is ready but hasn't run
    SEQ.expect_and_replace(2, 3);
    callout::callout_stop::<SystemTraits>(co).unwrap();

    time::time_delay::<SystemTraits>(TIMEOUT_NEVER).unwrap();
}

#[test]
fn run() {
    TEST_UTIL.run::<SystemTraits>(main_body);
}
