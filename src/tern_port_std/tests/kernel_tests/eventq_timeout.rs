//! Blocking on an event queue, with and without a timeout.
use std::sync::OnceLock;
use tern_kernel::{
    eventq::{self, EventId, EventQueueId},
    task, time, GetEventTimeoutError, KernelCfg, StaticStack, TIMEOUT_NEVER,
};

use crate::{KernelTestUtil, SeqTracker};

tern_port_std::use_port!(unsafe struct SystemTraits);
impl KernelCfg for SystemTraits {}

static TEST_UTIL: KernelTestUtil = KernelTestUtil::new();
static SEQ: SeqTracker = SeqTracker::new();

static OBJECTS: OnceLock<(EventQueueId, EventId)> = OnceLock::new();
static PRODUCER_STACK: StaticStack<256> = StaticStack::new();

fn main_body(_: usize) {
    let q = eventq::eventq_init::<SystemTraits>().unwrap();
    let ev = eventq::event_init::<SystemTraits>(None, 42).unwrap();
    OBJECTS.set((q, ev)).unwrap();

    // Nobody puts anything
    let start = time::time_get::<SystemTraits>();
    assert_eq!(
        eventq::eventq_get_timeout::<SystemTraits>(q, 10),
        Err(GetEventTimeoutError::Timeout)
    );
    assert!(time::time_get::<SystemTraits>().wrapping_sub(start) >= 10);

    // A zero timeout polls
    let start = time::time_get::<SystemTraits>();
    assert_eq!(
        eventq::eventq_get_timeout::<SystemTraits>(q, 0),
        Err(GetEventTimeoutError::Timeout)
    );
    assert_eq!(time::time_get::<SystemTraits>(), start);

    SEQ.expect_and_replace(0, 1);
    task::task_init::<SystemTraits>(
        "producer",
        producer_body,
        0,
        100,
        TIMEOUT_NEVER,
        PRODUCER_STACK.take().unwrap(),
    )
    .unwrap();
    SEQ.expect_and_replace(2, 3);

    // Blocks until `producer` wakes up
    assert_eq!(eventq::eventq_get::<SystemTraits>(q), Ok(ev));
    SEQ.expect_and_replace(4, 5);
    assert_eq!(eventq::event_arg::<SystemTraits>(ev), Ok(42));
    assert!(time::time_get::<SystemTraits>().wrapping_sub(start) >= 3);

    // Putting a queued event is a no-op
    eventq::eventq_put::<SystemTraits>(q, ev).unwrap();
    eventq::eventq_put::<SystemTraits>(q, ev).unwrap();
    assert_eq!(eventq::eventq_get_no_wait::<SystemTraits>(q), Ok(Some(ev)));
    assert_eq!(eventq::eventq_get_no_wait::<SystemTraits>(q), Ok(None));
    assert_eq!(eventq::eventq_is_empty::<SystemTraits>(q), Ok(true));

    TEST_UTIL.success::<SystemTraits>();
}

fn producer_body(_: usize) {
    let (q, ev) = *OBJECTS.get().unwrap();
    SEQ.expect_and_replace(1, 2);

    time::time_delay::<SystemTraits>(3).unwrap();

    // `main` is blocked in `eventq_get` by now
    SEQ.expect_and_replace(3, 4);
    eventq::eventq_put::<SystemTraits>(q, ev).unwrap();
    assert_eq!(eventq::event_is_queued::<SystemTraits>(ev), Ok(true));

    time::time_delay::<SystemTraits>(TIMEOUT_NEVER).unwrap();
}

#[test]
fn run() {
    TEST_UTIL.run::<SystemTraits>(main_body);
}
