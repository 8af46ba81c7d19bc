//! An interrupt handler wakes up a task by putting an event. The task has a
//! higher priority than the interrupted one, so it runs as soon as the
//! handler returns.
use std::sync::OnceLock;
use tern_kernel::{
    eventq::{self, EventId, EventQueueId},
    task, time, ContextError, GetEventError, KernelCfg, StaticStack, TIMEOUT_NEVER,
};

use crate::{KernelTestUtil, SeqTracker};

tern_port_std::use_port!(unsafe struct SystemTraits);
impl KernelCfg for SystemTraits {}

static TEST_UTIL: KernelTestUtil = KernelTestUtil::new();
static SEQ: SeqTracker = SeqTracker::new();

static OBJECTS: OnceLock<(EventQueueId, EventId)> = OnceLock::new();
static CONSUMER_STACK: StaticStack<256> = StaticStack::new();

fn isr() {
    let (q, ev) = *OBJECTS.get().unwrap();
    SEQ.expect_and_replace(1, 2);

    // Blocking isn't allowed here
    assert_eq!(
        task::current_task::<SystemTraits>(),
        Err(ContextError::BadContext)
    );
    assert_eq!(
        eventq::eventq_get::<SystemTraits>(q),
        Err(GetEventError::BadContext)
    );

    eventq::eventq_put::<SystemTraits>(q, ev).unwrap();

    // The consumer doesn't run until the handler returns
    SEQ.expect_and_replace(2, 3);
}

fn main_body(_: usize) {
    let q = eventq::eventq_init::<SystemTraits>().unwrap();
    let ev = eventq::event_init::<SystemTraits>(None, 0).unwrap();
    OBJECTS.set((q, ev)).unwrap();

    task::task_init::<SystemTraits>(
        "consumer",
        consumer_body,
        0,
        50,
        TIMEOUT_NEVER,
        CONSUMER_STACK.take().unwrap(),
    )
    .unwrap();

    // `consumer` is blocked in `eventq_get`
    SEQ.expect_and_replace(0, 1);
    tern_port_std::pend_interrupt::<SystemTraits>(isr);
    SEQ.expect_and_replace(4, 5);

    TEST_UTIL.success::<SystemTraits>();
}

fn consumer_body(_: usize) {
    let (q, ev) = *OBJECTS.get().unwrap();
    assert_eq!(eventq::eventq_get::<SystemTraits>(q), Ok(ev));
    SEQ.expect_and_replace(3, 4);

    time::time_delay::<SystemTraits>(TIMEOUT_NEVER).unwrap();
}

#[test]
fn run() {
    TEST_UTIL.run::<SystemTraits>(main_body);
}
