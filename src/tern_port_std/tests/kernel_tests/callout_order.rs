//! Callouts expire in deadline order, FIFO among equal deadlines. A callout
//! without a queue calls its function in the tick context.
use std::sync::Mutex;
use tern_kernel::{
    callout::{self, CalloutId},
    eventq::{self, EventId},
    time, KernelCfg,
};

use crate::KernelTestUtil;

tern_port_std::use_port!(unsafe struct SystemTraits);
impl KernelCfg for SystemTraits {}

static TEST_UTIL: KernelTestUtil = KernelTestUtil::new();
static FIRED: Mutex<Vec<(usize, bool)>> = Mutex::new(Vec::new());

fn record(_: EventId, arg: usize) {
    let in_task = <SystemTraits as tern_kernel::PortThreading>::is_task_context();
    log::debug!("callout {arg} fired at {}", time::time_get::<SystemTraits>());
    FIRED.lock().unwrap().push((arg, in_task));
}

fn queued(arg: usize, ticks: i32) -> CalloutId {
    let q = eventq::eventq_dflt::<SystemTraits>().unwrap();
    let co = callout::callout_init::<SystemTraits>(Some(q), Some(record), arg).unwrap();
    callout::callout_reset::<SystemTraits>(co, ticks).unwrap();
    co
}

fn main_body(_: usize) {
    let q = eventq::eventq_dflt::<SystemTraits>().unwrap();

    let a = queued(1, 30);
    let _b = queued(2, 10);
    let _c = queued(3, 10);
    let d = callout::callout_init::<SystemTraits>(None, Some(record), 4).unwrap();
    callout::callout_reset::<SystemTraits>(d, 20).unwrap();

    // Stopped before expiry
    let e = queued(5, 15);
    callout::callout_stop::<SystemTraits>(e).unwrap();
    assert_eq!(callout::callout_is_active::<SystemTraits>(e), Ok(false));

    assert_eq!(callout::callout_is_active::<SystemTraits>(a), Ok(true));
    let now = time::time_get::<SystemTraits>();
    assert_eq!(callout::callout_remaining_ticks::<SystemTraits>(a, now), Ok(30));

    // `d` doesn't go through the queue
    for _ in 0..3 {
        eventq::eventq_run::<SystemTraits>(q).unwrap();
    }

    assert!(time::time_get::<SystemTraits>() >= 30);
    assert_eq!(
        *FIRED.lock().unwrap(),
        [(2, true), (3, true), (4, false), (1, true)]
    );
    assert_eq!(callout::callout_is_active::<SystemTraits>(a), Ok(false));
    assert_eq!(eventq::eventq_is_empty::<SystemTraits>(q), Ok(true));

    // A negative delay is rejected
    assert!(callout::callout_reset::<SystemTraits>(a, -1).is_err());

    TEST_UTIL.success::<SystemTraits>();
}

#[test]
fn run() {
    TEST_UTIL.run::<SystemTraits>(main_body);
}
