//! A higher-priority task preempts the running task as soon as it becomes
//! Ready, whether by creation or by a timer tick.
use tern_kernel::{task, time, KernelCfg, StaticStack, TaskId, TIMEOUT_NEVER};

use crate::{KernelTestUtil, SeqTracker};

tern_port_std::use_port!(unsafe struct SystemTraits);
impl KernelCfg for SystemTraits {}

static TEST_UTIL: KernelTestUtil = KernelTestUtil::new();
static SEQ: SeqTracker = SeqTracker::new();

static HI_STACK: StaticStack<256> = StaticStack::new();
static LO_STACK: StaticStack<256> = StaticStack::new();

fn spawn(name: &'static str, entry: fn(usize), prio: u8, stack: &'static StaticStack<256>) -> TaskId {
    task::task_init::<SystemTraits>(name, entry, 0, prio, TIMEOUT_NEVER, stack.take().unwrap())
        .unwrap()
}

fn main_body(_: usize) {
    SEQ.expect_and_replace(0, 1);

    // `hi` runs before `task_init` returns
    spawn("hi", hi_body, 10, &HI_STACK);
    SEQ.expect_and_replace(2, 3);

    // `lo` doesn't
    let lo = spawn("lo", lo_body, 200, &LO_STACK);
    SEQ.expect_and_replace(3, 4);
    assert_eq!(
        task::task_info::<SystemTraits>(lo).unwrap().state,
        task::TaskSt::Ready
    );

    // No other task of the same priority
    task::yield_now::<SystemTraits>().unwrap();
    assert_eq!(SEQ.get(), 4);

    time::time_delay::<SystemTraits>(20).unwrap();
    SEQ.expect_and_replace(7, 8);
    assert!(time::time_get::<SystemTraits>() >= 20);

    let info = task::task_info::<SystemTraits>(lo).unwrap();
    assert_eq!(info.state, task::TaskSt::Sleeping);
    assert!(info.ctx_switch_count >= 2);

    TEST_UTIL.success::<SystemTraits>();
}

fn hi_body(_: usize) {
    SEQ.expect_and_replace(1, 2);

    time::time_delay::<SystemTraits>(5).unwrap();

    // Woken up in the middle of `lo`'s busy-wait
    SEQ.expect_and_replace(5, 6);
    assert!(time::time_get::<SystemTraits>() >= 5);

    time::time_delay::<SystemTraits>(TIMEOUT_NEVER).unwrap();
}

fn lo_body(_: usize) {
    SEQ.expect_and_replace(4, 5);

    tern_port_std::busy_wait_ticks::<SystemTraits>(10);

    SEQ.expect_and_replace(6, 7);
    time::time_delay::<SystemTraits>(TIMEOUT_NEVER).unwrap();
}

#[test]
fn run() {
    TEST_UTIL.run::<SystemTraits>(main_body);
}
