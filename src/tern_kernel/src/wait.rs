//! Blocking the running task and waking it up
use crate::{
    eventq::EventQueueId,
    klock::CpuLockTokenRefMut,
    task::{self, TaskId, TaskSt},
    time::{self, Ticks, TIMEOUT_NEVER},
    KernelTraits,
};

/// What a blocked task is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitPayload {
    /// `time_delay`
    Sleep,
    /// An event to arrive in the queue
    EventQueue(EventQueueId),
}

/// The wait ended because its deadline passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TimedOut;

/// Block the running task until [`wake_task`] is called on it or `ticks`
/// ticks pass. `ticks == TIMEOUT_NEVER` waits without a deadline. `ticks ==
/// 0` times out immediately.
///
/// The current context must be waitable (This function doesn't check
/// that).
pub(crate) fn wait_timeout<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    payload: WaitPayload,
    ticks: Ticks,
) -> Result<(), TimedOut> {
    if ticks == 0 {
        return Err(TimedOut);
    }

    let now = time::time_get::<Traits>();
    let sched = Traits::state().sched.write(&mut *lock);
    let task = sched
        .running
        .unwrap_or_else(|| unreachable!("no running task in a waitable context"));

    let cb = &mut sched.tasks[task];
    assert_eq!(cb.st, TaskSt::Running);
    cb.st = match payload {
        WaitPayload::Sleep => TaskSt::Sleeping,
        WaitPayload::EventQueue(_) => TaskSt::Waiting,
    };
    cb.wait = Some(payload);
    cb.wait_result = None;

    if ticks != TIMEOUT_NEVER {
        cb.wake_at = now.wrapping_add(ticks);
        sched.push_sleeping_task(task);
    }

    task::wait_until_woken_up(lock.borrow_mut(), task);

    Traits::state().sched.write(&mut *lock).tasks[task]
        .wait_result
        .take()
        .unwrap_or(Ok(()))
}

/// Wake up a task blocked by [`wait_timeout`], making `result` the outcome of
/// the wait. Returns `false` without doing anything if the task isn't
/// blocked, so the first of several wake-up sources wins.
///
/// The caller should call `unlock_cpu_and_check_preemption` afterwards.
pub(crate) fn wake_task<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: TaskId,
    result: Result<(), TimedOut>,
) -> bool {
    let sched = Traits::state().sched.write(&mut *lock);
    let cb = &mut sched.tasks[task];
    if !matches!(cb.st, TaskSt::Sleeping | TaskSt::Waiting) {
        return false;
    }

    cb.wait = None;
    cb.wait_result = Some(result);
    sched.remove_sleeping_task(task);

    task::make_ready(lock.borrow_mut(), task);
    true
}
