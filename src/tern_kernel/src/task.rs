//! Tasks and the scheduler
//!
//! Tasks are statically created (no deletion). Each one has a unique `u8`
//! priority where a lower value is more urgent. The highest-priority Ready
//! task always runs. Tasks sharing a priority are allowed but logged, and run
//! in FIFO order.
use arrayvec::ArrayVec;
use core::{
    cell::{Cell, UnsafeCell},
    fmt,
    ptr::NonNull,
    sync::atomic::{AtomicBool, Ordering},
};

use crate::{
    error::{BadIdError, ContextError, QueryObjectError, TaskInitError},
    klock::{self, CpuLockGuard, CpuLockTokenRefMut},
    sanity::{self, SanityCheckId},
    state,
    time::{self, tick_leq, Ticks, TIMEOUT_NEVER},
    utils::{
        intrusive_list::{LinkCell, ListAccessor, ListHead},
        pool::Pool,
        Init,
    },
    wait::{self, WaitPayload},
    KernelTraits, MAX_TASKS,
};

pub(crate) mod readyqueue;

define_id! {
    /// Identifies a task.
    pub struct TaskId;
}

/// The entry point of a task. Returning from it is a fatal error.
pub type TaskFn = fn(usize);

/// The unit of a task stack.
pub type StackWord = usize;

/// The value a stack is filled with at task creation, used to measure stack
/// usage.
pub const STACK_FILL_PATTERN: StackWord = 0xdead_beef as StackWord;

/// A statically allocated task stack that can be taken exactly once.
///
/// ```rust
/// use tern_kernel::StaticStack;
/// static STACK: StaticStack<256> = StaticStack::new();
/// let stack = STACK.take().unwrap();
/// assert_eq!(stack.len(), 256);
/// assert!(STACK.take().is_none());
/// ```
pub struct StaticStack<const LEN: usize> {
    taken: AtomicBool,
    words: UnsafeCell<[StackWord; LEN]>,
}

// Safety: The contents are only reachable through the unique reference
// returned by `take`
unsafe impl<const LEN: usize> Sync for StaticStack<LEN> {}

impl<const LEN: usize> StaticStack<LEN> {
    pub const fn new() -> Self {
        Self {
            taken: AtomicBool::new(false),
            words: UnsafeCell::new([0; LEN]),
        }
    }

    /// Take the stack. Returns `None` on every call but the first.
    pub fn take(&'static self) -> Option<&'static mut [StackWord]> {
        if self.taken.swap(true, Ordering::AcqRel) {
            None
        } else {
            // Safety: `taken` guarantees this is the only reference
            Some(unsafe { &mut *self.words.get() })
        }
    }
}

impl<const LEN: usize> Default for StaticStack<LEN> {
    fn default() -> Self {
        Self::new()
    }
}

/// A task's stack region. The kernel never touches it after task creation
/// except to measure usage.
pub(crate) struct TaskStack(NonNull<[StackWord]>);

// Safety: The region is exclusively owned by the task
unsafe impl Send for TaskStack {}
unsafe impl Sync for TaskStack {}

impl TaskStack {
    fn new(region: &'static mut [StackWord]) -> Self {
        region.fill(STACK_FILL_PATTERN);
        Self(NonNull::from(region))
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *mut [StackWord] {
        self.0.as_ptr()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }

    /// Count the words from the low end that still hold the fill pattern.
    /// The stack grows downwards, so these were never used.
    fn untouched_words(&self) -> usize {
        let base = self.as_ptr() as *const StackWord;
        (0..self.len())
            // Safety: `i` is in bounds. The task might be writing to the
            // other end of the region, so the read must not be elided.
            .take_while(|&i| unsafe { base.add(i).read_volatile() } == STACK_FILL_PATTERN)
            .count()
    }
}

impl fmt::Debug for TaskStack {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TaskStack({:p}, {})", self.as_ptr() as *const StackWord, self.len())
    }
}

/// Task state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSt {
    /// The task is in the ready queue.
    Ready,
    /// The task owns the processor.
    Running,
    /// The task is in `time_delay`.
    Sleeping,
    /// The task is blocked on an event queue, possibly with a timeout.
    Waiting,
}

/// *Task control block* - the state data of a task.
pub(crate) struct TaskCb {
    pub(crate) name: &'static str,
    pub(crate) entry: TaskFn,
    pub(crate) arg: usize,
    pub(crate) prio: u8,
    pub(crate) stack: TaskStack,
    pub(crate) st: TaskSt,

    /// What the task is blocked on. `Some(_)` iff `st` is `Sleeping` or
    /// `Waiting`.
    pub(crate) wait: Option<WaitPayload>,
    /// The outcome of the last wait, set by whoever woke the task.
    pub(crate) wait_result: Option<Result<(), wait::TimedOut>>,
    /// The wake-up deadline. Valid iff the task is in the sleep list.
    pub(crate) wake_at: Ticks,

    pub(crate) sanity: Option<SanityCheckId>,
    pub(crate) ctx_switch_count: u32,

    pub(crate) ready_link: LinkCell<TaskId>,
    pub(crate) sleep_link: LinkCell<TaskId>,
}

impl fmt::Debug for TaskCb {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskCb")
            .field("name", &self.name)
            .field("prio", &self.prio)
            .field("stack", &self.stack)
            .field("st", &self.st)
            .field("wait", &self.wait)
            .field("wake_at", &self.wake_at)
            .finish_non_exhaustive()
    }
}

pub(crate) struct SchedState {
    pub(crate) tasks: Pool<TaskId, TaskCb, MAX_TASKS>,
    /// Ready tasks, sorted by priority. The running task is not included.
    pub(crate) ready: ListHead<TaskId>,
    /// Tasks with a finite wake-up deadline, sorted by `wake_at`.
    pub(crate) sleeping: ListHead<TaskId>,
    /// The task that owns the processor, or `None` before the first dispatch.
    pub(crate) running: Option<TaskId>,
}

impl Init for SchedState {
    const INIT: Self = Self {
        tasks: Init::INIT,
        ready: Init::INIT,
        sleeping: Init::INIT,
        running: None,
    };
}

macro_rules! sleep_list {
    ($sched:expr) => {
        ListAccessor::new(&mut $sched.sleeping, &$sched.tasks, |cb: &TaskCb| {
            &cb.sleep_link
        })
    };
}

impl SchedState {
    fn validate(&self, task: TaskId) -> Result<(), BadIdError> {
        if self.tasks.contains(task) {
            Ok(())
        } else {
            Err(BadIdError::BadId)
        }
    }

    /// Insert `task` into the sleep list. FIFO among equal deadlines.
    pub(crate) fn push_sleeping_task(&mut self, task: TaskId) {
        sleep_list!(self).insert_sorted(task, |new, existing| {
            time::tick_lt(new.wake_at, existing.wake_at)
        });
    }

    pub(crate) fn remove_sleeping_task(&mut self, task: TaskId) -> bool {
        sleep_list!(self).remove(task)
    }

    fn front_sleeping_task(&mut self) -> Option<TaskId> {
        sleep_list!(self).front()
    }
}

/// Create a task and make it Ready.
///
/// `sanity_itvl` is the maximum interval between the task's calls to
/// [`sanity::sanity_task_checkin`], or [`TIMEOUT_NEVER`] to opt out of
/// sanity monitoring. `stack` is filled with [`STACK_FILL_PATTERN`].
///
/// If called after `os_start` and the new task has a higher priority than the
/// caller, the new task runs before this function returns.
pub fn task_init<Traits: KernelTraits>(
    name: &'static str,
    entry: TaskFn,
    arg: usize,
    prio: u8,
    sanity_itvl: Ticks,
    stack: &'static mut [StackWord],
) -> Result<TaskId, TaskInitError> {
    if stack.is_empty() {
        return Err(TaskInitError::BadParam);
    }

    let mut lock = klock::lock_cpu::<Traits>()?;

    if Traits::state().sched.read(&*lock).tasks.len() >= MAX_TASKS {
        return Err(TaskInitError::NoMemory);
    }

    let sanity = if sanity_itvl != TIMEOUT_NEVER {
        Some(sanity::register_locked(
            lock.borrow_mut(),
            None,
            0,
            sanity_itvl,
            Some(name),
        )?)
    } else {
        None
    };

    let sched = Traits::state().sched.write(&mut *lock);

    if let Some((_, other)) = sched.tasks.iter().find(|(_, cb)| cb.prio == prio) {
        log::warn!(
            "task '{name}' shares priority {prio} with task '{}'",
            other.name
        );
    }

    let task = sched
        .tasks
        .allocate(TaskCb {
            name,
            entry,
            arg,
            prio,
            stack: TaskStack::new(stack),
            st: TaskSt::Ready,
            wait: None,
            wait_result: None,
            wake_at: 0,
            sanity,
            ctx_switch_count: 0,
            ready_link: Cell::new(None),
            sleep_link: Cell::new(None),
        })
        .map_err(|_| TaskInitError::NoMemory)?;

    log::debug!("created task '{name}' ({task:?}) at priority {prio}");

    // Safety: CPU Lock active, the task is new
    unsafe { Traits::initialize_task_state(task) };

    make_ready(lock.borrow_mut(), task);

    // If the new task has a higher priority, perform a context switch.
    unlock_cpu_and_check_preemption(lock);

    Ok(task)
}

/// Transition the task into the Ready state. The task must not be in the
/// ready queue or the sleep list.
pub(crate) fn make_ready<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: TaskId,
) {
    let sched = Traits::state().sched.write(&mut *lock);
    sched.tasks[task].st = TaskSt::Ready;
    sched.push_back_task(task);
}

/// Relinquish CPU Lock. After that, if there's a higher-priority task than
/// the running task, call `Port::yield_cpu`.
///
/// System services that transition a task into the Ready state should call
/// this before returning to the caller. Before `os_start`, this only
/// releases CPU Lock.
pub(crate) fn unlock_cpu_and_check_preemption<Traits: KernelTraits>(
    mut lock: CpuLockGuard<Traits>,
) {
    if !state::is_started::<Traits>() {
        return;
    }

    let sched = Traits::state().sched.write(&mut *lock);
    let prev_task_priority = running_task_priority(sched);
    let has_preempting_task = sched.has_ready_task_in_priority_range(..prev_task_priority);

    // Relinquish CPU Lock
    drop(lock);

    if has_preempting_task {
        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };
    }
}

/// The priority of the running task if it's still runnable, `usize::MAX`
/// otherwise.
fn running_task_priority(sched: &SchedState) -> usize {
    match sched.running {
        Some(task) if sched.tasks[task].st == TaskSt::Running => sched.tasks[task].prio as usize,
        _ => usize::MAX,
    }
}

/// Implements `PortToKernel::choose_running_task`.
pub(crate) fn choose_next_running_task<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    let sched = Traits::state().sched.write(&mut *lock);

    // The special value `usize::MAX` means there's no running task or it's
    // blocked, and `running` must be updated even if nothing is Ready.
    let prev_running_task = sched.running;
    let prev_task_priority = running_task_priority(sched);

    let next_running_task = match sched.pop_front_task(prev_task_priority) {
        readyqueue::ScheduleDecision::SwitchTo(task) => task,

        // Return if there's no task willing to take over the current one, and
        // the current one can still run.
        readyqueue::ScheduleDecision::Keep => {
            debug_assert_ne!(prev_task_priority, usize::MAX);
            return;
        }
    };

    if let Some(task) = next_running_task {
        // Transition `next_running_task` into the Running state
        sched.tasks[task].st = TaskSt::Running;

        if prev_running_task == Some(task) {
            // Skip the remaining steps if `task == prev_running_task`
            return;
        }

        sched.tasks[task].ctx_switch_count = sched.tasks[task].ctx_switch_count.wrapping_add(1);
    }

    // `prev_running_task` now loses the control of the processor.
    if let Some(prev) = prev_running_task {
        match sched.tasks[prev].st {
            TaskSt::Running => {
                // Preempted
                sched.tasks[prev].st = TaskSt::Ready;
                sched.push_back_task(prev);
            }
            // Blocked, or already requeued by `yield_now`
            TaskSt::Sleeping | TaskSt::Waiting | TaskSt::Ready => {}
        }
    }

    sched.running = next_running_task;
}

/// Block the running task until another party changes its state from
/// `Sleeping` or `Waiting` to `Running`. The caller must set the blocked
/// state first.
///
/// The current context must be waitable (This function doesn't check
/// that). The caller should use `expect_waitable_context` to do that.
pub(crate) fn wait_until_woken_up<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    task: TaskId,
) {
    debug_assert_eq!(state::expect_waitable_context::<Traits>(), Ok(()));

    loop {
        // Temporarily release the CPU Lock before calling `yield_cpu`
        // Safety: (1) We don't access resources protected by CPU Lock.
        //         (2) We currently have CPU Lock.
        //         (3) We will re-acquire a CPU Lock before returning from this
        //             function.
        unsafe { Traits::leave_cpu_lock() };

        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };

        // Re-acquire a CPU Lock
        unsafe { Traits::enter_cpu_lock() };

        let st = Traits::state().sched.read(&*lock).tasks[task].st;
        if st == TaskSt::Running {
            break;
        }

        assert!(
            matches!(st, TaskSt::Sleeping | TaskSt::Waiting | TaskSt::Ready),
            "{task:?} resumed in state {st:?}"
        );
    }
}

/// Wake up every task whose deadline has passed, reporting a timeout.
pub(crate) fn wake_expired_tasks<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>) {
    let now = time::time_get::<Traits>();
    loop {
        let sched = Traits::state().sched.write(&mut *lock);
        let Some(task) = sched.front_sleeping_task() else {
            break;
        };
        if !tick_leq(sched.tasks[task].wake_at, now) {
            break;
        }
        log::trace!("{task:?} timed out");
        wait::wake_task(lock.borrow_mut(), task, Err(wait::TimedOut));
    }
}

fn sched_wakeup_ticks_inner(sched: &mut SchedState, now: Ticks) -> Ticks {
    match sched.front_sleeping_task() {
        None => TIMEOUT_NEVER,
        Some(task) => {
            let wake_at = sched.tasks[task].wake_at;
            if tick_leq(wake_at, now) {
                0
            } else {
                wake_at.wrapping_sub(now)
            }
        }
    }
}

pub(crate) fn sched_wakeup_ticks_locked<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    now: Ticks,
) -> Ticks {
    sched_wakeup_ticks_inner(Traits::state().sched.write(&mut *lock), now)
}

/// Get the number of ticks from `now` until the earliest task wake-up, `0` if
/// it's overdue, or [`TIMEOUT_NEVER`] if no task is sleeping with a deadline.
pub fn sched_wakeup_ticks<Traits: KernelTraits>(now: Ticks) -> Result<Ticks, ContextError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    Ok(sched_wakeup_ticks_locked(lock.borrow_mut(), now))
}

/// Get the currently running task.
pub fn current_task<Traits: KernelTraits>() -> Result<TaskId, ContextError> {
    let lock = klock::lock_cpu::<Traits>()?;
    state::expect_task_context::<Traits>()?;
    Traits::state()
        .sched
        .read(&*lock)
        .running
        .ok_or(ContextError::BadContext)
}

/// Move the running task behind the other Ready tasks of the same priority
/// and reschedule.
pub fn yield_now<Traits: KernelTraits>() -> Result<(), ContextError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    state::expect_waitable_context::<Traits>()?;

    let sched = Traits::state().sched.write(&mut *lock);
    let task = sched.running.ok_or(ContextError::BadContext)?;
    sched.tasks[task].st = TaskSt::Ready;
    sched.push_back_task(task);

    drop(lock);

    // Safety: CPU Lock inactive
    unsafe { Traits::yield_cpu() };
    Ok(())
}

/// A snapshot of a task's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskInfo {
    pub name: &'static str,
    pub prio: u8,
    pub state: TaskSt,
    /// How many times the task has been switched in.
    pub ctx_switch_count: u32,
    /// The stack size in words.
    pub stack_size: usize,
    /// The high-water mark of the stack usage in words.
    pub stack_usage: usize,
    /// The task's sanity check, if it has one.
    pub sanity_check: Option<SanityCheckId>,
    /// The wake-up deadline of a timed wait.
    pub wake_at: Option<Ticks>,
}

/// Get information about a task.
pub fn task_info<Traits: KernelTraits>(task: TaskId) -> Result<TaskInfo, QueryObjectError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let sched = Traits::state().sched.write(&mut *lock);
    sched.validate(task)?;
    let cb = &sched.tasks[task];
    let wake_at = cb.sleep_link.get().map(|_| cb.wake_at);
    Ok(TaskInfo {
        name: cb.name,
        prio: cb.prio,
        state: cb.st,
        ctx_switch_count: cb.ctx_switch_count,
        stack_size: cb.stack.len(),
        stack_usage: cb.stack.len() - cb.stack.untouched_words(),
        sanity_check: cb.sanity,
        wake_at,
    })
}

/// List all tasks in creation order.
pub fn task_ids<Traits: KernelTraits>() -> Result<ArrayVec<TaskId, MAX_TASKS>, ContextError> {
    let lock = klock::lock_cpu::<Traits>()?;
    Ok(Traits::state().sched.read(&*lock).tasks.ids().collect())
}

/// Look up a task by name.
pub fn task_lookup<Traits: KernelTraits>(name: &str) -> Result<Option<TaskId>, ContextError> {
    let lock = klock::lock_cpu::<Traits>()?;
    let found = Traits::state()
        .sched
        .read(&*lock)
        .tasks
        .iter()
        .find(|(_, cb)| cb.name == name)
        .map(|(id, _)| id);
    Ok(found)
}

/// Called by a port when a task's entry function returns.
pub fn task_returned(task: TaskId) -> ! {
    panic!("{task:?} returned from its entry function");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy(_: usize) {}

    fn new_cb(prio: u8) -> TaskCb {
        let stack = Box::leak(vec![0; 4].into_boxed_slice());
        TaskCb {
            name: "t",
            entry: dummy,
            arg: 0,
            prio,
            stack: TaskStack::new(stack),
            st: TaskSt::Ready,
            wait: None,
            wait_result: None,
            wake_at: 0,
            sanity: None,
            ctx_switch_count: 0,
            ready_link: Cell::new(None),
            sleep_link: Cell::new(None),
        }
    }

    #[test]
    fn ready_queue_orders_by_priority_then_fifo() {
        let mut sched = SchedState::INIT;
        let ids: Vec<TaskId> = [5u8, 2, 5, 9]
            .iter()
            .map(|&p| sched.tasks.allocate(new_cb(p)).unwrap())
            .collect();
        for &id in &ids {
            sched.push_back_task(id);
        }
        assert_eq!(sched.ready_tasks(), vec![ids[1], ids[0], ids[2], ids[3]]);

        assert!(sched.has_ready_task_in_priority_range(..3));
        assert!(!sched.has_ready_task_in_priority_range(..2));

        // A running task at priority 2 isn't preempted by a Ready task at the
        // same priority
        assert_eq!(
            sched.pop_front_task(2),
            readyqueue::ScheduleDecision::Keep
        );
        assert_eq!(
            sched.pop_front_task(3),
            readyqueue::ScheduleDecision::SwitchTo(Some(ids[1]))
        );
        assert_eq!(
            sched.pop_front_task(usize::MAX),
            readyqueue::ScheduleDecision::SwitchTo(Some(ids[0]))
        );
        assert_eq!(sched.ready_tasks(), vec![ids[2], ids[3]]);
    }

    #[test]
    fn sleep_list_and_wakeup_ticks() {
        let mut sched = SchedState::INIT;
        let a = sched.tasks.allocate(new_cb(1)).unwrap();
        let b = sched.tasks.allocate(new_cb(2)).unwrap();
        assert_eq!(sched_wakeup_ticks_inner(&mut sched, 100), TIMEOUT_NEVER);

        sched.tasks[a].wake_at = 130;
        sched.tasks[b].wake_at = 120;
        sched.push_sleeping_task(a);
        sched.push_sleeping_task(b);

        assert_eq!(sched.front_sleeping_task(), Some(b));
        assert_eq!(sched_wakeup_ticks_inner(&mut sched, 100), 20);
        assert_eq!(sched_wakeup_ticks_inner(&mut sched, 120), 0);
        assert_eq!(sched_wakeup_ticks_inner(&mut sched, 125), 0);

        assert!(sched.remove_sleeping_task(b));
        assert_eq!(sched_wakeup_ticks_inner(&mut sched, 100), 30);
    }

    #[test]
    fn wakeup_ticks_across_wrap_around() {
        let mut sched = SchedState::INIT;
        let a = sched.tasks.allocate(new_cb(1)).unwrap();
        sched.tasks[a].wake_at = 5;
        sched.push_sleeping_task(a);
        assert_eq!(sched_wakeup_ticks_inner(&mut sched, u32::MAX - 4), 10);
    }

    #[test]
    fn stack_is_filled_at_creation() {
        let cb = new_cb(0);
        assert_eq!(cb.stack.len(), 4);
        assert_eq!(cb.stack.untouched_words(), 4);
        // Simulate a push at the top of the stack
        unsafe { (cb.stack.as_ptr() as *mut StackWord).add(3).write(0) };
        assert_eq!(cb.stack.untouched_words(), 3);
    }
}
