//! Simulates a single-processor interrupt controller and the thread selection
//! of the dispatcher.
use std::collections::{HashMap, VecDeque};
use tern_kernel::{TaskId, Ticks};

use crate::ums;

/// A simulated interrupt handler.
pub type InterruptHandlerFn = fn();

/// The state of the simulated processor.
pub struct SchedState {
    pub cpu_lock: bool,

    /// Set while an interrupt handler is running.
    pub in_interrupt: bool,

    /// The thread that owns the processor: the boot thread until
    /// `dispatch_first_task`, the running task's thread after that.
    pub running_thread: Option<ums::ThreadId>,

    /// Task threads, spawned on the first dispatch of each task.
    tasks: HashMap<TaskId, Tsm>,

    /// Ticks reported by `tick_idle` or a simulated busy-wait and not
    /// delivered to the kernel yet.
    pending_ticks: Ticks,

    /// Pended external interrupts, handled in FIFO order.
    pending_irqs: VecDeque<InterruptHandlerFn>,

    /// A dispatch was requested from an interrupt context.
    pub dispatch_pending: bool,
}

/// Task state machine
///
/// These don't exactly align with the task states defined in the kernel.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Tsm {
    /// The task's context is initialized but hasn't started running.
    Dormant,
    /// The task has a thread.
    Running(ums::ThreadId),
}

/// An interrupt taken by [`SchedState::take_interrupt`].
pub enum Interrupt {
    Timer(Ticks),
    External(InterruptHandlerFn),
}

impl SchedState {
    pub fn new() -> Self {
        Self {
            cpu_lock: false,
            in_interrupt: false,
            running_thread: None,
            tasks: HashMap::new(),
            pending_ticks: 0,
            pending_irqs: VecDeque::new(),
            dispatch_pending: false,
        }
    }

    pub fn initialize_task(&mut self, task: TaskId) {
        match self.tasks.get(&task) {
            None | Some(Tsm::Dormant) => {
                self.tasks.insert(task, Tsm::Dormant);
            }
            Some(Tsm::Running(_)) => {
                panic!("{task:?} was initialized twice");
            }
        }
    }

    /// Get the thread of `task`, or `None` if it hasn't started running.
    pub fn task_thread(&self, task: TaskId) -> Option<ums::ThreadId> {
        match self.tasks.get(&task) {
            Some(Tsm::Running(thread_id)) => Some(*thread_id),
            Some(Tsm::Dormant) => None,
            None => panic!("{task:?} was dispatched without being initialized"),
        }
    }

    pub fn set_task_thread(&mut self, task: TaskId, thread_id: ums::ThreadId) {
        self.tasks.insert(task, Tsm::Running(thread_id));
    }

    pub fn pend_ticks(&mut self, ticks: Ticks) {
        self.pending_ticks = self.pending_ticks.saturating_add(ticks);
    }

    pub fn pend_irq(&mut self, handler: InterruptHandlerFn) {
        self.pending_irqs.push_back(handler);
    }

    /// Take the next interrupt that can be handled now. The timer interrupt
    /// has priority over external ones.
    pub fn take_interrupt(&mut self) -> Option<Interrupt> {
        if self.cpu_lock || self.in_interrupt {
            return None;
        }

        if self.pending_ticks > 0 {
            let ticks = std::mem::take(&mut self.pending_ticks);
            Some(Interrupt::Timer(ticks))
        } else {
            self.pending_irqs.pop_front().map(Interrupt::External)
        }
    }
}

impl ums::Scheduler for SchedState {
    fn choose_next_thread(&mut self) -> Option<ums::ThreadId> {
        self.running_thread
    }

    fn thread_exited(&mut self, thread_id: ums::ThreadId) {
        if self.running_thread == Some(thread_id) {
            self.running_thread = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nop() {}

    #[test]
    fn interrupts_are_masked() {
        let mut st = SchedState::new();
        st.pend_irq(nop);
        st.pend_ticks(3);
        st.pend_ticks(2);

        st.cpu_lock = true;
        assert!(st.take_interrupt().is_none());
        st.cpu_lock = false;

        st.in_interrupt = true;
        assert!(st.take_interrupt().is_none());
        st.in_interrupt = false;

        assert!(matches!(st.take_interrupt(), Some(Interrupt::Timer(5))));
        assert!(matches!(st.take_interrupt(), Some(Interrupt::External(_))));
        assert!(st.take_interrupt().is_none());
    }
}
