//! Task ready queue implementation (internal use only).
use core::ops::RangeTo;

use super::{SchedState, TaskCb, TaskId};
use crate::utils::intrusive_list::ListAccessor;

/// The result of [`SchedState::pop_front_task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScheduleDecision<T> {
    /// The current task should stay running.
    Keep,
    /// The current task should be switched out and the specified task should
    /// run next.
    SwitchTo(T),
}

macro_rules! ready_list {
    ($sched:expr) => {
        ListAccessor::new(&mut $sched.ready, &$sched.tasks, |cb: &TaskCb| &cb.ready_link)
    };
}

impl SchedState {
    /// Return a flag indicating whether there's a task in the Ready state
    /// whose priority is in the specified range.
    pub(crate) fn has_ready_task_in_priority_range(&mut self, range: RangeTo<usize>) -> bool {
        ready_list!(self)
            .front_data()
            .map_or(false, |cb| range.contains(&(cb.prio as usize)))
    }

    /// Insert the specified task to the ready queue, after all tasks having
    /// the same or higher priority.
    pub(crate) fn push_back_task(&mut self, task: TaskId) {
        ready_list!(self).insert_sorted(task, |new, existing| new.prio < existing.prio);
    }

    /// Choose the next task to schedule based on `prev_task_priority`, the
    /// priority of the task that would keep running if no switch happened
    /// (or `usize::MAX` if there's none).
    ///
    /// A Ready task replaces the current one only if it has a strictly higher
    /// priority, i.e., the current task is treated as if it was at the front
    /// of its priority level. With `usize::MAX`, this always returns
    /// `SwitchTo(_)`.
    ///
    /// If this method returns `SwitchTo(Some(task))`, `task` is removed from
    /// the queue.
    pub(crate) fn pop_front_task(
        &mut self,
        prev_task_priority: usize,
    ) -> ScheduleDecision<Option<TaskId>> {
        let mut accessor = ready_list!(self);
        match accessor.front_data() {
            Some(cb) if (cb.prio as usize) < prev_task_priority => {
                ScheduleDecision::SwitchTo(accessor.pop_front())
            }
            _ if prev_task_priority == usize::MAX => ScheduleDecision::SwitchTo(None),
            _ => ScheduleDecision::Keep,
        }
    }

    /// The tasks in the ready queue, highest priority first.
    #[cfg(test)]
    pub(crate) fn ready_tasks(&mut self) -> std::vec::Vec<TaskId> {
        ready_list!(self).iter().collect()
    }
}
