//! Events and event queues
//!
//! An event is a callback plus an argument. An event queue is a FIFO of
//! events with at most one consumer task. An event is in at most one queue at
//! a time, and putting an event that is already queued does nothing.
use core::cell::Cell;

use crate::{
    error::{
        BadIdError, GetEventError, GetEventTimeoutError, InitObjectError, NoMemoryError,
        QueryObjectError,
    },
    klock::{self, CpuLockTokenRefMut},
    state,
    task::{self, TaskId},
    time::{self, tick_geq, Ticks, TIMEOUT_NEVER},
    utils::{
        intrusive_list::{LinkCell, ListAccessor, ListHead},
        pool::Pool,
        Init,
    },
    wait::{self, WaitPayload},
    KernelTraits, MAX_EVENTS, MAX_EVENT_QUEUES,
};

define_id! {
    /// Identifies an event.
    pub struct EventId;
}

define_id! {
    /// Identifies an event queue.
    pub struct EventQueueId;
}

/// An event callback. Receives the event and its argument.
pub type EventFn = fn(EventId, usize);

pub(crate) struct EventCb {
    cb: Option<EventFn>,
    arg: usize,
    /// The queue the event is currently in.
    queued_in: Option<EventQueueId>,
    link: LinkCell<EventId>,
}

pub(crate) struct EventQueueCb {
    head: ListHead<EventId>,
    /// The task blocked in `eventq_get`.
    waiter: Option<TaskId>,
}

pub(crate) struct EventqState {
    events: Pool<EventId, EventCb, MAX_EVENTS>,
    queues: Pool<EventQueueId, EventQueueCb, MAX_EVENT_QUEUES>,
    dflt: Option<EventQueueId>,
}

impl Init for EventqState {
    const INIT: Self = Self {
        events: Init::INIT,
        queues: Init::INIT,
        dflt: None,
    };
}

macro_rules! queue_list {
    ($state:expr, $q:expr) => {
        ListAccessor::new(&mut $state.queues[$q].head, &$state.events, |ev: &EventCb| {
            &ev.link
        })
    };
}

impl EventqState {
    fn validate_event(&self, ev: EventId) -> Result<(), BadIdError> {
        if self.events.contains(ev) {
            Ok(())
        } else {
            Err(BadIdError::BadId)
        }
    }

    fn validate_queue(&self, q: EventQueueId) -> Result<(), BadIdError> {
        if self.queues.contains(q) {
            Ok(())
        } else {
            Err(BadIdError::BadId)
        }
    }

    fn pop(&mut self, q: EventQueueId) -> Option<EventId> {
        let ev = queue_list!(self, q).pop_front()?;
        self.events[ev].queued_in = None;
        Some(ev)
    }
}

pub(crate) fn event_init_locked<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    cb: Option<EventFn>,
    arg: usize,
) -> Result<EventId, NoMemoryError> {
    Traits::state()
        .eventq
        .write(&mut *lock)
        .events
        .allocate(EventCb {
            cb,
            arg,
            queued_in: None,
            link: Cell::new(None),
        })
        .map_err(|_| NoMemoryError::NoMemory)
}

pub(crate) fn has_free_event<Traits: KernelTraits>(lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
    Traits::state().eventq.read(&*lock).events.len() < MAX_EVENTS
}

/// Create an event.
pub fn event_init<Traits: KernelTraits>(
    cb: Option<EventFn>,
    arg: usize,
) -> Result<EventId, InitObjectError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    Ok(event_init_locked(lock.borrow_mut(), cb, arg)?)
}

/// Get the argument of an event.
pub fn event_arg<Traits: KernelTraits>(ev: EventId) -> Result<usize, QueryObjectError> {
    let lock = klock::lock_cpu::<Traits>()?;
    let state = Traits::state().eventq.read(&*lock);
    state.validate_event(ev)?;
    Ok(state.events[ev].arg)
}

/// Change the argument of an event.
pub fn event_set_arg<Traits: KernelTraits>(
    ev: EventId,
    arg: usize,
) -> Result<(), QueryObjectError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let state = Traits::state().eventq.write(&mut *lock);
    state.validate_event(ev)?;
    state.events[ev].arg = arg;
    Ok(())
}

/// Get a flag indicating whether the event is in a queue.
pub fn event_is_queued<Traits: KernelTraits>(ev: EventId) -> Result<bool, QueryObjectError> {
    let lock = klock::lock_cpu::<Traits>()?;
    let state = Traits::state().eventq.read(&*lock);
    state.validate_event(ev)?;
    Ok(state.events[ev].queued_in.is_some())
}

/// Invoke the event's callback in the calling context.
pub fn event_run<Traits: KernelTraits>(ev: EventId) -> Result<(), QueryObjectError> {
    let (cb, arg) = {
        let lock = klock::lock_cpu::<Traits>()?;
        let state = Traits::state().eventq.read(&*lock);
        state.validate_event(ev)?;
        (state.events[ev].cb, state.events[ev].arg)
    };

    if let Some(cb) = cb {
        cb(ev, arg);
    }
    Ok(())
}

pub(crate) fn event_callback<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    ev: EventId,
) -> (Option<EventFn>, usize) {
    let ev = &Traits::state().eventq.read(&*lock).events[ev];
    (ev.cb, ev.arg)
}

/// Create an event queue.
pub fn eventq_init<Traits: KernelTraits>() -> Result<EventQueueId, InitObjectError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    Traits::state()
        .eventq
        .write(&mut *lock)
        .queues
        .allocate(EventQueueCb {
            head: ListHead::INIT,
            waiter: None,
        })
        .map_err(|_| InitObjectError::NoMemory)
}

/// Get the default event queue, created by `os_init`.
pub fn eventq_dflt<Traits: KernelTraits>() -> Option<EventQueueId> {
    let lock = klock::lock_cpu::<Traits>().ok()?;
    Traits::state().eventq.read(&*lock).dflt
}

pub(crate) fn set_eventq_dflt<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    q: EventQueueId,
) {
    Traits::state().eventq.write(&mut *lock).dflt = Some(q);
}

pub(crate) fn validate_queue<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    q: EventQueueId,
) -> Result<(), BadIdError> {
    Traits::state().eventq.read(&*lock).validate_queue(q)
}

/// Append `ev` to `q` and wake up the consumer. Does nothing if `ev` is
/// already queued. The caller should call `unlock_cpu_and_check_preemption`
/// afterwards.
pub(crate) fn put_locked<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    q: EventQueueId,
    ev: EventId,
) {
    let state = Traits::state().eventq.write(&mut *lock);
    if state.events[ev].queued_in.is_some() {
        return;
    }

    queue_list!(state, q).push_back(ev);
    state.events[ev].queued_in = Some(q);

    if let Some(waiter) = state.queues[q].waiter {
        wait::wake_task(lock.borrow_mut(), waiter, Ok(()));
    }
}

/// Append an event to a queue and wake up the queue's consumer. Putting an
/// event that is already in a queue does nothing.
///
/// This can be called from an interrupt context.
pub fn eventq_put<Traits: KernelTraits>(
    q: EventQueueId,
    ev: EventId,
) -> Result<(), QueryObjectError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    {
        let state = Traits::state().eventq.read(&*lock);
        state.validate_queue(q)?;
        state.validate_event(ev)?;
    }

    put_locked(lock.borrow_mut(), q, ev);

    // The consumer might have a higher priority
    task::unlock_cpu_and_check_preemption(lock);
    Ok(())
}

/// Take the first event from `q`, blocking for up to `ticks` ticks.
fn get_inner<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    q: EventQueueId,
    ticks: Ticks,
) -> Result<EventId, wait::TimedOut> {
    let deadline = time::time_get::<Traits>().wrapping_add(ticks);

    loop {
        let state = Traits::state().eventq.write(&mut *lock);
        if let Some(ev) = state.pop(q) {
            return Ok(ev);
        }

        let remaining = if ticks == TIMEOUT_NEVER {
            TIMEOUT_NEVER
        } else {
            let now = time::time_get::<Traits>();
            if tick_geq(now, deadline) {
                return Err(wait::TimedOut);
            }
            deadline.wrapping_sub(now)
        };

        let me = Traits::state()
            .sched
            .read(&*lock)
            .running
            .unwrap_or_else(|| unreachable!("no running task in a waitable context"));
        let state = Traits::state().eventq.write(&mut *lock);
        if let Some(other) = state.queues[q].waiter {
            panic!("{q:?} already has a consumer ({other:?}), {me:?} can't wait on it");
        }
        state.queues[q].waiter = Some(me);

        let result = wait::wait_timeout(lock.borrow_mut(), WaitPayload::EventQueue(q), remaining);

        Traits::state().eventq.write(&mut *lock).queues[q].waiter = None;

        // The timeout won the race. A late event stays in the queue.
        result?;

        // The event that woke us up might have been removed before we got to
        // run. Wait for the rest of the timeout in that case.
    }
}

/// Take the first event from `q`, blocking until one is available.
pub fn eventq_get<Traits: KernelTraits>(q: EventQueueId) -> Result<EventId, GetEventError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    state::expect_waitable_context::<Traits>()?;
    validate_queue(lock.borrow_mut(), q)?;

    get_inner(lock.borrow_mut(), q, TIMEOUT_NEVER)
        .map_err(|_| unreachable!("an infinite wait timed out"))
}

/// Take the first event from `q`, blocking for up to `ticks` ticks. With
/// `ticks == 0`, this polls the queue. With [`TIMEOUT_NEVER`], this is the
/// same as [`eventq_get`].
pub fn eventq_get_timeout<Traits: KernelTraits>(
    q: EventQueueId,
    ticks: Ticks,
) -> Result<EventId, GetEventTimeoutError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    state::expect_waitable_context::<Traits>()?;
    validate_queue(lock.borrow_mut(), q)?;

    get_inner(lock.borrow_mut(), q, ticks).map_err(|wait::TimedOut| GetEventTimeoutError::Timeout)
}

/// Take the first event from `q` if there's one. Never blocks, so this can
/// be called from any context.
pub fn eventq_get_no_wait<Traits: KernelTraits>(
    q: EventQueueId,
) -> Result<Option<EventId>, QueryObjectError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let state = Traits::state().eventq.write(&mut *lock);
    state.validate_queue(q)?;
    Ok(state.pop(q))
}

/// Remove `ev` from `q`. Does nothing if `ev` isn't in `q`.
pub fn eventq_remove<Traits: KernelTraits>(
    q: EventQueueId,
    ev: EventId,
) -> Result<(), QueryObjectError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let state = Traits::state().eventq.write(&mut *lock);
    state.validate_queue(q)?;
    state.validate_event(ev)?;
    remove_inner(state, q, ev);
    Ok(())
}

fn remove_inner(state: &mut EventqState, q: EventQueueId, ev: EventId) {
    if state.events[ev].queued_in == Some(q) {
        queue_list!(state, q).remove(ev);
        state.events[ev].queued_in = None;
    }
}

pub(crate) fn remove_locked<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    q: EventQueueId,
    ev: EventId,
) {
    remove_inner(Traits::state().eventq.write(&mut *lock), q, ev);
}

/// Get a flag indicating whether `q` is empty.
pub fn eventq_is_empty<Traits: KernelTraits>(q: EventQueueId) -> Result<bool, QueryObjectError> {
    let lock = klock::lock_cpu::<Traits>()?;
    let state = Traits::state().eventq.read(&*lock);
    state.validate_queue(q)?;
    Ok(state.queues[q].head.is_empty())
}

/// Take the first event from `q`, blocking until one is available, and run
/// its callback.
pub fn eventq_run<Traits: KernelTraits>(q: EventQueueId) -> Result<(), GetEventError> {
    let ev = eventq_get::<Traits>(q)?;
    event_run::<Traits>(ev).map_err(|e| match e {
        QueryObjectError::BadContext => GetEventError::BadContext,
        QueryObjectError::BadId => GetEventError::BadId,
    })
}
