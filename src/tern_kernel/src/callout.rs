//! Callouts (one-shot timers)
//!
//! A callout owns an event. When it expires, the event is put to the
//! callout's event queue, or, if it has none, the event's callback is called
//! directly in the tick context.
use core::cell::Cell;

use crate::{
    error::{BadIdError, CalloutInitError, CalloutResetError, ContextError, QueryObjectError},
    eventq::{self, EventFn, EventId, EventQueueId},
    klock::{self, CpuLockGuard, CpuLockTokenRefMut},
    task,
    time::{self, tick_geq, tick_gt, tick_lt, Ticks, TIMEOUT_NEVER},
    utils::{
        intrusive_list::{LinkCell, ListAccessor, ListHead},
        pool::Pool,
        Init,
    },
    KernelTraits, MAX_CALLOUTS,
};

define_id! {
    /// Identifies a callout.
    pub struct CalloutId;
}

pub(crate) struct CalloutCb {
    ev: EventId,
    evq: Option<EventQueueId>,
    /// The expiration time. Valid iff the callout is in the pending list.
    ticks: Ticks,
    link: LinkCell<CalloutId>,
}

pub(crate) struct CalloutState {
    callouts: Pool<CalloutId, CalloutCb, MAX_CALLOUTS>,
    /// Armed callouts, sorted by expiration time. FIFO among equal times.
    pending: ListHead<CalloutId>,
}

impl Init for CalloutState {
    const INIT: Self = Self {
        callouts: Init::INIT,
        pending: Init::INIT,
    };
}

macro_rules! pending_list {
    ($state:expr) => {
        ListAccessor::new(&mut $state.pending, &$state.callouts, |c: &CalloutCb| {
            &c.link
        })
    };
}

impl CalloutState {
    fn validate(&self, co: CalloutId) -> Result<(), BadIdError> {
        if self.callouts.contains(co) {
            Ok(())
        } else {
            Err(BadIdError::BadId)
        }
    }
}

/// Create a callout. On expiry, its event (created with `cb` and `arg`) is
/// put to `evq`, or, if `evq` is `None`, `cb` is called directly in the tick
/// context.
pub fn callout_init<Traits: KernelTraits>(
    evq: Option<EventQueueId>,
    cb: Option<EventFn>,
    arg: usize,
) -> Result<CalloutId, CalloutInitError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    if let Some(q) = evq {
        eventq::validate_queue(lock.borrow_mut(), q)?;
    }

    if Traits::state().callout.read(&*lock).callouts.len() >= MAX_CALLOUTS
        || !eventq::has_free_event(lock.borrow_mut())
    {
        return Err(CalloutInitError::NoMemory);
    }

    let ev = eventq::event_init_locked(lock.borrow_mut(), cb, arg)?;

    Ok(Traits::state()
        .callout
        .write(&mut *lock)
        .callouts
        .allocate(CalloutCb {
            ev,
            evq,
            ticks: 0,
            link: Cell::new(None),
        })
        .map_err(|_| CalloutInitError::NoMemory)?)
}

/// Disarm the callout and remove its event from the queue. Does nothing if
/// the callout isn't armed.
fn stop_locked<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>, co: CalloutId) {
    let state = Traits::state().callout.write(&mut *lock);
    pending_list!(state).remove(co);
    let (ev, evq) = (state.callouts[co].ev, state.callouts[co].evq);

    if let Some(q) = evq {
        eventq::remove_locked(lock.borrow_mut(), q, ev);
    }
}

/// Arm the callout to expire `ticks` ticks from now, cancelling any pending
/// expiry. With `ticks == 0`, the callout fires immediately.
///
/// Fails with `InvalidState` if `ticks` is negative.
pub fn callout_reset<Traits: KernelTraits>(
    co: CalloutId,
    ticks: i32,
) -> Result<(), CalloutResetError> {
    if ticks < 0 {
        return Err(CalloutResetError::InvalidState);
    }

    let mut lock = klock::lock_cpu::<Traits>()?;
    Traits::state().callout.read(&*lock).validate(co)?;

    stop_locked(lock.borrow_mut(), co);

    if ticks == 0 {
        fire(lock, co);
        return Ok(());
    }

    let now = time::time_get::<Traits>();
    let state = Traits::state().callout.write(&mut *lock);
    state.callouts[co].ticks = now.wrapping_add(ticks as Ticks);
    pending_list!(state).insert_sorted(co, |new, existing| tick_lt(new.ticks, existing.ticks));

    Ok(())
}

/// Deliver an expired callout that has already been unlinked.
fn fire<Traits: KernelTraits>(mut lock: CpuLockGuard<Traits>, co: CalloutId) {
    let (ev, evq) = {
        let c = &Traits::state().callout.read(&*lock).callouts[co];
        (c.ev, c.evq)
    };

    match evq {
        Some(q) => {
            eventq::put_locked(lock.borrow_mut(), q, ev);
            task::unlock_cpu_and_check_preemption(lock);
        }
        None => {
            let (cb, arg) = eventq::event_callback(lock.borrow_mut(), ev);
            drop(lock);
            if let Some(cb) = cb {
                cb(ev, arg);
            }
        }
    }
}

/// Disarm the callout. If its event was already put to the queue but not
/// consumed, it's removed from the queue.
pub fn callout_stop<Traits: KernelTraits>(co: CalloutId) -> Result<(), QueryObjectError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    Traits::state().callout.read(&*lock).validate(co)?;
    stop_locked(lock.borrow_mut(), co);
    Ok(())
}

/// Get a flag indicating whether the callout is armed.
pub fn callout_is_active<Traits: KernelTraits>(co: CalloutId) -> Result<bool, QueryObjectError> {
    let lock = klock::lock_cpu::<Traits>()?;
    let state = Traits::state().callout.read(&*lock);
    state.validate(co)?;
    Ok(state.callouts[co].link.get().is_some())
}

/// Get the number of ticks from `now` until the callout expires. Returns `0`
/// if the callout is overdue or not armed.
pub fn callout_remaining_ticks<Traits: KernelTraits>(
    co: CalloutId,
    now: Ticks,
) -> Result<Ticks, QueryObjectError> {
    let lock = klock::lock_cpu::<Traits>()?;
    let state = Traits::state().callout.read(&*lock);
    state.validate(co)?;
    let c = &state.callouts[co];
    Ok(if c.link.get().is_some() && tick_geq(c.ticks, now) {
        c.ticks.wrapping_sub(now)
    } else {
        0
    })
}

/// Get the event owned by the callout.
pub fn callout_event<Traits: KernelTraits>(co: CalloutId) -> Result<EventId, QueryObjectError> {
    let lock = klock::lock_cpu::<Traits>()?;
    let state = Traits::state().callout.read(&*lock);
    state.validate(co)?;
    Ok(state.callouts[co].ev)
}

pub(crate) fn wakeup_ticks_locked<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    now: Ticks,
) -> Ticks {
    let state = Traits::state().callout.write(&mut *lock);
    match pending_list!(state).front_data() {
        None => TIMEOUT_NEVER,
        Some(c) if tick_gt(c.ticks, now) => c.ticks.wrapping_sub(now),
        Some(_) => 0,
    }
}

/// Get the number of ticks from `now` until the earliest callout expires,
/// `0` if one is overdue, or [`TIMEOUT_NEVER`] if none is armed.
pub fn callout_wakeup_ticks<Traits: KernelTraits>(now: Ticks) -> Result<Ticks, ContextError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    Ok(wakeup_ticks_locked(lock.borrow_mut(), now))
}

/// Fire every expired callout in expiration order. CPU Lock is released
/// while each one is delivered, so callbacks may re-arm callouts.
pub(crate) fn handle_tick<Traits: KernelTraits>(
    mut lock: CpuLockGuard<Traits>,
) -> CpuLockGuard<Traits> {
    loop {
        let now = time::time_get::<Traits>();
        let state = Traits::state().callout.write(&mut *lock);
        let mut pending = pending_list!(state);
        let expired = match pending.front_data() {
            Some(c) if tick_geq(now, c.ticks) => pending.pop_front(),
            _ => None,
        };

        let Some(co) = expired else {
            return lock;
        };

        log::trace!("{co:?} expired");
        fire(lock, co);

        // The precondition of `handle_tick` includes CPU Lock being inactive
        // on entry, so this should succeed
        lock = klock::lock_cpu::<Traits>().unwrap();
    }
}
