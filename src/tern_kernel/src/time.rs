//! The OS tick counter and everything derived from it
//!
//! The tick counter is a 32-bit value that wraps around. Two tick values are
//! compared by the sign of their wrapping difference, which is correct as
//! long as they are less than 2³¹ ticks apart.
use core::sync::atomic::Ordering;

use crate::{
    callout,
    error::{ContextError, ConvertTimeError},
    klock::{self, CpuLockTokenRefMut},
    state, task,
    utils::Init,
    wait, KernelCfg, KernelTraits,
};

/// A point in time or a duration measured in OS ticks.
pub type Ticks = u32;

/// A timeout value meaning "wait forever".
pub const TIMEOUT_NEVER: Ticks = Ticks::MAX;

/// `a` is strictly before `b`.
#[inline]
pub const fn tick_lt(a: Ticks, b: Ticks) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// `a` is before or at `b`.
#[inline]
pub const fn tick_leq(a: Ticks, b: Ticks) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}

/// `a` is strictly after `b`.
#[inline]
pub const fn tick_gt(a: Ticks, b: Ticks) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// `a` is at or after `b`.
#[inline]
pub const fn tick_geq(a: Ticks, b: Ticks) -> bool {
    (a.wrapping_sub(b) as i32) >= 0
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TimeOfDay {
    /// Seconds since the UNIX epoch.
    pub secs: u64,
    /// The sub-second part in microseconds. Always less than `1_000_000`.
    pub usecs: u32,
}

pub(crate) struct TimeState {
    /// The upper 32 bits of the 64-bit uptime in ticks.
    wraps: u32,
    /// The 64-bit uptime and the time of day at the last call to
    /// `set_time_of_day`.
    tod_base: Option<(u64, TimeOfDay)>,
}

impl Init for TimeState {
    const INIT: Self = Self {
        wraps: 0,
        tod_base: None,
    };
}

/// Get the current value of the tick counter.
#[inline]
pub fn time_get<Traits: KernelTraits>() -> Ticks {
    Traits::state().tick.load(Ordering::Relaxed)
}

/// Put the current task to sleep for `ticks` ticks. `0` returns immediately.
/// [`TIMEOUT_NEVER`] sleeps forever.
pub fn time_delay<Traits: KernelTraits>(ticks: Ticks) -> Result<(), ContextError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    state::expect_waitable_context::<Traits>()?;

    if ticks == 0 {
        return Ok(());
    }

    // Nothing but the timeout can wake a sleeping task
    let _ = wait::wait_timeout(lock.borrow_mut(), wait::WaitPayload::Sleep, ticks);

    Ok(())
}

/// Convert milliseconds to ticks. The result is rounded down.
#[inline]
pub const fn ms_to_ticks_with(ms: u32, ticks_per_sec: u32) -> u64 {
    ms as u64 * ticks_per_sec as u64 / 1000
}

/// Convert milliseconds to ticks. The result is rounded up, so a non-zero
/// interval never becomes zero ticks.
#[inline]
pub const fn ms_to_ticks_ceil_with(ms: u32, ticks_per_sec: u32) -> u64 {
    (ms as u64 * ticks_per_sec as u64).div_ceil(1000)
}

/// Convert a configured interval to ticks for [`callout_reset`], rounding up
/// and saturating at `i32::MAX`.
///
/// [`callout_reset`]: crate::callout::callout_reset
pub(crate) fn interval_ticks<Traits: KernelCfg>(ms: u32) -> i32 {
    ms_to_ticks_ceil_with(ms, Traits::TICKS_PER_SEC).min(i32::MAX as u64) as i32
}

/// Convert ticks to milliseconds. The result is rounded down.
#[inline]
pub const fn ticks_to_ms_with(ticks: Ticks, ticks_per_sec: u32) -> u64 {
    ticks as u64 * 1000 / ticks_per_sec as u64
}

/// Convert milliseconds to ticks. Fails with `BadParam` if the result
/// doesn't fit in [`Ticks`].
pub fn ms_to_ticks<Traits: KernelCfg>(ms: u32) -> Result<Ticks, ConvertTimeError> {
    Ticks::try_from(ms_to_ticks_with(ms, Traits::TICKS_PER_SEC))
        .map_err(|_| ConvertTimeError::BadParam)
}

/// Convert milliseconds to ticks, truncating the result to 32 bits.
#[inline]
pub fn ms_to_ticks32<Traits: KernelCfg>(ms: u32) -> Ticks {
    ms_to_ticks_with(ms, Traits::TICKS_PER_SEC) as Ticks
}

/// Convert ticks to milliseconds. Fails with `BadParam` if the result
/// doesn't fit in `u32`.
pub fn ticks_to_ms<Traits: KernelCfg>(ticks: Ticks) -> Result<u32, ConvertTimeError> {
    u32::try_from(ticks_to_ms_with(ticks, Traits::TICKS_PER_SEC))
        .map_err(|_| ConvertTimeError::BadParam)
}

/// Convert ticks to milliseconds, truncating the result to 32 bits.
#[inline]
pub fn ticks_to_ms32<Traits: KernelCfg>(ticks: Ticks) -> u32 {
    ticks_to_ms_with(ticks, Traits::TICKS_PER_SEC) as u32
}

fn uptime_ticks64_locked<Traits: KernelTraits>(lock: CpuLockTokenRefMut<'_, Traits>) -> u64 {
    let wraps = Traits::state().time.read(&*lock).wraps;
    ((wraps as u64) << 32) | time_get::<Traits>() as u64
}

/// Get the number of ticks elapsed since boot, without wrap-around.
pub fn uptime_ticks64<Traits: KernelTraits>() -> Result<u64, ContextError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    Ok(uptime_ticks64_locked(lock.borrow_mut()))
}

/// Get the time elapsed since boot in microseconds, at the tick resolution.
pub fn uptime_usecs<Traits: KernelTraits>() -> Result<u64, ContextError> {
    let ticks = uptime_ticks64::<Traits>()?;
    Ok(ticks_to_usecs64::<Traits>(ticks))
}

#[inline]
fn ticks_to_usecs64<Traits: KernelCfg>(ticks: u64) -> u64 {
    (ticks as u128 * 1_000_000 / Traits::TICKS_PER_SEC as u128) as u64
}

/// Set the wall-clock time.
pub fn set_time_of_day<Traits: KernelTraits>(tod: TimeOfDay) -> Result<(), ContextError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let now = uptime_ticks64_locked(lock.borrow_mut());
    Traits::state().time.write(&mut *lock).tod_base = Some((now, tod));
    log::debug!("time of day set to {tod:?}");
    Ok(())
}

/// Get the wall-clock time, or `None` if it was never set.
pub fn time_of_day<Traits: KernelTraits>() -> Result<Option<TimeOfDay>, ContextError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let now = uptime_ticks64_locked(lock.borrow_mut());
    let Some((base_ticks, base)) = Traits::state().time.read(&*lock).tod_base else {
        return Ok(None);
    };

    let usecs =
        base.usecs as u64 + ticks_to_usecs64::<Traits>(now.wrapping_sub(base_ticks));
    Ok(Some(TimeOfDay {
        secs: base.secs + usecs / 1_000_000,
        usecs: (usecs % 1_000_000) as u32,
    }))
}

/// Add `ticks` to the tick counter.
fn advance<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>, ticks: Ticks) -> Ticks {
    let state = Traits::state();
    let old = state.tick.load(Ordering::Relaxed);
    let new = old.wrapping_add(ticks);
    state.tick.store(new, Ordering::Relaxed);
    if new < old {
        state.time.write(&mut *lock).wraps += 1;
    }
    new
}

/// Implements `PortToKernel::timer_tick`.
///
/// Before `os_start`, this only advances the tick counter.
pub(crate) fn handle_tick<Traits: KernelTraits>(ticks: Ticks) {
    if ticks == 0 {
        return;
    }

    // The precondition includes CPU Lock being inactive, so this `unwrap`
    // should succeed
    let mut lock = klock::lock_cpu::<Traits>().unwrap();
    let now = advance(lock.borrow_mut(), ticks);

    if !state::is_started::<Traits>() {
        return;
    }

    log::trace!("tick {now} (+{ticks})");

    // Fire expired callouts. This releases CPU Lock between callouts.
    let mut lock = callout::handle_tick::<Traits>(lock);

    // Wake up the tasks whose sleep or timed wait has expired
    task::wake_expired_tasks::<Traits>(lock.borrow_mut());

    task::unlock_cpu_and_check_preemption(lock);
}
