//! Controlled shutdown
//!
//! [`sysdown`] runs every shutdown callback returned by
//! [`KernelCfg::sysdown_handlers`]. A callback that needs more time returns
//! [`SysdownStatus::InProgress`] and later calls [`sysdown_release`]. The
//! system resets when the last outstanding callback releases. If that doesn't
//! happen within [`KernelCfg::SYSDOWN_TIMEOUT_MS`],
//! [`KernelCfg::sysdown_panic`] is called.
use crate::{
    callout::{self, CalloutId},
    error::{ContextError, SysdownError},
    eventq::EventId,
    klock, time,
    utils::Init,
    KernelTraits,
};

/// The result of a shutdown callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysdownStatus {
    /// The callback is done.
    Complete,
    /// The callback will call [`sysdown_release`] when it's done.
    InProgress,
    /// The callback failed. Shutdown proceeds regardless.
    Failed(i32),
}

/// Why the system is shutting down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootReason {
    /// Requested by the application.
    Requested,
    /// A firmware update was installed.
    SoftwareUpdate,
    /// An application-defined reason.
    Other(u32),
}

/// A shutdown callback.
pub type SysdownFn = fn(RebootReason) -> SysdownStatus;

pub(crate) struct SysdownState {
    active: bool,
    /// All callbacks have been invoked.
    dispatched: bool,
    /// The number of outstanding releases. Goes below zero if a callback
    /// releases before reporting `InProgress`.
    in_progress: i32,
    reason: Option<RebootReason>,
    timer: Option<CalloutId>,
}

impl Init for SysdownState {
    const INIT: Self = Self {
        active: false,
        dispatched: false,
        in_progress: 0,
        reason: None,
        timer: None,
    };
}

/// Create the shutdown timer. Called by `os_init`.
pub(crate) fn init_timer<Traits: KernelTraits>() {
    let timer = callout::callout_init::<Traits>(None, Some(timed_out::<Traits>), 0)
        .unwrap_or_else(|e| panic!("failed to create the sysdown timer: {e:?}"));
    let mut lock = klock::lock_cpu::<Traits>()
        .unwrap_or_else(|_| panic!("`os_init` called with CPU Lock active"));
    Traits::state().sysdown.write(&mut *lock).timer = Some(timer);
}

fn timed_out<Traits: KernelTraits>(_: EventId, _: usize) {
    let outstanding = klock::lock_cpu::<Traits>()
        .map(|lock| Traits::state().sysdown.read(&*lock).in_progress)
        .unwrap_or(-1);
    log::error!("sysdown timed out with {outstanding} callback(s) outstanding");
    Traits::sysdown_panic();
}

/// Start a controlled shutdown. Resets the system before returning if no
/// callback reports `InProgress`.
///
/// If shutdown is disabled by [`KernelCfg::SYSDOWN_ENABLED`], this resets
/// the system immediately.
pub fn sysdown<Traits: KernelTraits>(reason: RebootReason) -> Result<(), SysdownError> {
    if !Traits::SYSDOWN_ENABLED {
        log::info!("resetting ({reason:?})");
        // Safety: Only the kernel calls this
        unsafe { Traits::system_reset() };
    }

    let timer = {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let state = Traits::state().sysdown.write(&mut *lock);
        if state.active {
            return Err(SysdownError::AlreadyInProgress);
        }
        state.active = true;
        state.reason = Some(reason);
        state.timer
    };

    log::info!("shutting down ({reason:?})");

    if let Some(timer) = timer {
        let ticks = time::interval_ticks::<Traits>(Traits::SYSDOWN_TIMEOUT_MS);
        let result = callout::callout_reset::<Traits>(timer, ticks);
        debug_assert!(result.is_ok(), "{result:?}");
    }

    for (i, handler) in Traits::sysdown_handlers().iter().enumerate() {
        match handler(reason) {
            SysdownStatus::Complete => {}
            SysdownStatus::InProgress => {
                let mut lock = klock::lock_cpu::<Traits>()?;
                Traits::state().sysdown.write(&mut *lock).in_progress += 1;
            }
            SysdownStatus::Failed(code) => {
                log::warn!("sysdown callback #{i} failed with {code}");
            }
        }
    }

    let done = {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let state = Traits::state().sysdown.write(&mut *lock);
        state.dispatched = true;
        state.in_progress == 0
    };

    if done {
        complete::<Traits>();
    }

    log::debug!("waiting for sysdown callbacks to release");
    Ok(())
}

/// Report that an `InProgress` shutdown callback has finished. The call that
/// releases the last outstanding callback resets the system.
///
/// Panics if no shutdown is in progress.
pub fn sysdown_release<Traits: KernelTraits>() -> Result<(), ContextError> {
    let done = {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let state = Traits::state().sysdown.write(&mut *lock);
        assert!(state.active, "`sysdown_release` called without a shutdown");
        state.in_progress -= 1;
        if state.dispatched {
            assert!(
                state.in_progress >= 0,
                "more `sysdown_release` calls than `InProgress` callbacks"
            );
        }
        state.dispatched && state.in_progress == 0
    };

    if done {
        complete::<Traits>();
    }
    Ok(())
}

fn complete<Traits: KernelTraits>() -> ! {
    let timer = klock::lock_cpu::<Traits>()
        .ok()
        .and_then(|lock| Traits::state().sysdown.read(&*lock).timer);
    if let Some(timer) = timer {
        let _ = callout::callout_stop::<Traits>(timer);
    }

    log::info!("sysdown complete, resetting");

    // Safety: Only the kernel calls these
    unsafe {
        Traits::watchdog_tickle();
        Traits::system_reset()
    }
}

/// Get a flag indicating whether a shutdown is in progress.
pub fn sysdown_is_active<Traits: KernelTraits>() -> Result<bool, ContextError> {
    let lock = klock::lock_cpu::<Traits>()?;
    Ok(Traits::state().sysdown.read(&*lock).active)
}

/// Get the number of callbacks that haven't released yet.
pub fn sysdown_in_progress_count<Traits: KernelTraits>() -> Result<u32, ContextError> {
    let lock = klock::lock_cpu::<Traits>()?;
    Ok(Traits::state().sysdown.read(&*lock).in_progress.max(0) as u32)
}

/// Get the reason of the ongoing shutdown.
pub fn sysdown_reason<Traits: KernelTraits>() -> Result<Option<RebootReason>, ContextError> {
    let lock = klock::lock_cpu::<Traits>()?;
    Ok(Traits::state().sysdown.read(&*lock).reason)
}
