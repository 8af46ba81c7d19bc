//! Hardware watchdog and its software monitor
//!
//! The hardware watchdog is configured by `os_init` and tickled by the idle
//! task after each successful sanity pass. A software monitor (a callout)
//! expires [`KernelCfg::WATCHDOG_MONITOR_MARGIN_MS`] before the hardware
//! would, so a starved idle task is reported with a diagnostic instead of a
//! silent reset.
use core::{fmt, marker::PhantomData};

use crate::{
    callout::{self, CalloutId},
    error::WatchdogInitError,
    eventq::EventId,
    klock,
    time,
    utils::Init,
    KernelCfg, KernelTraits,
};

pub(crate) struct WatchdogState {
    initialized: bool,
    monitor: Option<CalloutId>,
    tickle_count: u32,
}

impl Init for WatchdogState {
    const INIT: Self = Self {
        initialized: false,
        monitor: None,
        tickle_count: 0,
    };
}

/// A handle proving the hardware watchdog was configured. Obtained with
/// [`handle`].
pub struct Watchdog<Traits> {
    _phantom: PhantomData<Traits>,
}

impl<Traits> Clone for Watchdog<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits> Copy for Watchdog<Traits> {}

impl<Traits> fmt::Debug for Watchdog<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Watchdog")
    }
}

/// The monitor interval in ticks.
fn monitor_ticks<Traits: KernelCfg>() -> i32 {
    let ms = Traits::WATCHDOG_INTERVAL_MS - Traits::WATCHDOG_MONITOR_MARGIN_MS;
    time::interval_ticks::<Traits>(ms)
}

impl<Traits: KernelTraits> Watchdog<Traits> {
    /// Configure the hardware watchdog and create the monitor. Called once
    /// by `os_init`.
    pub(crate) fn init() -> Result<Self, WatchdogInitError> {
        // Safety: Only the kernel calls this, once
        unsafe { Traits::watchdog_init(Traits::WATCHDOG_INTERVAL_MS) }?;

        let monitor = callout::callout_init::<Traits>(None, Some(monitor_expired::<Traits>), 0)
            .unwrap_or_else(|e| panic!("failed to create the watchdog monitor: {e:?}"));

        let mut lock = klock::lock_cpu::<Traits>()
            .unwrap_or_else(|_| panic!("`os_init` called with CPU Lock active"));
        let state = Traits::state().watchdog.write(&mut *lock);
        state.initialized = true;
        state.monitor = Some(monitor);

        log::debug!(
            "watchdog configured for {} ms",
            Traits::WATCHDOG_INTERVAL_MS
        );
        Ok(Self {
            _phantom: PhantomData,
        })
    }

    /// Arm the hardware watchdog and start the monitor.
    pub fn enable(self) {
        // Safety: The watchdog was configured
        unsafe { Traits::watchdog_enable() };
        self.rearm_monitor();
    }

    /// Restart the hardware watchdog countdown and the monitor.
    pub fn tickle(self) {
        // Safety: The watchdog was configured
        unsafe { Traits::watchdog_tickle() };
        self.rearm_monitor();
    }

    fn rearm_monitor(self) {
        let monitor = {
            let Ok(mut lock) = klock::lock_cpu::<Traits>() else {
                return;
            };
            let state = Traits::state().watchdog.write(&mut *lock);
            state.tickle_count = state.tickle_count.wrapping_add(1);
            state.monitor
        };

        if let Some(monitor) = monitor {
            let result = callout::callout_reset::<Traits>(monitor, monitor_ticks::<Traits>());
            debug_assert!(result.is_ok(), "{result:?}");
        }
    }
}

fn monitor_expired<Traits: KernelTraits>(_: EventId, _: usize) {
    log::error!(
        "watchdog monitor expired: the idle task hasn't run for {} ms",
        Traits::WATCHDOG_INTERVAL_MS - Traits::WATCHDOG_MONITOR_MARGIN_MS
    );
    Traits::watchdog_monitor_expired();
}

/// Get the watchdog handle, or `None` if the watchdog is disabled or
/// `os_init` hasn't configured it yet.
pub fn handle<Traits: KernelTraits>() -> Option<Watchdog<Traits>> {
    let lock = klock::lock_cpu::<Traits>().ok()?;
    Traits::state()
        .watchdog
        .read(&*lock)
        .initialized
        .then_some(Watchdog {
            _phantom: PhantomData,
        })
}

/// Tickle the watchdog if it's configured. For code that runs for a long time
/// without letting the idle task run, e.g., a flash erase.
pub fn watchdog_tickle<Traits: KernelTraits>() {
    if let Some(wd) = handle::<Traits>() {
        wd.tickle();
    }
}

/// Get the number of times the watchdog has been tickled or enabled.
pub fn tickle_count<Traits: KernelTraits>() -> u32 {
    klock::lock_cpu::<Traits>()
        .map(|lock| Traits::state().watchdog.read(&*lock).tickle_count)
        .unwrap_or(0)
}
