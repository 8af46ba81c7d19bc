//! Static kernel configuration
use core::marker::PhantomData;

use crate::sysdown::SysdownFn;

/// Build-time kernel configuration, implemented by the application on its
/// kernel trait type. Every item has a default value.
///
/// The constraints between the items are checked when `os_init` is
/// monomorphized, so a bad configuration fails the build.
pub trait KernelCfg: Sized + 'static {
    /// The OS tick frequency in Hz.
    const TICKS_PER_SEC: u32 = 128;

    /// The frequency of the cputime counter in Hz.
    const CPUTIME_FREQ: u32 = 1_000_000;

    /// The hardware watchdog expiration interval in milliseconds. `0`
    /// disables the watchdog and its software monitor.
    const WATCHDOG_INTERVAL_MS: u32 = 30_000;

    /// How much earlier than the hardware watchdog the software monitor
    /// expires, in milliseconds.
    const WATCHDOG_MONITOR_MARGIN_MS: u32 = 100;

    /// The interval at which the idle task runs sanity checks and tickles the
    /// watchdog, in milliseconds. `0` disables periodic sanity checking.
    const SANITY_INTERVAL_MS: u32 = 15_000;

    /// How long a controlled shutdown may take before
    /// [`KernelCfg::sysdown_panic`] is called, in milliseconds.
    const SYSDOWN_TIMEOUT_MS: u32 = 10_000;

    /// If `false`, `sysdown` resets the system immediately without running
    /// the shutdown callbacks.
    const SYSDOWN_ENABLED: bool = true;

    /// If `false`, `os_start` panics. Used by applications that only run the
    /// boot sequence.
    const SCHEDULING_ENABLED: bool = true;

    /// Idle periods shorter than this are not worth a tickless sleep.
    const IDLE_TICKLESS_MS_MIN: u32 = 100;

    /// The longest tickless sleep the idle task requests.
    const IDLE_TICKLESS_MS_MAX: u32 = 600_000;

    /// The priority of the main task.
    const MAIN_TASK_PRIO: u8 = 127;

    /// The priority of the idle task. This must be the lowest priority in the
    /// system.
    const IDLE_TASK_PRIO: u8 = 255;

    /// The size of the idle task's stack, in words.
    const IDLE_STACK_SIZE: usize = 64;

    /// The size of the main task's stack, in words.
    const MAIN_STACK_SIZE: usize = 1024;

    /// Board support initialization, called by `os_init` after the kernel
    /// objects are created and before the primary devices are initialized.
    fn bsp_init() {}

    /// The shutdown callbacks, invoked in order by `sysdown`.
    fn sysdown_handlers() -> &'static [SysdownFn] {
        &[]
    }

    /// Called when a shutdown doesn't complete in time.
    fn sysdown_panic() {
        panic!(
            "sysdown did not complete within {} ms",
            Self::SYSDOWN_TIMEOUT_MS
        );
    }

    /// Called when the software watchdog monitor expires, i.e., the idle task
    /// hasn't run for too long.
    fn watchdog_monitor_expired() {
        panic!("watchdog monitor expired");
    }
}

/// Compile-time checks of a [`KernelCfg`].
pub(crate) struct CfgCheck<Traits>(PhantomData<Traits>);

impl<Traits: KernelCfg> CfgCheck<Traits> {
    pub(crate) const OK: () = {
        assert!(Traits::TICKS_PER_SEC > 0, "`TICKS_PER_SEC` must be non-zero");
        assert!(Traits::CPUTIME_FREQ > 0, "`CPUTIME_FREQ` must be non-zero");
        assert!(
            Traits::MAIN_TASK_PRIO < Traits::IDLE_TASK_PRIO,
            "the idle task must have the lowest priority"
        );
        assert!(
            Traits::IDLE_TICKLESS_MS_MIN <= Traits::IDLE_TICKLESS_MS_MAX,
            "`IDLE_TICKLESS_MS_MIN` must not exceed `IDLE_TICKLESS_MS_MAX`"
        );
        assert!(
            Traits::IDLE_STACK_SIZE > 0 && Traits::MAIN_STACK_SIZE > 0,
            "task stacks must be non-empty"
        );
        if Traits::WATCHDOG_INTERVAL_MS > 0 {
            assert!(
                Traits::SANITY_INTERVAL_MS > 0,
                "the watchdog requires periodic sanity checking"
            );
            assert!(
                Traits::WATCHDOG_INTERVAL_MS >= 200
                    && Traits::SANITY_INTERVAL_MS <= Traits::WATCHDOG_INTERVAL_MS - 200,
                "`SANITY_INTERVAL_MS` must be at least 200 ms shorter than \
                 `WATCHDOG_INTERVAL_MS`"
            );
            assert!(
                Traits::WATCHDOG_MONITOR_MARGIN_MS < Traits::WATCHDOG_INTERVAL_MS,
                "`WATCHDOG_MONITOR_MARGIN_MS` must be shorter than \
                 `WATCHDOG_INTERVAL_MS`"
            );
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Defaults;
    impl KernelCfg for Defaults {}

    struct FastWatchdog;
    impl KernelCfg for FastWatchdog {
        const WATCHDOG_INTERVAL_MS: u32 = 4000;
        const SANITY_INTERVAL_MS: u32 = 3500;
    }

    #[test]
    fn default_configuration_is_valid() {
        let () = CfgCheck::<Defaults>::OK;
        let () = CfgCheck::<FastWatchdog>::OK;
        assert_eq!(Defaults::TICKS_PER_SEC, 128);
        assert_eq!(Defaults::IDLE_TASK_PRIO, u8::MAX);
    }
}
