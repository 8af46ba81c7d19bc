//! System bring-up
//!
//! A port's boot code calls [`os_init`] once, then [`os_start`]. `os_init`
//! creates the kernel's own objects (the default event queue, the idle and
//! main tasks, the watchdog monitor, and the shutdown timer) and initializes
//! the registered devices in stage order. `os_start` hands the processor
//! to the scheduler and never returns.
use core::{mem::forget, sync::atomic::Ordering};

use crate::{
    cfg::CfgCheck,
    dev::{self, DevInitStage},
    eventq, idle, klock, state,
    sysdown::{self, RebootReason},
    task::{self, TaskFn},
    watchdog::{self, Watchdog},
    KernelTraits, SysdownError, TIMEOUT_NEVER,
};

/// Initialize the kernel. `main_fn`, if given, becomes the body of the main
/// task.
///
/// Panics if a kernel object can't be created or a device fails to
/// initialize. There's nothing else to do this early in the boot.
///
/// Precondition: the boot context, CPU Lock inactive, called only once
pub fn os_init<Traits: KernelTraits>(main_fn: Option<TaskFn>) {
    let () = CfgCheck::<Traits>::OK;

    assert!(
        !state::is_started::<Traits>(),
        "`os_init` called after `os_start`"
    );

    log::debug!(
        "os_init: {} ticks/s, cputime at {} Hz",
        Traits::TICKS_PER_SEC,
        Traits::CPUTIME_FREQ
    );

    let dflt = eventq::eventq_init::<Traits>()
        .unwrap_or_else(|e| panic!("failed to create the default event queue: {e:?}"));
    {
        let mut lock = klock::lock_cpu::<Traits>()
            .unwrap_or_else(|_| panic!("`os_init` called with CPU Lock active"));
        eventq::set_eventq_dflt(lock.borrow_mut(), dflt);
    }

    // Safety: Only the kernel calls this, once
    if let Err(e) = unsafe { Traits::arch_os_init() } {
        panic!("architecture initialization failed: {e:?}");
    }

    init_devices::<Traits>(DevInitStage::Kernel);

    if Traits::WATCHDOG_INTERVAL_MS > 0 {
        if let Err(e) = Watchdog::<Traits>::init() {
            panic!(
                "failed to configure the watchdog for {} ms: {e:?}",
                Traits::WATCHDOG_INTERVAL_MS
            );
        }
    }

    idle::init_idle_task::<Traits>();

    if let Some(main_fn) = main_fn {
        let stack = Traits::main_stack()
            .unwrap_or_else(|| panic!("the main task was already created"));
        task::task_init::<Traits>(
            "main",
            main_fn,
            0,
            Traits::MAIN_TASK_PRIO,
            TIMEOUT_NEVER,
            stack,
        )
        .unwrap_or_else(|e| panic!("failed to create the main task: {e:?}"));
    }

    sysdown::init_timer::<Traits>();

    Traits::bsp_init();

    init_devices::<Traits>(DevInitStage::Primary);
    init_devices::<Traits>(DevInitStage::Secondary);

    log::debug!("os_init complete");
}

fn init_devices<Traits: KernelTraits>(stage: DevInitStage) {
    if let Err(e) = dev::dev_initialize_all::<Traits>(stage) {
        panic!("{stage:?} device initialization failed: {e:?}");
    }
}

/// Start the scheduler. Arms the watchdog and transfers the control to the
/// highest-priority ready task.
///
/// Precondition: the boot context, CPU Lock inactive, after [`os_init`]
pub fn os_start<Traits: KernelTraits>() -> ! {
    assert!(
        Traits::SCHEDULING_ENABLED,
        "`os_start` called with scheduling disabled"
    );
    assert!(
        !state::is_started::<Traits>(),
        "`os_start` called twice"
    );

    if let Some(wd) = watchdog::handle::<Traits>() {
        wd.enable();
    }

    let lock = klock::lock_cpu::<Traits>()
        .unwrap_or_else(|_| panic!("`os_start` called with CPU Lock active"));

    log::info!("starting the scheduler");
    Traits::state().started.store(true, Ordering::Release);

    // `dispatch_first_task` expects CPU Lock active
    forget(lock);

    // Safety: CPU Lock active, boot phase
    unsafe { Traits::dispatch_first_task() }
}

/// Get a flag indicating whether [`os_start`] has been called.
pub fn os_started<Traits: KernelTraits>() -> bool {
    state::is_started::<Traits>()
}

/// Request a controlled reboot. See [`sysdown::sysdown`].
pub fn os_reboot<Traits: KernelTraits>(reason: RebootReason) -> Result<(), SysdownError> {
    sysdown::sysdown::<Traits>(reason)
}

/// Reset the system immediately, skipping the shutdown callbacks.
pub fn os_system_reset<Traits: KernelTraits>() -> ! {
    log::warn!("immediate system reset");

    // Safety: Only the kernel calls these
    unsafe {
        Traits::watchdog_tickle();
        Traits::system_reset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dev::{DevId, DevStatus},
        task::TaskSt,
        test_port::*,
    };
    use std::sync::Mutex;

    static LOG: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

    fn record(dev: DevId, _: usize) -> Result<(), DevStatus> {
        let name = dev::dev_name::<Traits>(dev).unwrap();
        LOG.lock().unwrap().push(name);
        Ok(())
    }

    fn main_body(_: usize) {}

    test_port!(struct Traits);
    impl crate::KernelCfg for Traits {
        fn bsp_init() {
            LOG.lock().unwrap().push("bsp");
        }
    }

    #[test]
    fn init_sequence() {
        dev::dev_create::<Traits>("flash", DevInitStage::Secondary, 0, record, 0).unwrap();
        dev::dev_create::<Traits>("uart", DevInitStage::Primary, 0, record, 0).unwrap();
        dev::dev_create::<Traits>("clock", DevInitStage::Kernel, 0, record, 0).unwrap();

        os_init::<Traits>(Some(main_body));

        assert_eq!(*LOG.lock().unwrap(), ["clock", "bsp", "uart", "flash"]);
        assert!(eventq::eventq_dflt::<Traits>().is_some());
        assert!(watchdog::handle::<Traits>().is_some());
        assert!(!os_started::<Traits>());

        let idle = task::task_lookup::<Traits>("idle").unwrap().unwrap();
        let main = task::task_lookup::<Traits>("main").unwrap().unwrap();
        let idle_info = task::task_info::<Traits>(idle).unwrap();
        let main_info = task::task_info::<Traits>(main).unwrap();
        assert_eq!(idle_info.prio, 255);
        assert_eq!(main_info.prio, 127);
        assert_eq!(main_info.state, TaskSt::Ready);
        assert_eq!(main_info.sanity_check, None);
    }

    #[test]
    #[should_panic(expected = "scheduling disabled")]
    fn start_without_scheduling() {
        test_port!(struct NoSched);
        impl crate::KernelCfg for NoSched {
            const SCHEDULING_ENABLED: bool = false;
        }

        os_start::<NoSched>();
    }
}
