//! A port for unit tests. It has no tasks or interrupts: CPU Lock is a
//! spinlock shared by the test threads, `yield_cpu` only runs the scheduler,
//! and time advances only when a test calls `timer_tick`.
use std::sync::atomic::Ordering;

/// Instantiate a kernel on a test port.
macro_rules! test_port {
    ($vis:vis struct $Traits:ident) => {
        $vis struct $Traits;

        const _: () = {
            use std::{cell::Cell, sync::atomic::{AtomicBool, AtomicU32, Ordering}};
            use $crate::{
                PortIdle, PortSystem, PortThreading, PortTimer, PortToKernel, PortWatchdog,
                TaskId, Ticks, WatchdogInitError,
            };

            static CPU_LOCK: AtomicBool = AtomicBool::new(false);
            static CPUTIME: AtomicU32 = AtomicU32::new(0);

            std::thread_local! {
                static HOLDING_CPU_LOCK: Cell<bool> = Cell::new(false);
            }

            unsafe impl PortThreading for $Traits {
                unsafe fn dispatch_first_task() -> ! {
                    panic!("the test port can't run tasks");
                }

                unsafe fn yield_cpu() {
                    unsafe {
                        Self::enter_cpu_lock();
                        <Self as PortToKernel>::choose_running_task();
                        Self::leave_cpu_lock();
                    }
                }

                unsafe fn enter_cpu_lock() {
                    assert!(!Self::is_cpu_lock_active());
                    while CPU_LOCK
                        .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                        .is_err()
                    {
                        std::thread::yield_now();
                    }
                    HOLDING_CPU_LOCK.with(|x| x.set(true));
                }

                unsafe fn leave_cpu_lock() {
                    assert!(Self::is_cpu_lock_active());
                    HOLDING_CPU_LOCK.with(|x| x.set(false));
                    CPU_LOCK.store(false, Ordering::Release);
                }

                unsafe fn initialize_task_state(_task: TaskId) {}

                fn is_cpu_lock_active() -> bool {
                    HOLDING_CPU_LOCK.with(|x| x.get())
                }

                fn is_task_context() -> bool {
                    false
                }
            }

            unsafe impl PortTimer for $Traits {
                unsafe fn cputime_get32() -> u32 {
                    CPUTIME.fetch_add(1, Ordering::Relaxed)
                }
            }

            unsafe impl PortIdle for $Traits {
                unsafe fn tick_idle(_ticks: Ticks) {}
            }

            unsafe impl PortWatchdog for $Traits {
                unsafe fn watchdog_init(_expire_ms: u32) -> Result<(), WatchdogInitError> {
                    Ok(())
                }

                unsafe fn watchdog_enable() {}

                unsafe fn watchdog_tickle() {}
            }

            unsafe impl PortSystem for $Traits {
                unsafe fn system_reset() -> ! {
                    panic!("system reset");
                }
            }
        };

        $crate::build!($Traits);
    };
}

/// Pretend `os_start` was called, so that ticks fire callouts.
pub(crate) fn mark_started<Traits: crate::KernelTraits>() {
    Traits::state().started.store(true, Ordering::Release);
}

/// Advance the tick counter as the timer interrupt would.
pub(crate) fn tick<Traits: crate::KernelTraits>(ticks: crate::Ticks) {
    // Safety: CPU Lock inactive
    unsafe { <Traits as crate::PortToKernel>::timer_tick(ticks) };
}
