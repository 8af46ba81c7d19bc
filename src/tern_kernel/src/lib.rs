//! A tickless, priority-preemptive RTOS kernel core.
//!
//! The kernel is instantiated on a *kernel trait type* that implements the
//! port traits ([`PortThreading`], [`PortTimer`], [`PortIdle`],
//! [`PortWatchdog`], [`PortSystem`]), the configuration trait [`KernelCfg`],
//! and [`KernelStatic`] (generated by [`build!`]). Every kernel operation is
//! a free function generic over that type, e.g.,
//! `callout::callout_reset::<SystemTraits>(co, 10)`.
//!
//! # Contexts
//!
//! - A **task context** is a thread of execution owned by a task.
//! - An **interrupt context** is where the port delivers ticks. Only
//!   non-blocking operations (e.g., [`eventq::eventq_put`]) are allowed.
//! - **CPU Lock** is the kernel's critical section. Most kernel operations
//!   fail with `BadContext` when called with CPU Lock active.
//!
//! # Lifecycle
//!
//! The application calls [`os::os_init`] once, registers tasks, devices, and
//! callouts, then calls [`os::os_start`], which never returns.
#![cfg_attr(not(test), no_std)] // Link `std` only when building a test (`cfg(test)`)
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(rust_2018_idioms)]
use core::{
    mem::forget,
    sync::atomic::{AtomicBool, AtomicU32},
};

#[macro_use]
#[doc(hidden)]
pub mod utils;

#[macro_use]
mod error;

#[cfg(test)]
#[macro_use]
mod test_port;

mod cfg;
mod klock;
mod state;
mod wait;

pub mod callout;
pub mod cputime;
pub mod dev;
pub mod eventq;
pub mod idle;
pub mod os;
pub mod sanity;
pub mod sysdown;
pub mod task;
pub mod time;
pub mod watchdog;

pub use self::{
    cfg::*,
    error::*,
    task::{StackWord, StaticStack, TaskFn, TaskId},
    time::{Ticks, TIMEOUT_NEVER},
};

use self::{klock::CpuLockCell, utils::Init};

/// The maximum number of tasks, including the idle and main tasks.
pub const MAX_TASKS: usize = 32;
/// The maximum number of events, including those owned by callouts.
pub const MAX_EVENTS: usize = 96;
/// The maximum number of event queues.
pub const MAX_EVENT_QUEUES: usize = 16;
/// The maximum number of callouts, including the kernel's own timers.
pub const MAX_CALLOUTS: usize = 48;
/// The maximum number of sanity checks, including per-task checks.
pub const MAX_SANITY_CHECKS: usize = 48;
/// The maximum number of devices.
pub const MAX_DEVICES: usize = 32;

/// Represents a kernel trait type having sufficient trait `impl`s to
/// instantiate the kernel.
pub trait KernelTraits: Port + KernelCfg + KernelStatic + 'static {}
impl<T: Port + KernelCfg + KernelStatic + 'static> KernelTraits for T {}

/// Implemented by a port. This is a union of all port traits.
pub trait Port: PortThreading + PortTimer + PortIdle + PortWatchdog + PortSystem {}
impl<T: PortThreading + PortTimer + PortIdle + PortWatchdog + PortSystem> Port for T {}

/// Implemented by a port to provide context switching and the critical
/// section.
///
/// # Safety
///
/// Implementing a port is inherently unsafe because it's responsible for
/// initializing the execution environment and providing a dispatcher
/// implementation.
///
/// These methods are only meant to be called by the kernel.
pub unsafe trait PortThreading: Sized + 'static {
    /// Transfer the control to the task chosen by
    /// [`PortToKernel::choose_running_task`], discarding the current (boot)
    /// context.
    ///
    /// Precondition: CPU Lock active, boot phase
    unsafe fn dispatch_first_task() -> !;

    /// Yield the processor.
    ///
    /// In a task context, this method immediately transfers the control to
    /// a dispatcher, which calls [`PortToKernel::choose_running_task`]. In an
    /// interrupt context, the effect is deferred until the interrupt handler
    /// returns.
    ///
    /// Precondition: CPU Lock inactive
    unsafe fn yield_cpu();

    /// Disable all kernel-managed interrupts (this state is called *CPU Lock*).
    ///
    /// Precondition: CPU Lock inactive
    unsafe fn enter_cpu_lock();

    /// Re-enable kernel-managed interrupts previously disabled by
    /// `enter_cpu_lock`, thus deactivating the CPU Lock state.
    ///
    /// Precondition: CPU Lock active
    unsafe fn leave_cpu_lock();

    /// Prepare the task for execution, ensuring it will start execution from
    /// its entry point (see [`PortToKernel::task_entry`]) next time it
    /// receives the control.
    ///
    /// Precondition: CPU Lock active
    unsafe fn initialize_task_state(task: TaskId);

    /// Return a flag indicating whether a CPU Lock state is active.
    fn is_cpu_lock_active() -> bool;

    /// Return a flag indicating whether the current context is a task
    /// context.
    fn is_task_context() -> bool;
}

/// Implemented by a port to provide the free-running cputime counter.
///
/// # Safety
///
/// These methods are only meant to be called by the kernel.
pub unsafe trait PortTimer {
    /// Read the cputime counter. It runs at [`KernelCfg::CPUTIME_FREQ`] and
    /// wraps around at `u32::MAX`.
    unsafe fn cputime_get32() -> u32;
}

/// Implemented by a port to provide the tickless sleep primitive.
///
/// # Safety
///
/// These methods are only meant to be called by the kernel.
pub unsafe trait PortIdle {
    /// Put the processor into a low-power state for at most `ticks` ticks.
    /// `ticks == 0` means the kernel has something to do soon and the port
    /// should only wait for the next tick interrupt.
    ///
    /// The port must eventually report the elapsed time by calling
    /// [`PortToKernel::timer_tick`]. It may return early if woken by another
    /// interrupt.
    ///
    /// Precondition: CPU Lock active, called by the idle task
    unsafe fn tick_idle(ticks: Ticks);
}

/// Implemented by a port to drive the hardware watchdog.
///
/// # Safety
///
/// These methods are only meant to be called by the kernel.
pub unsafe trait PortWatchdog {
    /// Configure the hardware watchdog to expire `expire_ms` milliseconds
    /// after the last tickle. Fails with `BadParam` if the hardware can't
    /// represent the interval.
    unsafe fn watchdog_init(expire_ms: u32) -> Result<(), WatchdogInitError>;

    /// Arm the hardware watchdog.
    unsafe fn watchdog_enable();

    /// Restart the hardware watchdog countdown.
    unsafe fn watchdog_tickle();
}

/// Implemented by a port to provide architecture bring-up and the hardware
/// reset.
///
/// # Safety
///
/// These methods are only meant to be called by the kernel.
pub unsafe trait PortSystem {
    /// Architecture-specific initialization, called once by `os_init`.
    unsafe fn arch_os_init() -> Result<(), ResultCode> {
        Ok(())
    }

    /// Reset the system immediately.
    unsafe fn system_reset() -> !;
}

/// Methods intended to be called by a port.
///
/// # Safety
///
/// These are only meant to be called by the port.
pub trait PortToKernel {
    /// Determine the next task to run and store it as the running task.
    ///
    /// Precondition: CPU Lock active / Postcondition: CPU Lock active
    unsafe fn choose_running_task();

    /// Get the task chosen by the last call to `choose_running_task`.
    ///
    /// Precondition: CPU Lock active
    unsafe fn running_task() -> Option<TaskId>;

    /// Get the entry point and the parameter of the specified task.
    ///
    /// Precondition: CPU Lock active
    unsafe fn task_entry(task: TaskId) -> (TaskFn, usize);

    /// Report that `ticks` ticks have elapsed.
    ///
    /// Precondition: CPU Lock inactive, an interrupt context
    unsafe fn timer_tick(ticks: Ticks);
}

impl<Traits: KernelTraits> PortToKernel for Traits {
    unsafe fn choose_running_task() {
        // Safety: The precondition of this method includes CPU Lock being
        // active
        let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };

        task::choose_next_running_task::<Traits>(lock.borrow_mut());

        // Post-condition: CPU Lock active
        forget(lock);
    }

    unsafe fn running_task() -> Option<TaskId> {
        // Safety: The precondition of this method includes CPU Lock being
        // active
        let lock = unsafe { klock::assume_cpu_lock::<Traits>() };
        let running = Traits::state().sched.read(&*lock).running;
        forget(lock);
        running
    }

    unsafe fn task_entry(task: TaskId) -> (TaskFn, usize) {
        // Safety: The precondition of this method includes CPU Lock being
        // active
        let lock = unsafe { klock::assume_cpu_lock::<Traits>() };
        let cb = &Traits::state().sched.read(&*lock).tasks[task];
        let entry = (cb.entry, cb.arg);
        forget(lock);
        entry
    }

    #[inline]
    unsafe fn timer_tick(ticks: Ticks) {
        time::handle_tick::<Traits>(ticks);
    }
}

/// Associates a kernel trait type with kernel-private data. Use [`build!`] to
/// implement.
///
/// # Safety
///
/// This is only intended to be implemented by `build!`.
pub unsafe trait KernelStatic: Sized + 'static {
    /// Access the kernel's global state.
    fn state() -> &'static State<Self>;

    /// Take the idle task's stack. Returns `Some(_)` only once.
    fn idle_stack() -> Option<&'static mut [StackWord]>;

    /// Take the main task's stack. Returns `Some(_)` only once.
    fn main_stack() -> Option<&'static mut [StackWord]>;
}

/// Global kernel state.
pub struct State<Traits> {
    /// Set by `os_start`.
    pub(crate) started: AtomicBool,

    /// The OS tick counter. Written only with CPU Lock active, read anywhere.
    pub(crate) tick: AtomicU32,

    pub(crate) time: CpuLockCell<Traits, time::TimeState>,
    pub(crate) sched: CpuLockCell<Traits, task::SchedState>,
    pub(crate) eventq: CpuLockCell<Traits, eventq::EventqState>,
    pub(crate) callout: CpuLockCell<Traits, callout::CalloutState>,
    pub(crate) sanity: CpuLockCell<Traits, sanity::SanityState>,
    pub(crate) dev: CpuLockCell<Traits, dev::DevState>,
    pub(crate) idle: CpuLockCell<Traits, idle::IdleState>,
    pub(crate) watchdog: CpuLockCell<Traits, watchdog::WatchdogState>,
    pub(crate) sysdown: CpuLockCell<Traits, sysdown::SysdownState>,
}

impl<Traits> Init for State<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        started: AtomicBool::new(false),
        tick: AtomicU32::new(0),
        time: Init::INIT,
        sched: Init::INIT,
        eventq: Init::INIT,
        callout: Init::INIT,
        sanity: Init::INIT,
        dev: Init::INIT,
        idle: Init::INIT,
        watchdog: Init::INIT,
        sysdown: Init::INIT,
    };
}

/// Instantiate the kernel state for a kernel trait type, implementing
/// [`KernelStatic`].
///
/// ```rust,ignore
/// struct SystemTraits;
/// // ... port and `KernelCfg` impls ...
/// tern_kernel::build!(SystemTraits);
/// ```
#[macro_export]
macro_rules! build {
    ($Traits:ty) => {
        const _: () = {
            use $crate::{utils::Init, KernelCfg, KernelStatic, StackWord, StaticStack, State};

            static KERNEL_STATE: State<$Traits> = Init::INIT;
            static IDLE_STACK: StaticStack<{ <$Traits as KernelCfg>::IDLE_STACK_SIZE }> =
                StaticStack::new();
            static MAIN_STACK: StaticStack<{ <$Traits as KernelCfg>::MAIN_STACK_SIZE }> =
                StaticStack::new();

            unsafe impl KernelStatic for $Traits {
                #[inline(always)]
                fn state() -> &'static State<Self> {
                    &KERNEL_STATE
                }

                fn idle_stack() -> Option<&'static mut [StackWord]> {
                    IDLE_STACK.take()
                }

                fn main_stack() -> Option<&'static mut [StackWord]> {
                    MAIN_STACK.take()
                }
            }
        };
    };
}
