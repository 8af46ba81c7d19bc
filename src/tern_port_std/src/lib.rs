//! Simulation environment for running the tern kernel on a hosted
//! environment.
//!
//! Each kernel task runs on its own std thread, but only one of them is
//! allowed to run at any instant (see [`ums`]). Time is virtual: it only
//! advances when the idle task asks to sleep (the tickless-idle primitive
//! jumps straight to the requested tick) or when a task calls
//! [`busy_wait_ticks`]. Interrupts are simulated on the interrupted thread
//! when CPU Lock is released.
//!
//! ```rust,ignore
//! tern_port_std::use_port!(unsafe struct SystemTraits);
//! impl tern_kernel::KernelCfg for SystemTraits {}
//!
//! fn main() {
//!     tern_port_std::run::<SystemTraits>(app_main);
//! }
//! ```
#![deny(unsafe_op_in_unsafe_fn)]
use once_cell::sync::OnceCell;
use spin::Mutex as SpinMutex;
use std::{cell::Cell, time::Instant};
use tern_kernel::{KernelTraits, PortToKernel, TaskFn, TaskId, Ticks, WatchdogInitError};

mod sched;
mod ums;

pub use self::sched::InterruptHandlerFn;

/// Used by `use_port!`
#[doc(hidden)]
pub extern crate tern_kernel;

#[doc(hidden)]
pub extern crate env_logger;

/// The longest expiration interval accepted by the simulated watchdog.
pub const SIM_WATCHDOG_MAX_EXPIRE_MS: u32 = 131_000;

/// The default limit of the simulated time. Reaching it is a test failure.
pub const DEFAULT_TIME_LIMIT_SECS: u64 = 24 * 3600;

/// Implemented on a kernel trait type by [`use_port!`].
///
/// # Safety
///
/// Only meant to be implemented by [`use_port!`].
#[doc(hidden)]
pub unsafe trait PortInstance: KernelTraits + PortToKernel {
    fn port_state() -> &'static State;
}

/// Why the simulated system stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetCause {
    /// `PortSystem::system_reset` was called.
    Software,
    /// The simulated hardware watchdog expired.
    Watchdog,
}

/// The internal state of the port.
///
/// # Safety
///
/// For the safety information of this type's methods, see the documentation of
/// the corresponding trait methods of `Port*`.
#[doc(hidden)]
pub struct State {
    thread_group: OnceCell<ums::ThreadGroup<sched::SchedState>>,
    sim: SpinMutex<Sim>,
    origin: OnceCell<Instant>,
}

/// Simulated hardware
struct Sim {
    /// Ticks delivered to the kernel so far.
    now: u64,
    time_limit_secs: u64,
    watchdog: Option<SimWatchdog>,
    /// When the watchdog was tickled, in ticks.
    tickles: Vec<u64>,
    reset: Option<ResetCause>,
}

struct SimWatchdog {
    expire_ms: u32,
    enabled: bool,
    last_tickle: u64,
}

/// The role of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadRole {
    Unknown,
    Boot,
    /// The backing thread for a task.
    Task,
}

thread_local! {
    /// The current thread's role. It's automatically assigned after the
    /// creation of a thread managed by the port.
    static THREAD_ROLE: Cell<ThreadRole> = Cell::new(ThreadRole::Unknown);
}

#[allow(clippy::missing_safety_doc)]
impl State {
    pub const fn new() -> Self {
        Self {
            thread_group: OnceCell::new(),
            sim: SpinMutex::new(Sim {
                now: 0,
                time_limit_secs: DEFAULT_TIME_LIMIT_SECS,
                watchdog: None,
                tickles: Vec::new(),
                reset: None,
            }),
            origin: OnceCell::new(),
        }
    }

    fn thread_group(&self) -> &ums::ThreadGroup<sched::SchedState> {
        self.thread_group
            .get()
            .unwrap_or_else(|| panic!("the simulated system hasn't booted"))
    }

    /// Initialize the user-mode scheduling system and run `boot` on the boot
    /// thread. `boot` is expected to call `os_init` and `os_start`.
    ///
    /// Returns when the simulated system resets, or `None` if `boot` returned
    /// or [`shutdown`] was called. A panic in any simulated thread is
    /// propagated to the caller.
    pub fn port_boot<Traits: PortInstance>(
        &'static self,
        boot: impl FnOnce() + Send + 'static,
    ) -> Option<ResetCause> {
        // Create a UMS thread group.
        let (thread_group, join_handle) = ums::ThreadGroup::new(sched::SchedState::new());
        if self.thread_group.set(thread_group).is_err() {
            panic!("the simulated system can only boot once");
        }

        // Create the initial UMS worker thread, where the boot phase of the
        // kernel runs
        let mut lock = self.thread_group().lock();
        let thread_id = lock.spawn(move |_| {
            THREAD_ROLE.with(|role| role.set(ThreadRole::Boot));

            boot();

            // `boot` didn't start the scheduler
            log::debug!("the boot function returned");
            self.thread_group().lock().shutdown();
        });
        log::trace!("startup thread = {thread_id:?}");
        lock.scheduler().running_thread = Some(thread_id);
        lock.preempt();
        drop(lock);

        // Wait until the thread group shuts down and propagate any panic
        // that occurred in a worker thread
        if let Err(e) = join_handle.join() {
            std::panic::resume_unwind(e);
        }

        self.sim.lock().reset
    }

    pub unsafe fn dispatch_first_task<Traits: PortInstance>(&'static self) -> ! {
        log::trace!("dispatch_first_task");
        assert_eq!(expect_worker_thread(), ThreadRole::Boot);
        assert!(self.is_cpu_lock_active::<Traits>());

        // Safety: CPU Lock active
        let next = unsafe { choose_task::<Traits>() };

        let mut lock = self.thread_group().lock();
        // Tasks start with CPU Lock inactive
        lock.scheduler().cpu_lock = false;
        self.switch_to::<Traits>(&mut lock, next);
        drop(lock);

        // The requirement of `dispatch_first_task` explicitly allows
        // discarding the context.
        ums::exit_thread();
    }

    /// Make `next` the thread to run. The caller yields the processor
    /// afterwards.
    fn switch_to<Traits: PortInstance>(
        &'static self,
        lock: &mut ums::ThreadGroupLockGuard<'_, sched::SchedState>,
        next: Option<(TaskId, TaskFn, usize)>,
    ) {
        let Some((task, entry, arg)) = next else {
            log::trace!("no task to run");
            lock.scheduler().running_thread = None;
            return;
        };

        let thread_id = match lock.scheduler().task_thread(task) {
            Some(thread_id) => thread_id,
            None => {
                // Spawn a UMS worker thread for this task
                let thread_id = lock.spawn(move |_| {
                    THREAD_ROLE.with(|role| role.set(ThreadRole::Task));
                    log::debug!("{task:?} is now running");

                    entry(arg);

                    tern_kernel::task::task_returned(task);
                });
                log::trace!("spawned thread {thread_id:?} for {task:?}");
                lock.scheduler().set_task_thread(task, thread_id);
                thread_id
            }
        };

        log::trace!("dispatching {task:?} on {thread_id:?}");
        lock.scheduler().running_thread = Some(thread_id);
    }

    /// Choose the running task and switch to its thread.
    ///
    /// Precondition: CPU Lock inactive, not in an interrupt handler
    fn dispatch<Traits: PortInstance>(&'static self) {
        assert_eq!(expect_worker_thread(), ThreadRole::Task);

        // Safety: CPU Lock inactive
        unsafe { self.enter_cpu_lock::<Traits>() };
        // Safety: CPU Lock active
        let next = unsafe { choose_task::<Traits>() };

        let mut lock = self.thread_group().lock();
        lock.scheduler().cpu_lock = false;
        lock.scheduler().dispatch_pending = false;
        self.switch_to::<Traits>(&mut lock, next);
        drop(lock);

        // Block this thread until scheduled to run. This might end
        // immediately if the current task was chosen again.
        self.thread_group().yield_now();
    }

    /// Handle pending interrupts and a deferred dispatch.
    fn process_pending<Traits: PortInstance>(&'static self) {
        loop {
            let mut lock = self.thread_group().lock();
            if lock.is_shutting_down() {
                return;
            }

            if let Some(interrupt) = lock.scheduler().take_interrupt() {
                lock.scheduler().in_interrupt = true;
                drop(lock);

                self.handle_interrupt::<Traits>(interrupt);

                self.thread_group().lock().scheduler().in_interrupt = false;
                continue;
            }

            let sched = lock.scheduler();
            let can_dispatch = sched.dispatch_pending
                && !sched.cpu_lock
                && !sched.in_interrupt
                && THREAD_ROLE.with(|role| role.get()) == ThreadRole::Task;
            drop(lock);

            if !can_dispatch {
                return;
            }

            self.dispatch::<Traits>();
        }
    }

    fn handle_interrupt<Traits: PortInstance>(&'static self, interrupt: sched::Interrupt) {
        match interrupt {
            sched::Interrupt::Timer(ticks) => {
                log::trace!("timer interrupt ({ticks} tick(s))");
                self.advance_sim_time::<Traits>(ticks);

                // Safety: CPU Lock inactive, an interrupt context
                unsafe { <Traits as PortToKernel>::timer_tick(ticks) };

                if self.watchdog_expired::<Traits>() {
                    log::warn!("the simulated watchdog expired");
                    self.reset::<Traits>(ResetCause::Watchdog);
                }
            }
            sched::Interrupt::External(handler) => {
                log::trace!("external interrupt");
                handler();
            }
        }
    }

    fn advance_sim_time<Traits: PortInstance>(&self, ticks: Ticks) {
        let mut sim = self.sim.lock();
        sim.now += u64::from(ticks);
        let limit = sim.time_limit_secs * u64::from(Traits::TICKS_PER_SEC);
        if sim.now > limit {
            let secs = sim.time_limit_secs;
            drop(sim);
            panic!("the simulated time exceeded the limit of {secs} seconds");
        }
    }

    fn watchdog_expired<Traits: PortInstance>(&self) -> bool {
        let sim = self.sim.lock();
        let tps = u64::from(Traits::TICKS_PER_SEC);
        match &sim.watchdog {
            Some(wd) if wd.enabled => {
                (sim.now - wd.last_tickle) * 1000 > u64::from(wd.expire_ms) * tps
            }
            _ => false,
        }
    }

    fn reset<Traits: PortInstance>(&'static self, cause: ResetCause) -> ! {
        log::info!("system reset ({cause:?}) at tick {}", self.sim.lock().now);
        self.sim.lock().reset.get_or_insert(cause);
        self.thread_group().lock().shutdown();
        ums::exit_thread();
    }

    pub unsafe fn yield_cpu<Traits: PortInstance>(&'static self) {
        log::trace!("yield_cpu");
        expect_worker_thread();
        assert!(!self.is_cpu_lock_active::<Traits>());

        {
            let mut lock = self.thread_group().lock();
            if lock.scheduler().in_interrupt {
                // Deferred until the interrupt handler returns
                lock.scheduler().dispatch_pending = true;
                return;
            }
        }

        self.dispatch::<Traits>();
        self.process_pending::<Traits>();
    }

    pub unsafe fn enter_cpu_lock<Traits: PortInstance>(&self) {
        log::trace!("enter_cpu_lock");
        expect_worker_thread();

        let mut lock = self.thread_group().lock();
        assert!(!lock.scheduler().cpu_lock);
        lock.scheduler().cpu_lock = true;
    }

    pub unsafe fn leave_cpu_lock<Traits: PortInstance>(&'static self) {
        log::trace!("leave_cpu_lock");
        expect_worker_thread();

        let mut lock = self.thread_group().lock();
        if lock.is_shutting_down() {
            // Unwinding a terminated thread
            lock.scheduler().cpu_lock = false;
            return;
        }
        assert!(lock.scheduler().cpu_lock);
        lock.scheduler().cpu_lock = false;
        drop(lock);

        self.process_pending::<Traits>();
    }

    pub unsafe fn initialize_task_state<Traits: PortInstance>(&self, task: TaskId) {
        log::trace!("initialize_task_state {task:?}");
        expect_worker_thread();
        assert!(self.is_cpu_lock_active::<Traits>());

        self.thread_group().lock().scheduler().initialize_task(task);
    }

    pub fn is_cpu_lock_active<Traits: PortInstance>(&self) -> bool {
        expect_worker_thread();

        self.thread_group().lock().scheduler().cpu_lock
    }

    pub fn is_task_context<Traits: PortInstance>(&self) -> bool {
        let role = expect_worker_thread();
        role == ThreadRole::Task && !self.thread_group().lock().scheduler().in_interrupt
    }

    pub fn cputime_get32<Traits: PortInstance>(&self) -> u32 {
        let origin = *self.origin.get_or_init(Instant::now);
        let nanos = origin.elapsed().as_nanos();
        // Truncation models the counter wrapping around
        (nanos * u128::from(Traits::CPUTIME_FREQ) / 1_000_000_000) as u32
    }

    pub unsafe fn tick_idle<Traits: PortInstance>(&self, ticks: Ticks) {
        expect_worker_thread();
        assert!(self.is_cpu_lock_active::<Traits>());

        // Nothing can happen until the requested tick, so skip to it. `0`
        // means the kernel is waiting for the next tick.
        let ticks = ticks.max(1);
        log::trace!("tick_idle({ticks})");
        self.thread_group().lock().scheduler().pend_ticks(ticks);
    }

    pub unsafe fn watchdog_init<Traits: PortInstance>(
        &self,
        expire_ms: u32,
    ) -> Result<(), WatchdogInitError> {
        log::trace!("watchdog_init({expire_ms})");
        if expire_ms == 0 || expire_ms > SIM_WATCHDOG_MAX_EXPIRE_MS {
            return Err(WatchdogInitError::BadParam);
        }

        self.sim.lock().watchdog = Some(SimWatchdog {
            expire_ms,
            enabled: false,
            last_tickle: 0,
        });
        Ok(())
    }

    pub unsafe fn watchdog_enable<Traits: PortInstance>(&self) {
        log::trace!("watchdog_enable");
        let mut sim = self.sim.lock();
        let now = sim.now;
        let wd = sim
            .watchdog
            .as_mut()
            .unwrap_or_else(|| panic!("`watchdog_enable` called before `watchdog_init`"));
        wd.enabled = true;
        wd.last_tickle = now;
    }

    pub unsafe fn watchdog_tickle<Traits: PortInstance>(&self) {
        let mut sim = self.sim.lock();
        let now = sim.now;
        if let Some(wd) = &mut sim.watchdog {
            log::trace!("watchdog_tickle at tick {now}");
            wd.last_tickle = now;
            sim.tickles.push(now);
        }
    }

    pub unsafe fn system_reset<Traits: PortInstance>(&'static self) -> ! {
        expect_worker_thread();
        self.reset::<Traits>(ResetCause::Software)
    }
}

/// Choose the next task and get its entry point.
///
/// # Safety
///
/// CPU Lock active
unsafe fn choose_task<Traits: PortInstance>() -> Option<(TaskId, TaskFn, usize)> {
    // Safety: CPU Lock active
    unsafe {
        Traits::choose_running_task();
        Traits::running_task().map(|task| {
            let (entry, arg) = Traits::task_entry(task);
            (task, entry, arg)
        })
    }
}

/// Assert that the current thread is a worker thread of `Traits`.
fn expect_worker_thread() -> ThreadRole {
    let role = THREAD_ROLE.with(|r| r.get());
    assert_ne!(role, ThreadRole::Unknown, "not a simulated thread");
    role
}

/// Boot the simulated system. See [`State::port_boot`].
pub fn boot<Traits: PortInstance>(boot: impl FnOnce() + Send + 'static) -> Option<ResetCause> {
    Traits::port_state().port_boot::<Traits>(boot)
}

/// Initialize the logger and run the kernel with `main_fn` as the main task.
/// Returns when the simulated system resets or shuts down.
pub fn run<Traits: PortInstance>(main_fn: TaskFn) -> Option<ResetCause> {
    let _ = env_logger::try_init();

    boot::<Traits>(move || {
        tern_kernel::os::os_init::<Traits>(Some(main_fn));
        tern_kernel::os::os_start::<Traits>();
    })
}

/// End the simulation without a reset. Must be called from a task.
pub fn shutdown<Traits: PortInstance>() -> ! {
    expect_worker_thread();
    log::debug!("shutdown requested");
    let state = Traits::port_state();
    state.thread_group().lock().shutdown();
    ums::exit_thread();
}

/// Raise a simulated external interrupt. `handler` runs in an interrupt
/// context as soon as CPU Lock is inactive; if that's the case already, it
/// runs before this function returns.
pub fn pend_interrupt<Traits: PortInstance>(handler: InterruptHandlerFn) {
    expect_worker_thread();
    log::trace!("pend_interrupt");
    let state = Traits::port_state();
    state.thread_group().lock().scheduler().pend_irq(handler);
    state.process_pending::<Traits>();
}

/// Simulate the current task running for `ticks` ticks without blocking.
/// The timer interrupts that arrive meanwhile are delivered, which may
/// preempt the task.
pub fn busy_wait_ticks<Traits: PortInstance>(ticks: Ticks) {
    assert_eq!(expect_worker_thread(), ThreadRole::Task);
    let state = Traits::port_state();
    state.thread_group().lock().scheduler().pend_ticks(ticks);
    state.process_pending::<Traits>();
}

/// Get the number of ticks the simulated timer has delivered.
pub fn sim_ticks<Traits: PortInstance>() -> u64 {
    Traits::port_state().sim.lock().now
}

/// Get when the simulated watchdog was tickled, in ticks.
pub fn watchdog_tickles<Traits: PortInstance>() -> Vec<u64> {
    Traits::port_state().sim.lock().tickles.clone()
}

/// Set the limit of the simulated time. Must be called before [`boot`].
pub fn set_time_limit_secs<Traits: PortInstance>(secs: u64) {
    Traits::port_state().sim.lock().time_limit_secs = secs;
}

#[macro_export]
macro_rules! use_port {
    (unsafe $vis:vis struct $Traits:ident) => {
        $vis struct $Traits;

        mod port_std_impl {
            use super::$Traits;
            use $crate::tern_kernel::{
                PortIdle, PortSystem, PortThreading, PortTimer, PortWatchdog, TaskId, Ticks,
                WatchdogInitError,
            };
            use $crate::{PortInstance, State};

            pub(super) static PORT_STATE: State = State::new();

            unsafe impl PortInstance for $Traits {
                #[inline]
                fn port_state() -> &'static State {
                    &PORT_STATE
                }
            }

            // Assume `$Traits: KernelTraits`
            unsafe impl PortThreading for $Traits {
                unsafe fn dispatch_first_task() -> ! {
                    unsafe { PORT_STATE.dispatch_first_task::<Self>() }
                }

                unsafe fn yield_cpu() {
                    unsafe { PORT_STATE.yield_cpu::<Self>() }
                }

                unsafe fn enter_cpu_lock() {
                    unsafe { PORT_STATE.enter_cpu_lock::<Self>() }
                }

                unsafe fn leave_cpu_lock() {
                    unsafe { PORT_STATE.leave_cpu_lock::<Self>() }
                }

                unsafe fn initialize_task_state(task: TaskId) {
                    unsafe { PORT_STATE.initialize_task_state::<Self>(task) }
                }

                fn is_cpu_lock_active() -> bool {
                    PORT_STATE.is_cpu_lock_active::<Self>()
                }

                fn is_task_context() -> bool {
                    PORT_STATE.is_task_context::<Self>()
                }
            }

            unsafe impl PortTimer for $Traits {
                unsafe fn cputime_get32() -> u32 {
                    PORT_STATE.cputime_get32::<Self>()
                }
            }

            unsafe impl PortIdle for $Traits {
                unsafe fn tick_idle(ticks: Ticks) {
                    unsafe { PORT_STATE.tick_idle::<Self>(ticks) }
                }
            }

            unsafe impl PortWatchdog for $Traits {
                unsafe fn watchdog_init(expire_ms: u32) -> Result<(), WatchdogInitError> {
                    unsafe { PORT_STATE.watchdog_init::<Self>(expire_ms) }
                }

                unsafe fn watchdog_enable() {
                    unsafe { PORT_STATE.watchdog_enable::<Self>() }
                }

                unsafe fn watchdog_tickle() {
                    unsafe { PORT_STATE.watchdog_tickle::<Self>() }
                }
            }

            unsafe impl PortSystem for $Traits {
                unsafe fn system_reset() -> ! {
                    unsafe { PORT_STATE.system_reset::<Self>() }
                }
            }
        }

        $crate::tern_kernel::build!($Traits);
    };
}
