//! The idle task
//!
//! The idle task runs at the lowest priority. It periodically runs the
//! sanity checks and tickles the watchdog, then asks the port to sleep until
//! the next scheduled activity (tickless idle).
use crate::{
    callout,
    klock,
    sanity,
    task::{self, TaskId},
    time::{self, tick_geq, tick_leq, Ticks, TIMEOUT_NEVER},
    utils::Init,
    watchdog, KernelCfg, KernelTraits,
};

pub(crate) struct IdleState {
    /// The number of idle loop iterations.
    counter: u32,
    /// When the sanity checks last ran.
    sanity_last: Ticks,
}

impl Init for IdleState {
    const INIT: Self = Self {
        counter: 0,
        sanity_last: 0,
    };
}

/// The sanity interval in ticks, `0` if disabled.
fn sanity_itvl<Traits: KernelCfg>() -> Ticks {
    time::interval_ticks::<Traits>(Traits::SANITY_INTERVAL_MS) as Ticks
}

/// Get the number of ticks until the next sanity pass is due, clamped to be
/// non-negative. [`TIMEOUT_NEVER`] if sanity checking is disabled.
pub const fn sanity_remaining(now: Ticks, sanity_last: Ticks, itvl: Ticks) -> Ticks {
    if itvl == 0 {
        return TIMEOUT_NEVER;
    }
    let due = sanity_last.wrapping_add(itvl);
    if tick_leq(due, now) {
        0
    } else {
        due.wrapping_sub(now)
    }
}

/// Decide how long to sleep. `sched`, `callout`, and `sanity` are the ticks
/// until the next task wake-up, callout expiry, and sanity pass. Sleeps
/// shorter than `min` aren't worth it (`0`: wait for the next tick), and
/// sleeps are capped at `max`.
pub const fn idle_ticks(sched: Ticks, callout: Ticks, sanity: Ticks, min: Ticks, max: Ticks) -> Ticks {
    let mut t = sched;
    if callout < t {
        t = callout;
    }
    if sanity < t {
        t = sanity;
    }

    if t < min {
        0
    } else if t > max {
        max
    } else {
        t
    }
}

/// Get the number of idle loop iterations so far.
pub fn idle_counter<Traits: KernelTraits>() -> u32 {
    klock::lock_cpu::<Traits>()
        .map(|lock| Traits::state().idle.read(&*lock).counter)
        .unwrap_or(0)
}

/// Create the idle task. Called by `os_init`.
pub(crate) fn init_idle_task<Traits: KernelTraits>() -> TaskId {
    let stack = Traits::idle_stack()
        .unwrap_or_else(|| panic!("the idle task was already created"));

    {
        let mut lock = klock::lock_cpu::<Traits>()
            .unwrap_or_else(|_| panic!("`os_init` called with CPU Lock active"));
        Traits::state().idle.write(&mut *lock).sanity_last = time::time_get::<Traits>();
    }

    task::task_init::<Traits>(
        "idle",
        idle_task_body::<Traits>,
        0,
        Traits::IDLE_TASK_PRIO,
        TIMEOUT_NEVER,
        stack,
    )
    .unwrap_or_else(|e| panic!("failed to create the idle task: {e:?}"))
}

fn idle_task_body<Traits: KernelTraits>(_: usize) {
    let itvl = sanity_itvl::<Traits>();
    let min = time::ms_to_ticks32::<Traits>(Traits::IDLE_TICKLESS_MS_MIN);
    let max = time::ms_to_ticks32::<Traits>(Traits::IDLE_TICKLESS_MS_MAX);

    log::debug!("idle task started (sanity interval {itvl} ticks)");

    // The idle task never holds CPU Lock outside this loop's critical
    // section, so `lock_cpu` always succeeds here
    loop {
        let sanity_last = {
            let mut lock = klock::lock_cpu::<Traits>().unwrap();
            let state = Traits::state().idle.write(&mut *lock);
            state.counter = state.counter.wrapping_add(1);
            state.sanity_last
        };

        let now = time::time_get::<Traits>();
        if itvl != 0 && tick_geq(now, sanity_last.wrapping_add(itvl)) {
            sanity::sanity_run::<Traits>().unwrap();
            if let Some(wd) = watchdog::handle::<Traits>() {
                wd.tickle();
            }
            let mut lock = klock::lock_cpu::<Traits>().unwrap();
            Traits::state().idle.write(&mut *lock).sanity_last = now;
        }

        let mut lock = klock::lock_cpu::<Traits>().unwrap();
        let now = time::time_get::<Traits>();
        let sanity_last = Traits::state().idle.read(&*lock).sanity_last;
        let ticks = idle_ticks(
            task::sched_wakeup_ticks_locked(lock.borrow_mut(), now),
            callout::wakeup_ticks_locked(lock.borrow_mut(), now),
            sanity_remaining(now, sanity_last, itvl),
            min,
            max,
        );

        // Safety: CPU Lock active, the idle task
        unsafe { Traits::tick_idle(ticks) };

        drop(lock);
    }
}
