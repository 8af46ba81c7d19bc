//! Sanity checks
//!
//! A sanity check is either a function polled by the idle task or a
//! heartbeat that its owner must renew with [`sanity_check_reset`] (tasks
//! use [`sanity_task_checkin`]). A check that is neither healthy nor renewed
//! within its interval is a fatal error.
use crate::{
    error::{BadIdError, ContextError, InitObjectError, NoMemoryError, QueryObjectError},
    klock::{self, CpuLockTokenRefMut},
    task::TaskId,
    time::{self, tick_gt, Ticks},
    utils::{
        pool::{Pool, PoolId},
        Init,
    },
    KernelTraits, MAX_SANITY_CHECKS,
};

define_id! {
    /// Identifies a sanity check.
    pub struct SanityCheckId;
}

/// A health check function. Returns `true` if healthy.
pub type SanityFn = fn(SanityCheckId, usize) -> bool;

pub(crate) struct SanityCb {
    func: Option<SanityFn>,
    arg: usize,
    itvl: Ticks,
    checkin_last: Ticks,
    /// The owner task's name, for diagnostics.
    name: Option<&'static str>,
}

pub(crate) struct SanityState {
    checks: Pool<SanityCheckId, SanityCb, MAX_SANITY_CHECKS>,
}

impl Init for SanityState {
    const INIT: Self = Self {
        checks: Init::INIT,
    };
}

impl SanityState {
    fn validate(&self, id: SanityCheckId) -> Result<(), BadIdError> {
        if self.checks.contains(id) {
            Ok(())
        } else {
            Err(BadIdError::BadId)
        }
    }
}

pub(crate) fn register_locked<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    func: Option<SanityFn>,
    arg: usize,
    itvl: Ticks,
    name: Option<&'static str>,
) -> Result<SanityCheckId, NoMemoryError> {
    let now = time::time_get::<Traits>();
    Traits::state()
        .sanity
        .write(&mut *lock)
        .checks
        .allocate(SanityCb {
            func,
            arg,
            itvl,
            checkin_last: now,
            name,
        })
        .map_err(|_| NoMemoryError::NoMemory)
}

/// Register a sanity check. It must pass (if `func` is given) or be renewed
/// by [`sanity_check_reset`] at least every `itvl` ticks.
pub fn sanity_check_register<Traits: KernelTraits>(
    func: Option<SanityFn>,
    arg: usize,
    itvl: Ticks,
) -> Result<SanityCheckId, InitObjectError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    Ok(register_locked(lock.borrow_mut(), func, arg, itvl, None)?)
}

/// Renew a sanity check.
pub fn sanity_check_reset<Traits: KernelTraits>(
    id: SanityCheckId,
) -> Result<(), QueryObjectError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let state = Traits::state().sanity.write(&mut *lock);
    state.validate(id)?;
    state.checks[id].checkin_last = time::time_get::<Traits>();
    Ok(())
}

/// Renew the sanity check of `task`, or of the current task if `None`. Does
/// nothing if the task has no sanity check.
pub fn sanity_task_checkin<Traits: KernelTraits>(
    task: Option<TaskId>,
) -> Result<(), QueryObjectError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let sched = Traits::state().sched.read(&*lock);
    let task = match task {
        Some(task) => task,
        None => sched.running.ok_or(QueryObjectError::BadContext)?,
    };
    let sanity = sched.tasks.get(task).ok_or(QueryObjectError::BadId)?.sanity;

    if let Some(id) = sanity {
        Traits::state().sanity.write(&mut *lock).checks[id].checkin_last =
            time::time_get::<Traits>();
    }
    Ok(())
}

/// Evaluate every sanity check. Panics if one has failed.
///
/// Check functions are called without CPU Lock.
pub fn sanity_run<Traits: KernelTraits>() -> Result<(), ContextError> {
    let count = {
        let lock = klock::lock_cpu::<Traits>()?;
        Traits::state().sanity.read(&*lock).checks.len()
    };

    for i in 0..count {
        let id = SanityCheckId::from_index(i);
        let (func, arg) = {
            let lock = klock::lock_cpu::<Traits>()?;
            let sc = &Traits::state().sanity.read(&*lock).checks[id];
            (sc.func, sc.arg)
        };

        let healthy = func.map_or(false, |func| func(id, arg));

        let mut lock = klock::lock_cpu::<Traits>()?;
        let now = time::time_get::<Traits>();
        let sc = &mut Traits::state().sanity.write(&mut *lock).checks[id];
        if healthy {
            sc.checkin_last = now;
        } else if tick_gt(now, sc.checkin_last.wrapping_add(sc.itvl)) {
            let name = sc.name.unwrap_or("-");
            let (last, itvl) = (sc.checkin_last, sc.itvl);
            drop(lock);
            log::error!(
                "sanity check {id:?} (task '{name}') failed: last check-in at {last}, \
                 interval {itvl}, now {now}"
            );
            panic!("sanity check {id:?} failed");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_port::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn heartbeat_keeps_check_alive() {
        test_port!(struct Traits);
        impl crate::KernelCfg for Traits {}

        let id = sanity_check_register::<Traits>(None, 0, 10).unwrap();
        tick::<Traits>(10);
        sanity_run::<Traits>().unwrap();

        sanity_check_reset::<Traits>(id).unwrap();
        tick::<Traits>(10);
        sanity_run::<Traits>().unwrap();
    }

    #[test]
    #[should_panic(expected = "sanity check SanityCheckId(0) failed")]
    fn stale_heartbeat_is_fatal() {
        test_port!(struct Traits);
        impl crate::KernelCfg for Traits {}

        sanity_check_register::<Traits>(None, 0, 10).unwrap();
        tick::<Traits>(11);
        let _ = sanity_run::<Traits>();
    }

    #[test]
    fn healthy_function_refreshes() {
        test_port!(struct Traits);
        impl crate::KernelCfg for Traits {}

        static HEALTHY: AtomicBool = AtomicBool::new(true);
        fn check(_: SanityCheckId, arg: usize) -> bool {
            assert_eq!(arg, 7);
            HEALTHY.load(Ordering::Relaxed)
        }

        sanity_check_register::<Traits>(Some(check), 7, 10).unwrap();
        tick::<Traits>(100);
        sanity_run::<Traits>().unwrap();

        // Unhealthy, but still within the interval since the last success
        HEALTHY.store(false, Ordering::Relaxed);
        tick::<Traits>(10);
        sanity_run::<Traits>().unwrap();
    }

    #[test]
    fn bad_id_and_missing_task() {
        test_port!(struct Traits);
        impl crate::KernelCfg for Traits {}

        assert_eq!(
            sanity_check_reset::<Traits>(SanityCheckId(3)),
            Err(QueryObjectError::BadId)
        );
        // There's no running task on the test port
        assert_eq!(
            sanity_task_checkin::<Traits>(None),
            Err(QueryObjectError::BadContext)
        );
    }
}
