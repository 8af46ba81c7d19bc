//! CPU Lock and the cells it protects
//!
//! Every piece of mutable kernel state lives in a [`CpuLockCell`]. Reading
//! one takes a shared borrow of the [`CpuLockToken`], writing one takes a
//! mutable borrow, and the token only exists inside a [`CpuLockGuard`]. So the
//! borrow checker enforces that kernel state is touched only with CPU Lock
//! active, and that no two parts of the kernel hold `&mut` to the same state.
use core::ops;
use tokenlock::UnsyncTokenLock;

use crate::{error::BadContextError, utils::Init, PortThreading};

pub(crate) struct CpuLockTag<Traits>(Traits);

/// Proof of CPU Lock. There's at most one per kernel trait type.
pub(crate) type CpuLockToken<Traits> = tokenlock::UnsyncSingletonToken<CpuLockTag<Traits>>;

type CpuLockKeyhole<Traits> = tokenlock::SingletonTokenId<CpuLockTag<Traits>>;

/// A reborrowed [`CpuLockGuard`], passed to functions that run inside a
/// critical section owned by the caller.
///
/// Unlike `&mut CpuLockGuard`, this isn't reborrowed implicitly. Call
/// `borrow_mut` to pass it on and keep using it afterwards.
pub(crate) type CpuLockTokenRefMut<'a, Traits> =
    tokenlock::UnsyncSingletonTokenRefMut<'a, CpuLockTag<Traits>>;

/// Kernel state accessible only with CPU Lock active.
pub(crate) struct CpuLockCell<Traits, T>(UnsyncTokenLock<T, CpuLockKeyhole<Traits>>);

impl<Traits, T: Init> Init for CpuLockCell<Traits, T> {
    const INIT: Self = Self(Init::INIT);
}

impl<Traits, T> CpuLockCell<Traits, T> {
    #[inline]
    pub(crate) fn read<'a>(&'a self, token: &'a CpuLockToken<Traits>) -> &'a T {
        self.0.read(token)
    }

    #[inline]
    pub(crate) fn write<'a>(&'a self, token: &'a mut CpuLockToken<Traits>) -> &'a mut T {
        self.0.write(token)
    }
}

/// Enter CPU Lock. Fails with `BadContext` if it's already active, which is
/// how kernel operations reject calls from inside another kernel operation
/// (e.g., from a port hook).
pub(crate) fn lock_cpu<Traits: PortThreading>() -> Result<CpuLockGuard<Traits>, BadContextError> {
    if Traits::is_cpu_lock_active() {
        return Err(BadContextError::BadContext);
    }

    // Safety: CPU Lock is inactive, so no guard exists
    unsafe {
        Traits::enter_cpu_lock();
        Ok(assume_cpu_lock())
    }
}

/// Create a guard for a CPU Lock entered by someone else, e.g., by a port
/// before it calls into [`PortToKernel`]. Use `forget` to leave CPU Lock
/// active when the guard goes out of scope.
///
/// # Safety
///
/// CPU Lock must be active, and no other guard may exist.
///
/// [`PortToKernel`]: crate::PortToKernel
pub(crate) unsafe fn assume_cpu_lock<Traits: PortThreading>() -> CpuLockGuard<Traits> {
    debug_assert!(Traits::is_cpu_lock_active());

    CpuLockGuard {
        // Safety: Uniqueness is upheld by the caller
        token: unsafe { CpuLockToken::new_unchecked() },
    }
}

/// Holds CPU Lock and the [`CpuLockToken`]. Leaves CPU Lock when dropped.
pub(crate) struct CpuLockGuard<Traits: PortThreading> {
    token: CpuLockToken<Traits>,
}

impl<Traits: PortThreading> CpuLockGuard<Traits> {
    pub(crate) fn borrow_mut(&mut self) -> CpuLockTokenRefMut<'_, Traits> {
        self.token.borrow_mut()
    }
}

impl<Traits: PortThreading> Drop for CpuLockGuard<Traits> {
    fn drop(&mut self) {
        // Safety: We hold CPU Lock
        unsafe { Traits::leave_cpu_lock() };
    }
}

impl<Traits: PortThreading> ops::Deref for CpuLockGuard<Traits> {
    type Target = CpuLockToken<Traits>;

    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl<Traits: PortThreading> ops::DerefMut for CpuLockGuard<Traits> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_lock_is_rejected() {
        test_port!(struct Traits);
        impl crate::KernelCfg for Traits {}

        let lock = lock_cpu::<Traits>().unwrap();
        assert!(Traits::is_cpu_lock_active());
        assert!(matches!(
            lock_cpu::<Traits>(),
            Err(BadContextError::BadContext)
        ));

        drop(lock);
        assert!(!Traits::is_cpu_lock_active());
        assert!(lock_cpu::<Traits>().is_ok());
    }
}
