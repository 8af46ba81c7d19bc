use core::sync::atomic::Ordering;

use crate::{error::BadContextError, KernelTraits};

/// If the current context is not a task context, return `Err(BadContext)`.
pub(super) fn expect_task_context<Traits: KernelTraits>() -> Result<(), BadContextError> {
    if !Traits::is_task_context() {
        Err(BadContextError::BadContext)
    } else {
        Ok(())
    }
}

/// If the current context is not waitable, return `Err(BadContext)`.
///
/// Tasks can only block after `os_start`.
pub(super) fn expect_waitable_context<Traits: KernelTraits>() -> Result<(), BadContextError> {
    if !Traits::is_task_context() || !is_started::<Traits>() {
        Err(BadContextError::BadContext)
    } else {
        Ok(())
    }
}

/// Get a flag indicating whether `os_start` has been called.
#[inline]
pub(super) fn is_started<Traits: KernelTraits>() -> bool {
    Traits::state().started.load(Ordering::Acquire)
}
