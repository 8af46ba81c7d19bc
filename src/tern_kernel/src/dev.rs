//! Device registry
//!
//! Devices are registered before `os_start` and initialized in three stages
//! by `os_init`. Within a stage, devices are initialized in ascending
//! priority order, then in registration order.
use arrayvec::ArrayVec;
use bitflags::bitflags;

use crate::{
    error::{BadIdError, ContextError, DevCreateError, QueryObjectError},
    klock, state,
    time::Ticks,
    utils::{pool::Pool, Init},
    KernelTraits, MAX_DEVICES,
};

define_id! {
    /// Identifies a device.
    pub struct DevId;
}

/// The boot stage in which a device is initialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DevInitStage {
    /// Before the idle task is created.
    Kernel,
    /// After `KernelCfg::bsp_init`.
    Primary,
    /// After every primary device.
    Secondary,
}

/// A driver-defined failure code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevStatus(pub i32);

/// A device initialization function. Receives the device and the argument
/// given to [`dev_create`].
pub type DevInitFn = fn(DevId, usize) -> Result<(), DevStatus>;

bitflags! {
    /// Device status flags.
    pub struct DevFlags: u8 {
        /// The initialization function has been called.
        const INITIALIZED = 1 << 0;
        /// The initialization function succeeded.
        const READY = 1 << 1;
        /// The device is suspended.
        const SUSPENDED = 1 << 2;
    }
}

/// Driver hooks, set with [`dev_set_handlers`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DevHandlers {
    /// Called by [`dev_open`] with its argument.
    pub open: Option<fn(DevId, usize) -> Result<(), DevStatus>>,
    /// Called by [`dev_close`].
    pub close: Option<fn(DevId) -> Result<(), DevStatus>>,
    /// Called by [`dev_suspend`] with the suspend time and the force flag.
    pub suspend: Option<fn(DevId, Ticks, bool) -> Result<(), DevStatus>>,
    /// Called by [`dev_resume`].
    pub resume: Option<fn(DevId) -> Result<(), DevStatus>>,
}

impl Init for DevHandlers {
    const INIT: Self = Self {
        open: None,
        close: None,
        suspend: None,
        resume: None,
    };
}

/// Error type for device operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevOpError {
    /// CPU Lock is active.
    BadContext,
    /// The device identifier is invalid.
    BadId,
    /// No device has the given name.
    NotFound,
    /// The device isn't ready, is suspended, or isn't open.
    InvalidState,
    /// The driver hook failed.
    Driver(DevStatus),
}

impl From<crate::error::BadContextError> for DevOpError {
    fn from(_: crate::error::BadContextError) -> Self {
        Self::BadContext
    }
}

impl From<BadIdError> for DevOpError {
    fn from(_: BadIdError) -> Self {
        Self::BadId
    }
}

/// Error type for [`dev_initialize_all`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevInitAllError {
    /// CPU Lock is active.
    BadContext,
    /// A device's initialization function failed.
    Failed { dev: DevId, status: DevStatus },
}

impl From<crate::error::BadContextError> for DevInitAllError {
    fn from(_: crate::error::BadContextError) -> Self {
        Self::BadContext
    }
}

pub(crate) struct DevCb {
    name: &'static str,
    stage: DevInitStage,
    prio: u8,
    init: DevInitFn,
    arg: usize,
    flags: DevFlags,
    open_count: u32,
    handlers: DevHandlers,
}

pub(crate) struct DevState {
    devs: Pool<DevId, DevCb, MAX_DEVICES>,
    /// Every device in initialization order.
    order: ArrayVec<DevId, MAX_DEVICES>,
}

impl Init for DevState {
    const INIT: Self = Self {
        devs: Init::INIT,
        order: Init::INIT,
    };
}

impl DevState {
    fn validate(&self, dev: DevId) -> Result<(), BadIdError> {
        if self.devs.contains(dev) {
            Ok(())
        } else {
            Err(BadIdError::BadId)
        }
    }

    fn lookup(&self, name: &str) -> Option<DevId> {
        self.devs
            .iter()
            .find(|(_, cb)| cb.name == name)
            .map(|(id, _)| id)
    }
}

/// Register a device. The device is initialized by `os_init` in the given
/// stage. Registration is only allowed before `os_start`.
pub fn dev_create<Traits: KernelTraits>(
    name: &'static str,
    stage: DevInitStage,
    prio: u8,
    init: DevInitFn,
    arg: usize,
) -> Result<DevId, DevCreateError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    if state::is_started::<Traits>() {
        return Err(DevCreateError::BadContext);
    }

    let state = Traits::state().dev.write(&mut *lock);
    if state.lookup(name).is_some() {
        return Err(DevCreateError::DuplicateName);
    }

    let dev = state
        .devs
        .allocate(DevCb {
            name,
            stage,
            prio,
            init,
            arg,
            flags: DevFlags::empty(),
            open_count: 0,
            handlers: DevHandlers::INIT,
        })
        .map_err(|_| DevCreateError::NoMemory)?;

    // Insert after every device that sorts before or equal to this one
    let devs = &state.devs;
    let pos = state
        .order
        .iter()
        .position(|&other| (stage, prio) < (devs[other].stage, devs[other].prio))
        .unwrap_or(state.order.len());
    state.order.insert(pos, dev);

    log::debug!("registered device '{name}' ({dev:?}) at {stage:?}/{prio}");
    Ok(dev)
}

/// Set a device's driver hooks.
pub fn dev_set_handlers<Traits: KernelTraits>(
    dev: DevId,
    handlers: DevHandlers,
) -> Result<(), QueryObjectError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let state = Traits::state().dev.write(&mut *lock);
    state.validate(dev)?;
    state.devs[dev].handlers = handlers;
    Ok(())
}

/// Initialize every device of `stage` that hasn't been initialized, in
/// order. Stops at the first failure.
pub fn dev_initialize_all<Traits: KernelTraits>(
    stage: DevInitStage,
) -> Result<(), DevInitAllError> {
    let order = {
        let lock = klock::lock_cpu::<Traits>()?;
        Traits::state().dev.read(&*lock).order.clone()
    };

    for dev in order {
        let (init, arg, name) = {
            let lock = klock::lock_cpu::<Traits>()?;
            let cb = &Traits::state().dev.read(&*lock).devs[dev];
            if cb.stage != stage || cb.flags.contains(DevFlags::INITIALIZED) {
                continue;
            }
            (cb.init, cb.arg, cb.name)
        };

        let result = init(dev, arg);

        let mut lock = klock::lock_cpu::<Traits>()?;
        let flags = &mut Traits::state().dev.write(&mut *lock).devs[dev].flags;
        flags.insert(DevFlags::INITIALIZED);
        match result {
            Ok(()) => {
                flags.insert(DevFlags::READY);
                log::trace!("initialized device '{name}'");
            }
            Err(status) => {
                drop(lock);
                log::error!("failed to initialize device '{name}': {status:?}");
                return Err(DevInitAllError::Failed { dev, status });
            }
        }
    }

    Ok(())
}

/// Look up a device by name.
pub fn dev_lookup<Traits: KernelTraits>(name: &str) -> Result<Option<DevId>, ContextError> {
    let lock = klock::lock_cpu::<Traits>()?;
    Ok(Traits::state().dev.read(&*lock).lookup(name))
}

/// Get a device's name.
pub fn dev_name<Traits: KernelTraits>(dev: DevId) -> Result<&'static str, QueryObjectError> {
    let lock = klock::lock_cpu::<Traits>()?;
    let state = Traits::state().dev.read(&*lock);
    state.validate(dev)?;
    Ok(state.devs[dev].name)
}

/// Get a device's status flags.
pub fn dev_flags<Traits: KernelTraits>(dev: DevId) -> Result<DevFlags, QueryObjectError> {
    let lock = klock::lock_cpu::<Traits>()?;
    let state = Traits::state().dev.read(&*lock);
    state.validate(dev)?;
    Ok(state.devs[dev].flags)
}

/// Get the number of outstanding [`dev_open`] calls.
pub fn dev_open_count<Traits: KernelTraits>(dev: DevId) -> Result<u32, QueryObjectError> {
    let lock = klock::lock_cpu::<Traits>()?;
    let state = Traits::state().dev.read(&*lock);
    state.validate(dev)?;
    Ok(state.devs[dev].open_count)
}

/// Open a ready device by name, calling its `open` hook with `arg`.
pub fn dev_open<Traits: KernelTraits>(name: &str, arg: usize) -> Result<DevId, DevOpError> {
    let (dev, open) = {
        let lock = klock::lock_cpu::<Traits>()?;
        let state = Traits::state().dev.read(&*lock);
        let dev = state.lookup(name).ok_or(DevOpError::NotFound)?;
        let cb = &state.devs[dev];
        if !cb.flags.contains(DevFlags::READY) || cb.flags.contains(DevFlags::SUSPENDED) {
            return Err(DevOpError::InvalidState);
        }
        (dev, cb.handlers.open)
    };

    if let Some(open) = open {
        open(dev, arg).map_err(DevOpError::Driver)?;
    }

    let mut lock = klock::lock_cpu::<Traits>()?;
    Traits::state().dev.write(&mut *lock).devs[dev].open_count += 1;
    Ok(dev)
}

/// Close a device opened by [`dev_open`], calling its `close` hook.
pub fn dev_close<Traits: KernelTraits>(dev: DevId) -> Result<(), DevOpError> {
    let close = {
        let lock = klock::lock_cpu::<Traits>()?;
        let state = Traits::state().dev.read(&*lock);
        state.validate(dev)?;
        let cb = &state.devs[dev];
        if cb.open_count == 0 {
            return Err(DevOpError::InvalidState);
        }
        cb.handlers.close
    };

    if let Some(close) = close {
        close(dev).map_err(DevOpError::Driver)?;
    }

    let mut lock = klock::lock_cpu::<Traits>()?;
    let cb = &mut Traits::state().dev.write(&mut *lock).devs[dev];
    cb.open_count = cb.open_count.saturating_sub(1);
    Ok(())
}

/// Suspend a device at `suspend_at`. If the `suspend` hook fails, the device
/// is suspended anyway when `force` is set.
pub fn dev_suspend<Traits: KernelTraits>(
    dev: DevId,
    suspend_at: Ticks,
    force: bool,
) -> Result<(), DevOpError> {
    let suspend = {
        let lock = klock::lock_cpu::<Traits>()?;
        let state = Traits::state().dev.read(&*lock);
        state.validate(dev)?;
        state.devs[dev].handlers.suspend
    };

    let result = match suspend {
        Some(suspend) => suspend(dev, suspend_at, force),
        None => Ok(()),
    };

    if result.is_ok() || force {
        let mut lock = klock::lock_cpu::<Traits>()?;
        Traits::state().dev.write(&mut *lock).devs[dev]
            .flags
            .insert(DevFlags::SUSPENDED);
    }

    result.map_err(DevOpError::Driver)
}

/// Resume a suspended device, calling its `resume` hook.
pub fn dev_resume<Traits: KernelTraits>(dev: DevId) -> Result<(), DevOpError> {
    let resume = {
        let lock = klock::lock_cpu::<Traits>()?;
        let state = Traits::state().dev.read(&*lock);
        state.validate(dev)?;
        if !state.devs[dev].flags.contains(DevFlags::SUSPENDED) {
            return Err(DevOpError::InvalidState);
        }
        state.devs[dev].handlers.resume
    };

    if let Some(resume) = resume {
        resume(dev).map_err(DevOpError::Driver)?;
    }

    let mut lock = klock::lock_cpu::<Traits>()?;
    Traits::state().dev.write(&mut *lock).devs[dev]
        .flags
        .remove(DevFlags::SUSPENDED);
    Ok(())
}

/// Call `f` for every device in initialization order until it returns
/// `false`. `f` is called without CPU Lock.
pub fn dev_walk<Traits: KernelTraits>(
    mut f: impl FnMut(DevId, &'static str, DevFlags) -> bool,
) -> Result<(), ContextError> {
    let order = {
        let lock = klock::lock_cpu::<Traits>()?;
        Traits::state().dev.read(&*lock).order.clone()
    };

    for dev in order {
        let (name, flags) = {
            let lock = klock::lock_cpu::<Traits>()?;
            let cb = &Traits::state().dev.read(&*lock).devs[dev];
            (cb.name, cb.flags)
        };
        if !f(dev, name, flags) {
            break;
        }
    }
    Ok(())
}
