//! Error types
use core::{fmt, mem::transmute};

/// The macro to define [`ResultCode`].
macro_rules! define_result_code {
    (
        $( #[$meta:meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident = $vd:expr
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta] )*
                $vname = $vd
            ),*
        }

        impl ResultCode {
            /// Get the short name of the result code.
            ///
            /// # Examples
            ///
            /// ```
            /// use tern_kernel::ResultCode;
            /// assert_eq!(ResultCode::AlreadyInProgress.as_str(), "AlreadyInProgress");
            /// ```
            pub fn as_str(self) -> &'static str {
                match self {
                    $(
                        Self::$vname => stringify!($vname),
                    )*
                }
            }

            fn fmt(self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl fmt::Debug for ResultCode {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                (*self).fmt(f)
            }
        }
    };
}

define_result_code! {
    /// All result codes (including success) that kernel operations can
    /// produce.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    #[repr(i8)]
    pub enum ResultCode {
        /// The operation was successful. No additional information is available.
        Success = 0,
        /// A named object does not exist.
        NotFound = -10,
        /// A parameter is invalid in a way that is not covered by any other
        /// error codes.
        BadParam = -17,
        /// The specified object identifier does not belong to this kernel
        /// instance.
        BadId = -18,
        /// The current context disallows the operation, e.g., because CPU Lock
        /// is active or a blocking call was made outside a task context.
        BadContext = -25,
        /// A fixed-capacity object pool is exhausted.
        NoMemory = -33,
        /// A target object or the request itself is in a state that
        /// disallows the operation.
        InvalidState = -41,
        /// A one-shot process has already been started.
        AlreadyInProgress = -42,
        /// An object with the same name is already registered.
        DuplicateName = -44,
        /// The operation timed out.
        Timeout = -50,
    }
}

impl ResultCode {
    /// Get a flag indicating whether the code represents a failure.
    ///
    /// Failure codes have negative values.
    #[inline]
    pub fn is_err(self) -> bool {
        (self as i8) < 0
    }

    /// Get a flag indicating whether the code represents a success.
    #[inline]
    pub fn is_ok(self) -> bool {
        !self.is_err()
    }
}

macro_rules! define_error {
    (
        mod $mod_name:ident {}
        $( #[$meta:meta] )*
        $vis:vis enum $name:ident {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        ///
        /// See [`ResultCode`] for all result codes and generic descriptions.
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(i8)]
        $vis enum $name {
            $(
                $( #[$vmeta] )*
                // Use the same discriminants as `ResultCode` for cost-free
                // conversion
                $vname = ResultCode::$vname as i8
            ),*
        }

        impl fmt::Debug for $name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        impl From<Result<(), $name>> for ResultCode {
            #[inline]
            fn from(x: Result<(), $name>) -> Self {
                match x {
                    Ok(()) => Self::Success,
                    Err(e) => Self::from(e),
                }
            }
        }

        impl From<$name> for ResultCode {
            #[inline]
            fn from(x: $name) -> Self {
                // Safety: `ResultCode` and `$name` has the same representation
                //         type, and the representation of `ResultCode` is a
                //         superset of `x`.
                unsafe { transmute(x) }
            }
        }

        #[cfg(test)]
        mod $mod_name {
            use super::*;

            #[test]
            fn to_result_code() {
                $(
                    assert_eq!(
                        ResultCode::$vname,
                        ResultCode::from($name::$vname),
                    );
                )*
            }
        }
    };
}

/// Define an internal single-variant error type shared by several public
/// error types, so that `?` can lift it into any of them.
macro_rules! define_suberror {
    (
        $( #[doc $( $doc:tt )*] )*
        $( #[into( $Supererror:ident )] )*
        $vis:vis enum $Name:ident {
            $Variant:ident,
        }
    ) => {
        $( #[doc $( $doc )*] )*
        #[repr(i8)]
        #[derive(PartialEq, Eq, Copy, Clone)]
        $vis enum $Name {
            $Variant = ResultCode::$Variant as _
        }

        impl fmt::Debug for $Name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        impl From<$Name> for ResultCode {
            #[inline]
            fn from(x: $Name) -> Self {
                match x {
                    $Name::$Variant => Self::$Variant
                }
            }
        }

        $(
            impl From<$Name> for $Supererror {
                #[inline]
                fn from(x: $Name) -> Self {
                    match x {
                        $Name::$Variant => Self::$Variant
                    }
                }
            }
        )*
    };
}

define_error! {
    mod context_error {}
    /// Error type for operations that can only fail because of the calling
    /// context, e.g., [`time::time_delay`] or [`sysdown::sysdown_release`].
    ///
    /// [`time::time_delay`]: crate::time::time_delay
    /// [`sysdown::sysdown_release`]: crate::sysdown::sysdown_release
    pub enum ContextError {
        /// CPU Lock is active, or the current context is not a task context
        /// where one is required.
        BadContext,
    }
}

define_error! {
    mod ms_to_ticks_error {}
    /// Error type for [`time::ms_to_ticks`] and [`time::ticks_to_ms`].
    ///
    /// [`time::ms_to_ticks`]: crate::time::ms_to_ticks
    /// [`time::ticks_to_ms`]: crate::time::ticks_to_ms
    pub enum ConvertTimeError {
        /// The result does not fit in 32 bits.
        BadParam,
    }
}

define_error! {
    mod init_object_error {}
    /// Error type for object constructors such as [`eventq::event_init`],
    /// [`eventq::eventq_init`], and [`sanity::sanity_check_register`].
    ///
    /// [`eventq::event_init`]: crate::eventq::event_init
    /// [`eventq::eventq_init`]: crate::eventq::eventq_init
    /// [`sanity::sanity_check_register`]: crate::sanity::sanity_check_register
    pub enum InitObjectError {
        /// CPU Lock is active.
        BadContext,
        /// The object pool is full.
        NoMemory,
    }
}

define_error! {
    mod callout_init_error {}
    /// Error type for [`callout::callout_init`].
    ///
    /// [`callout::callout_init`]: crate::callout::callout_init
    pub enum CalloutInitError {
        /// CPU Lock is active.
        BadContext,
        /// The event queue is invalid.
        BadId,
        /// The callout or event pool is full.
        NoMemory,
    }
}

define_error! {
    mod task_init_error {}
    /// Error type for [`task::task_init`].
    ///
    /// [`task::task_init`]: crate::task::task_init
    pub enum TaskInitError {
        /// CPU Lock is active.
        BadContext,
        /// The stack region is empty.
        BadParam,
        /// The task pool or the sanity check pool is full.
        NoMemory,
    }
}

define_error! {
    mod query_object_error {}
    /// Error type for non-blocking operations on an existing object.
    pub enum QueryObjectError {
        /// CPU Lock is active.
        BadContext,
        /// The object identifier is invalid.
        BadId,
    }
}

define_error! {
    mod get_event_error {}
    /// Error type for [`eventq::eventq_get`].
    ///
    /// [`eventq::eventq_get`]: crate::eventq::eventq_get
    pub enum GetEventError {
        /// CPU Lock is active, or the current context is not a task context.
        BadContext,
        /// The event queue identifier is invalid.
        BadId,
    }
}

define_error! {
    mod get_event_timeout_error {}
    /// Error type for [`eventq::eventq_get_timeout`].
    ///
    /// [`eventq::eventq_get_timeout`]: crate::eventq::eventq_get_timeout
    pub enum GetEventTimeoutError {
        /// CPU Lock is active, or the current context is not a task context.
        BadContext,
        /// The event queue identifier is invalid.
        BadId,
        /// No event arrived before the timeout.
        Timeout,
    }
}

define_error! {
    mod callout_reset_error {}
    /// Error type for [`callout::callout_reset`].
    ///
    /// [`callout::callout_reset`]: crate::callout::callout_reset
    pub enum CalloutResetError {
        /// CPU Lock is active.
        BadContext,
        /// The callout identifier is invalid.
        BadId,
        /// The delay is negative.
        InvalidState,
    }
}

define_error! {
    mod dev_create_error {}
    /// Error type for [`dev::dev_create`].
    ///
    /// [`dev::dev_create`]: crate::dev::dev_create
    pub enum DevCreateError {
        /// CPU Lock is active.
        BadContext,
        /// The device pool is full.
        NoMemory,
        /// A device with the same name is already registered.
        DuplicateName,
    }
}

define_error! {
    mod watchdog_init_error {}
    /// Error type for [`PortWatchdog::watchdog_init`].
    ///
    /// [`PortWatchdog::watchdog_init`]: crate::PortWatchdog::watchdog_init
    pub enum WatchdogInitError {
        /// The requested expiration interval can't be represented by the
        /// hardware.
        BadParam,
    }
}

define_error! {
    mod sysdown_error {}
    /// Error type for [`sysdown::sysdown`].
    ///
    /// [`sysdown::sysdown`]: crate::sysdown::sysdown
    pub enum SysdownError {
        /// CPU Lock is active.
        BadContext,
        /// A shutdown sequence is already running.
        AlreadyInProgress,
    }
}

define_suberror! {
    /// `BadContext`
    #[into(ContextError)]
    #[into(InitObjectError)]
    #[into(CalloutInitError)]
    #[into(TaskInitError)]
    #[into(QueryObjectError)]
    #[into(GetEventError)]
    #[into(GetEventTimeoutError)]
    #[into(CalloutResetError)]
    #[into(DevCreateError)]
    #[into(SysdownError)]
    pub(crate) enum BadContextError {
        BadContext,
    }
}

define_suberror! {
    /// `BadId`
    #[into(CalloutInitError)]
    #[into(QueryObjectError)]
    #[into(GetEventError)]
    #[into(GetEventTimeoutError)]
    #[into(CalloutResetError)]
    pub(crate) enum BadIdError {
        BadId,
    }
}

define_suberror! {
    /// `NoMemory`
    #[into(InitObjectError)]
    #[into(CalloutInitError)]
    #[into(TaskInitError)]
    #[into(DevCreateError)]
    pub(crate) enum NoMemoryError {
        NoMemory,
    }
}
