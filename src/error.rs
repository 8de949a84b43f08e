//! Recoverable kernel errors.
//!
//! Malformed input (stale handles, out-of-range priorities, zero lengths)
//! is reported through [`Error`] and leaves the kernel untouched. Violated
//! kernel invariants are not errors: they trip an assertion.
use core::fmt;

/// Kernel error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Error {
    /// A handle, priority, length or pointer argument is invalid.
    InvalidParam,
    /// The memory pool layout passed to `init` is unusable.
    InvalidConfig,
    /// The subsystem has not been initialized.
    NotInit,
    /// The operation is not supported in the current state.
    NotSupported,
    /// The memory pool or a fixed-capacity table is exhausted.
    NoMem,
    /// The priority slot already holds a task.
    AlreadyExists,
    /// The task has already run and cannot be deleted externally.
    Busy,
    /// Generic failure.
    Fail,
}

impl Error {
    /// Stable negative code, compatible with the C-style return values of
    /// the firmware this kernel ships with.
    pub const fn code(self) -> i32 {
        match self {
            Self::InvalidParam => -1,
            Self::NotInit => -2,
            Self::NotSupported => -4,
            Self::NoMem => -8,
            Self::Fail => -16,
            Self::InvalidConfig => -32,
            Self::AlreadyExists => -64,
            Self::Busy => -128,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::InvalidParam => "invalid parameter",
            Self::InvalidConfig => "invalid configuration",
            Self::NotInit => "not initialized",
            Self::NotSupported => "not supported",
            Self::NoMem => "out of memory",
            Self::AlreadyExists => "priority already in use",
            Self::Busy => "task is busy",
            Self::Fail => "operation failed",
        };
        f.write_str(msg)
    }
}

/// Result type of every fallible kernel operation.
pub type Result<T> = core::result::Result<T, Error>;
