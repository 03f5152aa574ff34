//! Error number definitions.
//!
//! Every primitive in this crate reports failure as a POSIX errno value
//! (0 on success). This module carries the numeric constants, the
//! thread-local `errno` slot used by the semaphore entry points, and the
//! [`ErrorKind`] taxonomy that groups the codes by cause.

use std::cell::Cell;
use std::fmt;

thread_local! {
    static ERRNO: Cell<i32> = const { Cell::new(0) };
}

pub const EPERM: i32 = 1;
pub const ESRCH: i32 = 3;
pub const EINTR: i32 = 4;
pub const EAGAIN: i32 = 11;
pub const ENOMEM: i32 = 12;
pub const EBUSY: i32 = 16;
pub const EINVAL: i32 = 22;
pub const ERANGE: i32 = 34;
pub const EDEADLK: i32 = 35;
pub const ENOSYS: i32 = 38;
pub const EOVERFLOW: i32 = 75;
pub const ENOTSUP: i32 = 95;
pub const ETIMEDOUT: i32 = 110;
pub const EOWNERDEAD: i32 = 130;
pub const ENOTRECOVERABLE: i32 = 131;

/// Returns the message string for the given errno value.
pub fn strerror_message(errnum: i32) -> &'static str {
    match errnum {
        0 => "Success",
        EPERM => "Operation not permitted",
        ESRCH => "No such process",
        EINTR => "Interrupted system call",
        EAGAIN => "Resource temporarily unavailable",
        ENOMEM => "Cannot allocate memory",
        EBUSY => "Device or resource busy",
        EINVAL => "Invalid argument",
        ERANGE => "Numerical result out of range",
        EDEADLK => "Resource deadlock avoided",
        ENOSYS => "Function not implemented",
        EOVERFLOW => "Value too large for defined data type",
        ENOTSUP => "Operation not supported",
        ETIMEDOUT => "Connection timed out",
        EOWNERDEAD => "Owner died",
        ENOTRECOVERABLE => "State not recoverable",
        _ => "Unknown error",
    }
}

/// Reads the calling thread's `errno`.
#[inline]
pub fn get_errno() -> i32 {
    ERRNO.with(Cell::get)
}

/// Sets the calling thread's `errno`.
#[inline]
pub fn set_errno(value: i32) {
    ERRNO.with(|slot| slot.set(value));
}

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// Cause-level grouping of the errno values the runtime can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    Busy,
    Deadlock,
    Permission,
    /// Counter or table exhaustion (`EAGAIN`).
    ResourceExhausted,
    /// Semaphore value at its ceiling (`EOVERFLOW`).
    Overflow,
    /// The target thread does not exist (`ESRCH`).
    Unavailable,
    TimedOut,
    Interrupted,
    OwnerDied,
    NotRecoverable,
    Unsupported,
    OutOfMemory,
}

impl ErrorKind {
    /// The errno value reported for this kind.
    #[must_use]
    pub const fn errno(self) -> i32 {
        match self {
            Self::InvalidArgument => EINVAL,
            Self::Busy => EBUSY,
            Self::Deadlock => EDEADLK,
            Self::Permission => EPERM,
            Self::ResourceExhausted => EAGAIN,
            Self::Overflow => EOVERFLOW,
            Self::Unavailable => ESRCH,
            Self::TimedOut => ETIMEDOUT,
            Self::Interrupted => EINTR,
            Self::OwnerDied => EOWNERDEAD,
            Self::NotRecoverable => ENOTRECOVERABLE,
            Self::Unsupported => ENOSYS,
            Self::OutOfMemory => ENOMEM,
        }
    }

    /// Classifies an errno value. Returns `None` for 0 and unknown codes.
    #[must_use]
    pub const fn from_errno(errnum: i32) -> Option<Self> {
        Some(match errnum {
            EINVAL => Self::InvalidArgument,
            EBUSY => Self::Busy,
            EDEADLK => Self::Deadlock,
            EPERM => Self::Permission,
            EAGAIN => Self::ResourceExhausted,
            EOVERFLOW => Self::Overflow,
            ESRCH => Self::Unavailable,
            ETIMEDOUT => Self::TimedOut,
            EINTR => Self::Interrupted,
            EOWNERDEAD => Self::OwnerDied,
            ENOTRECOVERABLE => Self::NotRecoverable,
            ENOSYS | ENOTSUP => Self::Unsupported,
            ENOMEM => Self::OutOfMemory,
            _ => return None,
        })
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(strerror_message(self.errno()))
    }
}

/// Flattens an internal `Result` into the errno-style status returned by the
/// public entry points.
#[inline]
pub fn status(result: Result<(), i32>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => e,
    }
}
