//! `extern "C"` surface of the threading runtime.
//!
//! Symbols carry a `uthread_` prefix so linking this library never
//! interposes the host libc's own `pthread_*` and `sem_*` functions.
//! Object types are the core's Rust types, exported opaquely; storage that
//! is all zero bytes is a valid default-initialized object, matching the
//! static initializers of `<pthread.h>`.
//!
//! Entry points that are cancellation points, or that run caller code which
//! may call `uthread_exit`, use the `C-unwind` ABI: thread exit travels as
//! an unwind and must be allowed to cross them.

#![allow(non_camel_case_types)]
#![allow(clippy::missing_safety_doc)]

pub mod errno_abi;
pub mod pthread_abi;
pub mod sem_abi;
pub mod sync_abi;

use std::ffi::c_int;

use uthread_core::Timespec;
use uthread_core::errno::{self, ErrorKind};

/// Reads a caller deadline. `None` for a null pointer.
///
/// # Safety
///
/// `ts` must be null or point to a readable `timespec`.
#[inline]
pub(crate) unsafe fn read_timespec(ts: *const libc::timespec) -> Option<Timespec> {
    if ts.is_null() {
        return None;
    }
    // SAFETY: non-null, readable per the caller contract.
    let ts = unsafe { &*ts };
    Some(Timespec::new(ts.tv_sec as i64, ts.tv_nsec as i64))
}

/// Stores `value` through an optional out-pointer.
///
/// # Safety
///
/// `out` must be null or valid for writes.
#[inline]
pub(crate) unsafe fn write_out<T>(out: *mut T, value: T) {
    if !out.is_null() {
        // SAFETY: non-null, writable per the caller contract.
        unsafe { out.write(value) };
    }
}

/// Splits a `Result` into the errno status and an optional out value.
///
/// # Safety
///
/// Same as [`write_out`].
#[inline]
pub(crate) unsafe fn status_with<T>(result: Result<T, c_int>, out: *mut T) -> c_int {
    match result {
        Ok(value) => {
            // SAFETY: forwarded caller contract.
            unsafe { write_out(out, value) };
            0
        }
        Err(e) => e,
    }
}

/// Converts a core status to the `-1` plus errno convention.
#[inline]
pub(crate) fn errno_status(rc: c_int) -> c_int {
    if rc == 0 {
        return 0;
    }
    match ErrorKind::from_errno(rc) {
        Some(kind) => tracing::trace!(rc, ?kind, "reporting failure through errno"),
        None => tracing::warn!(rc, "unclassified status reported through errno"),
    }
    errno::set_errno(rc);
    -1
}
