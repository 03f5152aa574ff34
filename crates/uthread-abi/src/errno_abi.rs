//! ABI access to the runtime's thread-local errno, set by the semaphore
//! entry points.

use std::ffi::c_int;

use uthread_core::errno;

/// Current value of the calling thread's errno.
#[unsafe(no_mangle)]
pub extern "C" fn uthread_get_errno() -> c_int {
    errno::get_errno()
}

#[unsafe(no_mangle)]
pub extern "C" fn uthread_set_errno(value: c_int) {
    errno::set_errno(value);
}

/// Writes the message for `errnum`, NUL-terminated and truncated to fit,
/// into `buf`. Returns `ERANGE` when truncated, `EINVAL` for a null or
/// empty buffer.
///
/// # Safety
///
/// `buf` must be valid for `buflen` bytes of writes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_strerror_r(errnum: c_int, buf: *mut u8, buflen: usize) -> c_int {
    if buf.is_null() || buflen == 0 {
        return errno::EINVAL;
    }
    let msg = errno::strerror_message(errnum).as_bytes();
    let n = msg.len().min(buflen - 1);
    // SAFETY: `n + 1 <= buflen` bytes are written, per the caller contract.
    unsafe {
        std::ptr::copy_nonoverlapping(msg.as_ptr(), buf, n);
        buf.add(n).write(0);
    }
    if n < msg.len() { errno::ERANGE } else { 0 }
}
