//! ABI layer for `<semaphore.h>`. Unlike the pthread functions these
//! return `-1` and set the calling thread's errno on failure.

use std::ffi::c_int;

use uthread_core::errno;
use uthread_core::pthread::Semaphore;

use crate::{errno_status, read_timespec};

pub type uthread_sem_t = Semaphore;

/// # Safety
///
/// `sem` must be null or point to an initialized semaphore.
unsafe fn sem_ref<'a>(sem: *mut uthread_sem_t) -> Result<&'a Semaphore, c_int> {
    // SAFETY: forwarded caller contract.
    unsafe { sem.as_ref() }.ok_or(errno::EINVAL)
}

fn flatten(result: Result<c_int, c_int>) -> c_int {
    errno_status(result.unwrap_or_else(|e| e))
}

/// POSIX `sem_init`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_sem_init(sem: *mut uthread_sem_t, pshared: c_int, value: u32) -> c_int {
    if sem.is_null() {
        return errno_status(errno::EINVAL);
    }
    match Semaphore::new(value, pshared != 0) {
        Ok(s) => {
            // SAFETY: non-null; the storage is treated as uninitialized.
            unsafe { sem.write(s) };
            0
        }
        Err(e) => errno_status(e),
    }
}

/// POSIX `sem_destroy`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_sem_destroy(sem: *mut uthread_sem_t) -> c_int {
    // SAFETY: forwarded caller contract.
    flatten(unsafe { sem_ref(sem) }.map(Semaphore::destroy))
}

/// POSIX `sem_post`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_sem_post(sem: *mut uthread_sem_t) -> c_int {
    // SAFETY: forwarded caller contract.
    flatten(unsafe { sem_ref(sem) }.map(Semaphore::post))
}

/// POSIX `sem_wait`. A cancellation point.
#[unsafe(no_mangle)]
pub unsafe extern "C-unwind" fn uthread_sem_wait(sem: *mut uthread_sem_t) -> c_int {
    // SAFETY: forwarded caller contract.
    flatten(unsafe { sem_ref(sem) }.map(Semaphore::wait))
}

/// POSIX `sem_trywait`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_sem_trywait(sem: *mut uthread_sem_t) -> c_int {
    // SAFETY: forwarded caller contract.
    flatten(unsafe { sem_ref(sem) }.map(Semaphore::trywait))
}

/// POSIX `sem_timedwait`, on `CLOCK_REALTIME`.
#[unsafe(no_mangle)]
pub unsafe extern "C-unwind" fn uthread_sem_timedwait(
    sem: *mut uthread_sem_t,
    abstime: *const libc::timespec,
) -> c_int {
    // SAFETY: forwarded caller contract.
    let result = unsafe { sem_ref(sem) }.and_then(|s| {
        // SAFETY: null or a readable timespec.
        let deadline = unsafe { read_timespec(abstime) }.ok_or(errno::EINVAL)?;
        Ok(s.timedwait(&deadline))
    });
    flatten(result)
}

/// POSIX `sem_clockwait`.
#[unsafe(no_mangle)]
pub unsafe extern "C-unwind" fn uthread_sem_clockwait(
    sem: *mut uthread_sem_t,
    clock_id: c_int,
    abstime: *const libc::timespec,
) -> c_int {
    // SAFETY: forwarded caller contract.
    let result = unsafe { sem_ref(sem) }.and_then(|s| {
        // SAFETY: null or a readable timespec.
        let deadline = unsafe { read_timespec(abstime) }.ok_or(errno::EINVAL)?;
        Ok(s.clockwait(clock_id, &deadline))
    });
    flatten(result)
}

/// POSIX `sem_getvalue`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_sem_getvalue(sem: *mut uthread_sem_t, value: *mut c_int) -> c_int {
    if value.is_null() {
        return errno_status(errno::EINVAL);
    }
    // SAFETY: forwarded caller contract.
    match unsafe { sem_ref(sem) } {
        Ok(s) => {
            // SAFETY: validated non-null above.
            unsafe { value.write(s.getvalue() as c_int) };
            0
        }
        Err(e) => errno_status(e),
    }
}
