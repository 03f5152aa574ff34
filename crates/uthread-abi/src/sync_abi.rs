//! ABI layer for the synchronization objects of `<pthread.h>`: mutexes,
//! condition variables, read-write locks, barriers and spinlocks, plus
//! their attribute objects.

use std::ffi::c_int;

use uthread_core::errno;
use uthread_core::pthread::{
    Barrier, BarrierAttr, Cond, CondAttr, Mutex, MutexAttr, RwLock, RwLockAttr, SpinLock,
};

use crate::{read_timespec, status_with};

pub type uthread_mutex_t = Mutex;
pub type uthread_mutexattr_t = MutexAttr;
pub type uthread_cond_t = Cond;
pub type uthread_condattr_t = CondAttr;
pub type uthread_rwlock_t = RwLock;
pub type uthread_rwlockattr_t = RwLockAttr;
pub type uthread_barrier_t = Barrier;
pub type uthread_barrierattr_t = BarrierAttr;
pub type uthread_spinlock_t = SpinLock;

/// Borrows a caller object, returning `EINVAL` for null.
macro_rules! object {
    ($ptr:expr) => {
        // SAFETY: null or a live object of the right type, per the C
        // contract of every entry point below.
        match unsafe { $ptr.as_ref() } {
            Some(obj) => obj,
            None => return errno::EINVAL,
        }
    };
}

macro_rules! object_mut {
    ($ptr:expr) => {
        // SAFETY: as for `object!`, with exclusive access.
        match unsafe { $ptr.as_mut() } {
            Some(obj) => obj,
            None => return errno::EINVAL,
        }
    };
}

macro_rules! deadline {
    ($ts:expr) => {
        // SAFETY: null or a readable timespec.
        match unsafe { read_timespec($ts) } {
            Some(ts) => ts,
            None => return errno::EINVAL,
        }
    };
}

/// Writes a default attribute object into caller storage.
///
/// # Safety
///
/// `attr` must be null or valid for writes.
unsafe fn attr_init<T: Default>(attr: *mut T) -> c_int {
    if attr.is_null() {
        return errno::EINVAL;
    }
    // SAFETY: non-null, writable per the caller contract.
    unsafe { attr.write(T::default()) };
    0
}

// ===========================================================================
// Mutex operations
// ===========================================================================

/// POSIX `pthread_mutex_init`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_mutex_init(
    mutex: *mut uthread_mutex_t,
    attr: *const uthread_mutexattr_t,
) -> c_int {
    let m = object!(mutex);
    // SAFETY: null or an initialized attribute object.
    m.init(unsafe { attr.as_ref() })
}

/// POSIX `pthread_mutex_destroy`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_mutex_destroy(mutex: *mut uthread_mutex_t) -> c_int {
    object!(mutex).destroy()
}

/// POSIX `pthread_mutex_lock`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_mutex_lock(mutex: *mut uthread_mutex_t) -> c_int {
    object!(mutex).lock()
}

/// POSIX `pthread_mutex_trylock`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_mutex_trylock(mutex: *mut uthread_mutex_t) -> c_int {
    object!(mutex).trylock()
}

/// POSIX `pthread_mutex_timedlock`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_mutex_timedlock(
    mutex: *mut uthread_mutex_t,
    abstime: *const libc::timespec,
) -> c_int {
    let m = object!(mutex);
    m.timedlock(&deadline!(abstime))
}

/// POSIX `pthread_mutex_unlock`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_mutex_unlock(mutex: *mut uthread_mutex_t) -> c_int {
    object!(mutex).unlock()
}

/// POSIX `pthread_mutex_consistent`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_mutex_consistent(mutex: *mut uthread_mutex_t) -> c_int {
    object!(mutex).consistent()
}

/// POSIX `pthread_mutex_getprioceiling`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_mutex_getprioceiling(
    mutex: *const uthread_mutex_t,
    ceiling: *mut c_int,
) -> c_int {
    let m = object!(mutex);
    // SAFETY: caller-provided output pointer.
    unsafe { status_with(m.getprioceiling(), ceiling) }
}

/// POSIX `pthread_mutex_setprioceiling`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_mutex_setprioceiling(
    mutex: *mut uthread_mutex_t,
    ceiling: c_int,
    old_ceiling: *mut c_int,
) -> c_int {
    let m = object!(mutex);
    // SAFETY: caller-provided output pointer.
    unsafe { status_with(m.setprioceiling(ceiling), old_ceiling) }
}

// ---------------------------------------------------------------------------
// Mutex attributes
// ---------------------------------------------------------------------------

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_mutexattr_init(attr: *mut uthread_mutexattr_t) -> c_int {
    // SAFETY: forwarded caller contract.
    unsafe { attr_init(attr) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_mutexattr_destroy(attr: *mut uthread_mutexattr_t) -> c_int {
    object!(attr);
    0
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_mutexattr_settype(attr: *mut uthread_mutexattr_t, kind: c_int) -> c_int {
    object_mut!(attr).set_type(kind)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_mutexattr_gettype(
    attr: *const uthread_mutexattr_t,
    kind: *mut c_int,
) -> c_int {
    let a = object!(attr);
    // SAFETY: caller-provided output pointer.
    unsafe { status_with(Ok(a.kind()), kind) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_mutexattr_setpshared(
    attr: *mut uthread_mutexattr_t,
    pshared: c_int,
) -> c_int {
    object_mut!(attr).set_pshared(pshared)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_mutexattr_getpshared(
    attr: *const uthread_mutexattr_t,
    pshared: *mut c_int,
) -> c_int {
    let a = object!(attr);
    // SAFETY: caller-provided output pointer.
    unsafe { status_with(Ok(a.pshared()), pshared) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_mutexattr_setrobust(attr: *mut uthread_mutexattr_t, robust: c_int) -> c_int {
    object_mut!(attr).set_robust(robust)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_mutexattr_getrobust(
    attr: *const uthread_mutexattr_t,
    robust: *mut c_int,
) -> c_int {
    let a = object!(attr);
    // SAFETY: caller-provided output pointer.
    unsafe { status_with(Ok(a.robust()), robust) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_mutexattr_setprotocol(
    attr: *mut uthread_mutexattr_t,
    protocol: c_int,
) -> c_int {
    object_mut!(attr).set_protocol(protocol)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_mutexattr_getprotocol(
    attr: *const uthread_mutexattr_t,
    protocol: *mut c_int,
) -> c_int {
    let a = object!(attr);
    // SAFETY: caller-provided output pointer.
    unsafe { status_with(Ok(a.protocol()), protocol) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_mutexattr_setprioceiling(
    attr: *mut uthread_mutexattr_t,
    ceiling: c_int,
) -> c_int {
    object_mut!(attr).set_prioceiling(ceiling)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_mutexattr_getprioceiling(
    attr: *const uthread_mutexattr_t,
    ceiling: *mut c_int,
) -> c_int {
    let a = object!(attr);
    // SAFETY: caller-provided output pointer.
    unsafe { status_with(a.prioceiling(), ceiling) }
}

// ===========================================================================
// Condition variables
// ===========================================================================

/// POSIX `pthread_cond_init`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_cond_init(
    cond: *mut uthread_cond_t,
    attr: *const uthread_condattr_t,
) -> c_int {
    let cv = object!(cond);
    // SAFETY: null or an initialized attribute object.
    cv.init(unsafe { attr.as_ref() })
}

/// POSIX `pthread_cond_destroy`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_cond_destroy(cond: *mut uthread_cond_t) -> c_int {
    object!(cond).destroy()
}

/// POSIX `pthread_cond_signal`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_cond_signal(cond: *mut uthread_cond_t) -> c_int {
    object!(cond).signal()
}

/// POSIX `pthread_cond_broadcast`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_cond_broadcast(cond: *mut uthread_cond_t) -> c_int {
    object!(cond).broadcast()
}

/// POSIX `pthread_cond_wait`. A cancellation point.
#[unsafe(no_mangle)]
pub unsafe extern "C-unwind" fn uthread_cond_wait(
    cond: *mut uthread_cond_t,
    mutex: *mut uthread_mutex_t,
) -> c_int {
    let cv = object!(cond);
    cv.wait(object!(mutex))
}

/// POSIX `pthread_cond_timedwait`, on the clock chosen at init.
#[unsafe(no_mangle)]
pub unsafe extern "C-unwind" fn uthread_cond_timedwait(
    cond: *mut uthread_cond_t,
    mutex: *mut uthread_mutex_t,
    abstime: *const libc::timespec,
) -> c_int {
    let cv = object!(cond);
    let m = object!(mutex);
    cv.timedwait(m, &deadline!(abstime))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_condattr_init(attr: *mut uthread_condattr_t) -> c_int {
    // SAFETY: forwarded caller contract.
    unsafe { attr_init(attr) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_condattr_destroy(attr: *mut uthread_condattr_t) -> c_int {
    object!(attr);
    0
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_condattr_setpshared(attr: *mut uthread_condattr_t, pshared: c_int) -> c_int {
    object_mut!(attr).set_pshared(pshared)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_condattr_getpshared(
    attr: *const uthread_condattr_t,
    pshared: *mut c_int,
) -> c_int {
    let a = object!(attr);
    // SAFETY: caller-provided output pointer.
    unsafe { status_with(Ok(a.pshared()), pshared) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_condattr_setclock(attr: *mut uthread_condattr_t, clock_id: c_int) -> c_int {
    object_mut!(attr).set_clock(clock_id)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_condattr_getclock(
    attr: *const uthread_condattr_t,
    clock_id: *mut c_int,
) -> c_int {
    let a = object!(attr);
    // SAFETY: caller-provided output pointer.
    unsafe { status_with(Ok(a.clock()), clock_id) }
}

// ===========================================================================
// Read-write locks
// ===========================================================================

/// POSIX `pthread_rwlock_init`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_rwlock_init(
    rwlock: *mut uthread_rwlock_t,
    attr: *const uthread_rwlockattr_t,
) -> c_int {
    let rw = object!(rwlock);
    // SAFETY: null or an initialized attribute object.
    rw.init(unsafe { attr.as_ref() })
}

/// POSIX `pthread_rwlock_destroy`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_rwlock_destroy(rwlock: *mut uthread_rwlock_t) -> c_int {
    object!(rwlock).destroy()
}

/// POSIX `pthread_rwlock_rdlock`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_rwlock_rdlock(rwlock: *mut uthread_rwlock_t) -> c_int {
    object!(rwlock).rdlock()
}

/// POSIX `pthread_rwlock_tryrdlock`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_rwlock_tryrdlock(rwlock: *mut uthread_rwlock_t) -> c_int {
    object!(rwlock).tryrdlock()
}

/// POSIX `pthread_rwlock_timedrdlock`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_rwlock_timedrdlock(
    rwlock: *mut uthread_rwlock_t,
    abstime: *const libc::timespec,
) -> c_int {
    let rw = object!(rwlock);
    rw.timedrdlock(&deadline!(abstime))
}

/// POSIX `pthread_rwlock_wrlock`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_rwlock_wrlock(rwlock: *mut uthread_rwlock_t) -> c_int {
    object!(rwlock).wrlock()
}

/// POSIX `pthread_rwlock_trywrlock`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_rwlock_trywrlock(rwlock: *mut uthread_rwlock_t) -> c_int {
    object!(rwlock).trywrlock()
}

/// POSIX `pthread_rwlock_timedwrlock`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_rwlock_timedwrlock(
    rwlock: *mut uthread_rwlock_t,
    abstime: *const libc::timespec,
) -> c_int {
    let rw = object!(rwlock);
    rw.timedwrlock(&deadline!(abstime))
}

/// POSIX `pthread_rwlock_unlock`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_rwlock_unlock(rwlock: *mut uthread_rwlock_t) -> c_int {
    object!(rwlock).unlock()
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_rwlockattr_init(attr: *mut uthread_rwlockattr_t) -> c_int {
    // SAFETY: forwarded caller contract.
    unsafe { attr_init(attr) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_rwlockattr_destroy(attr: *mut uthread_rwlockattr_t) -> c_int {
    object!(attr);
    0
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_rwlockattr_setpshared(
    attr: *mut uthread_rwlockattr_t,
    pshared: c_int,
) -> c_int {
    object_mut!(attr).set_pshared(pshared)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_rwlockattr_getpshared(
    attr: *const uthread_rwlockattr_t,
    pshared: *mut c_int,
) -> c_int {
    let a = object!(attr);
    // SAFETY: caller-provided output pointer.
    unsafe { status_with(Ok(a.pshared()), pshared) }
}

// ===========================================================================
// Barriers
// ===========================================================================

/// POSIX `pthread_barrier_init`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_barrier_init(
    barrier: *mut uthread_barrier_t,
    attr: *const uthread_barrierattr_t,
    count: u32,
) -> c_int {
    let b = object!(barrier);
    // SAFETY: null or an initialized attribute object.
    b.init(count, unsafe { attr.as_ref() })
}

/// POSIX `pthread_barrier_destroy`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_barrier_destroy(barrier: *mut uthread_barrier_t) -> c_int {
    object!(barrier).destroy()
}

/// POSIX `pthread_barrier_wait`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_barrier_wait(barrier: *mut uthread_barrier_t) -> c_int {
    object!(barrier).wait()
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_barrierattr_init(attr: *mut uthread_barrierattr_t) -> c_int {
    // SAFETY: forwarded caller contract.
    unsafe { attr_init(attr) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_barrierattr_destroy(attr: *mut uthread_barrierattr_t) -> c_int {
    object!(attr);
    0
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_barrierattr_setpshared(
    attr: *mut uthread_barrierattr_t,
    pshared: c_int,
) -> c_int {
    object_mut!(attr).set_pshared(pshared)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_barrierattr_getpshared(
    attr: *const uthread_barrierattr_t,
    pshared: *mut c_int,
) -> c_int {
    let a = object!(attr);
    // SAFETY: caller-provided output pointer.
    unsafe { status_with(Ok(a.pshared()), pshared) }
}

// ===========================================================================
// Spinlocks
// ===========================================================================

/// POSIX `pthread_spin_init`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_spin_init(lock: *mut uthread_spinlock_t, pshared: c_int) -> c_int {
    object!(lock).init(pshared)
}

/// POSIX `pthread_spin_destroy`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_spin_destroy(lock: *mut uthread_spinlock_t) -> c_int {
    object!(lock).destroy()
}

/// POSIX `pthread_spin_lock`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_spin_lock(lock: *mut uthread_spinlock_t) -> c_int {
    object!(lock).lock()
}

/// POSIX `pthread_spin_trylock`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_spin_trylock(lock: *mut uthread_spinlock_t) -> c_int {
    object!(lock).trylock()
}

/// POSIX `pthread_spin_unlock`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_spin_unlock(lock: *mut uthread_spinlock_t) -> c_int {
    object!(lock).unlock()
}
