#![cfg(target_os = "linux")]

//! Cancellation through the C ABI: deferred delivery at cancellation
//! points, disabled state, and cleanup handlers on the way out.

use std::ffi::c_void;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use uthread_abi::pthread_abi::{
    uthread_cancel, uthread_cleanup_push, uthread_create, uthread_join,
    uthread_setcancelstate, uthread_setcanceltype, uthread_t, uthread_testcancel,
};
use uthread_abi::sync_abi::{
    uthread_cond_t, uthread_cond_wait, uthread_mutex_lock, uthread_mutex_t, uthread_mutex_trylock,
    uthread_mutex_unlock,
};
use uthread_core::pthread::{
    PTHREAD_CANCEL_ASYNCHRONOUS, PTHREAD_CANCEL_DEFERRED, PTHREAD_CANCEL_DISABLE,
    PTHREAD_CANCEL_ENABLE, PTHREAD_CANCELED,
};

static TEST_GUARD: Mutex<()> = Mutex::new(());

fn guard() -> std::sync::MutexGuard<'static, ()> {
    TEST_GUARD.lock().unwrap_or_else(|p| p.into_inner())
}

fn ptr<T>(obj: &T) -> *mut T {
    obj as *const T as *mut T
}

fn join(tid: uthread_t) -> usize {
    let mut retval: *mut c_void = std::ptr::null_mut();
    assert_eq!(unsafe { uthread_join(tid, &mut retval) }, 0);
    retval as usize
}

struct Waiting {
    lock: uthread_mutex_t,
    cv: uthread_cond_t,
    parked: AtomicU32,
    unlocked_by_handler: AtomicUsize,
}

unsafe extern "C" fn unlock_in_handler(arg: *mut c_void) {
    let w = unsafe { &*(arg as *const Waiting) };
    w.unlocked_by_handler.fetch_add(1, Ordering::SeqCst);
    unsafe { uthread_mutex_unlock(ptr(&w.lock)) };
}

unsafe extern "C-unwind" fn wait_forever(arg: *mut c_void) -> *mut c_void {
    let w = unsafe { &*(arg as *const Waiting) };
    unsafe {
        uthread_mutex_lock(ptr(&w.lock));
        uthread_cleanup_push(Some(unlock_in_handler), arg);
        w.parked.store(1, Ordering::SeqCst);
        loop {
            uthread_cond_wait(ptr(&w.cv), ptr(&w.lock));
        }
    }
}

#[test]
fn cancelled_cond_waiter_runs_handler_with_mutex_held() {
    let _guard = guard();
    let w = Box::new(Waiting {
        lock: uthread_mutex_t::new(),
        cv: uthread_cond_t::new(),
        parked: AtomicU32::new(0),
        unlocked_by_handler: AtomicUsize::new(0),
    });
    let arg = &*w as *const Waiting as *mut c_void;
    let mut tid: uthread_t = 0;
    assert_eq!(unsafe { uthread_create(&mut tid, std::ptr::null(), Some(wait_forever), arg) }, 0);
    while w.parked.load(Ordering::SeqCst) == 0 {
        std::thread::yield_now();
    }
    // The waiter releases the mutex inside the wait; taking it proves it parked.
    unsafe { uthread_mutex_lock(ptr(&w.lock)) };
    unsafe { uthread_mutex_unlock(ptr(&w.lock)) };

    assert_eq!(uthread_cancel(tid), 0);
    assert_eq!(join(tid), PTHREAD_CANCELED);
    assert_eq!(w.unlocked_by_handler.load(Ordering::SeqCst), 1);
    // The handler's unlock left the mutex free.
    assert_eq!(unsafe { uthread_mutex_trylock(ptr(&w.lock)) }, 0);
    unsafe { uthread_mutex_unlock(ptr(&w.lock)) };
}

static GATE: AtomicU32 = AtomicU32::new(0);

unsafe extern "C-unwind" fn disabled_then_test(_arg: *mut c_void) -> *mut c_void {
    let mut old = -1;
    unsafe { uthread_setcancelstate(PTHREAD_CANCEL_DISABLE, &mut old) };
    assert_eq!(old, PTHREAD_CANCEL_ENABLE);
    GATE.store(1, Ordering::SeqCst);
    while GATE.load(Ordering::SeqCst) != 2 {
        std::thread::yield_now();
    }
    // Pending but disabled: no effect.
    uthread_testcancel();
    unsafe { uthread_setcancelstate(PTHREAD_CANCEL_ENABLE, std::ptr::null_mut()) };
    uthread_testcancel();
    5 as *mut c_void
}

#[test]
fn disabled_cancellation_is_held_until_reenabled() {
    let _guard = guard();
    GATE.store(0, Ordering::SeqCst);
    let mut tid: uthread_t = 0;
    assert_eq!(
        unsafe { uthread_create(&mut tid, std::ptr::null(), Some(disabled_then_test), std::ptr::null_mut()) },
        0
    );
    while GATE.load(Ordering::SeqCst) != 1 {
        std::thread::yield_now();
    }
    assert_eq!(uthread_cancel(tid), 0);
    GATE.store(2, Ordering::SeqCst);
    assert_eq!(join(tid), PTHREAD_CANCELED);
}

unsafe extern "C-unwind" fn async_self_cancel(_arg: *mut c_void) -> *mut c_void {
    let mut old = -1;
    unsafe { uthread_setcanceltype(PTHREAD_CANCEL_ASYNCHRONOUS, &mut old) };
    assert_eq!(old, PTHREAD_CANCEL_DEFERRED);
    uthread_cancel(uthread_abi::pthread_abi::uthread_self());
    // Not reached.
    6 as *mut c_void
}

#[test]
fn asynchronous_self_cancel_takes_effect_immediately() {
    let _guard = guard();
    let mut tid: uthread_t = 0;
    assert_eq!(
        unsafe { uthread_create(&mut tid, std::ptr::null(), Some(async_self_cancel), std::ptr::null_mut()) },
        0
    );
    assert_eq!(join(tid), PTHREAD_CANCELED);
}

#[test]
fn invalid_state_and_type_are_einval() {
    let _guard = guard();
    let mut old = 0;
    unsafe {
        assert_eq!(uthread_setcancelstate(42, &mut old), libc::EINVAL);
        assert_eq!(uthread_setcanceltype(42, &mut old), libc::EINVAL);
    }
}
