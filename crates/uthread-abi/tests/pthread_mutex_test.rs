#![cfg(target_os = "linux")]

//! Integration tests for the mutex entry points: types, hardened mode,
//! timed locking and robust owner-death recovery.

use std::cell::Cell;
use std::collections::HashSet;
use std::ffi::c_void;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use uthread_abi::pthread_abi::{uthread_create, uthread_join, uthread_t};
use uthread_abi::sync_abi::{
    uthread_mutex_consistent, uthread_mutex_destroy, uthread_mutex_init, uthread_mutex_lock,
    uthread_mutex_t, uthread_mutex_timedlock, uthread_mutex_trylock, uthread_mutex_unlock,
    uthread_mutexattr_getrobust, uthread_mutexattr_init, uthread_mutexattr_setprotocol,
    uthread_mutexattr_setpshared, uthread_mutexattr_setrobust, uthread_mutexattr_settype,
    uthread_mutexattr_t,
};
use uthread_core::config::{self, RuntimeConfig, SafetyLevel};
use uthread_core::pthread::attr::PTHREAD_PRIO_INHERIT;
use uthread_core::pthread::{
    PTHREAD_MUTEX_ERRORCHECK, PTHREAD_MUTEX_NORMAL, PTHREAD_MUTEX_RECURSIVE,
    PTHREAD_MUTEX_ROBUST, PTHREAD_PROCESS_SHARED,
};
use uthread_core::sync::liveness::{self, LivenessOracle};

static TEST_GUARD: Mutex<()> = Mutex::new(());

fn guard() -> std::sync::MutexGuard<'static, ()> {
    TEST_GUARD.lock().unwrap_or_else(|p| p.into_inner())
}

/// Owner-death recovery logs through `tracing`; surface it in test output.
fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .with_thread_ids(true)
        .with_ansi(false)
        .try_init();
}

fn ptr<T>(obj: &T) -> *mut T {
    obj as *const T as *mut T
}

fn mutex_of_type(kind: i32) -> Box<uthread_mutex_t> {
    let mut attr = MaybeUninit::<uthread_mutexattr_t>::uninit();
    unsafe {
        assert_eq!(uthread_mutexattr_init(attr.as_mut_ptr()), 0);
        assert_eq!(uthread_mutexattr_settype(attr.as_mut_ptr(), kind), 0);
    }
    let m = Box::new(uthread_mutex_t::new());
    assert_eq!(unsafe { uthread_mutex_init(ptr(&*m), attr.as_ptr()) }, 0);
    m
}

fn set_mode(mode: SafetyLevel) {
    config::override_for_tests(RuntimeConfig {
        mode,
        ..config::runtime_config()
    });
}

#[test]
fn errorcheck_reports_relock_and_foreign_unlock() {
    let _guard = guard();
    let m = mutex_of_type(PTHREAD_MUTEX_ERRORCHECK);
    let mp = ptr(&*m);
    unsafe {
        assert_eq!(uthread_mutex_unlock(mp), libc::EPERM);
        assert_eq!(uthread_mutex_lock(mp), 0);
        assert_eq!(uthread_mutex_lock(mp), libc::EDEADLK);
        assert_eq!(uthread_mutex_trylock(mp), libc::EBUSY);
        assert_eq!(uthread_mutex_destroy(mp), libc::EBUSY);
        assert_eq!(uthread_mutex_unlock(mp), 0);
        assert_eq!(uthread_mutex_destroy(mp), 0);
        assert_eq!(uthread_mutex_lock(mp), libc::EINVAL);
    }
}

#[test]
fn recursive_needs_matching_unlocks() {
    let _guard = guard();
    let m = mutex_of_type(PTHREAD_MUTEX_RECURSIVE);
    let mp = ptr(&*m);
    unsafe {
        assert_eq!(uthread_mutex_lock(mp), 0);
        assert_eq!(uthread_mutex_lock(mp), 0);
        assert_eq!(uthread_mutex_trylock(mp), 0);
        assert_eq!(uthread_mutex_unlock(mp), 0);
        assert_eq!(uthread_mutex_unlock(mp), 0);
        assert_eq!(uthread_mutex_unlock(mp), 0);
        assert_eq!(uthread_mutex_unlock(mp), libc::EPERM);
    }
}

#[test]
fn hardened_mode_turns_normal_self_relock_into_edeadlk() {
    let _guard = guard();
    set_mode(SafetyLevel::Hardened);
    let m = mutex_of_type(PTHREAD_MUTEX_NORMAL);
    let mp = ptr(&*m);
    unsafe {
        assert_eq!(uthread_mutex_lock(mp), 0);
        assert_eq!(uthread_mutex_lock(mp), libc::EDEADLK);
        assert_eq!(uthread_mutex_unlock(mp), 0);
        assert_eq!(uthread_mutex_unlock(mp), libc::EPERM);
    }
    set_mode(SafetyLevel::Strict);
}

#[test]
fn zeroed_storage_is_a_usable_normal_mutex() {
    let _guard = guard();
    let storage = Box::new(MaybeUninit::<uthread_mutex_t>::zeroed());
    let mp = storage.as_ptr() as *mut uthread_mutex_t;
    unsafe {
        assert_eq!(uthread_mutex_lock(mp), 0);
        assert_eq!(uthread_mutex_trylock(mp), libc::EBUSY);
        assert_eq!(uthread_mutex_unlock(mp), 0);
    }
}

#[test]
fn null_mutex_is_einval() {
    let _guard = guard();
    unsafe {
        assert_eq!(uthread_mutex_lock(std::ptr::null_mut()), libc::EINVAL);
        assert_eq!(uthread_mutex_init(std::ptr::null_mut(), std::ptr::null()), libc::EINVAL);
    }
}

#[test]
fn attribute_validation() {
    let _guard = guard();
    let mut attr = MaybeUninit::<uthread_mutexattr_t>::uninit();
    let a = attr.as_mut_ptr();
    unsafe {
        assert_eq!(uthread_mutexattr_init(a), 0);
        assert_eq!(uthread_mutexattr_settype(a, 99), libc::EINVAL);
        assert_eq!(uthread_mutexattr_setprotocol(a, PTHREAD_PRIO_INHERIT), libc::ENOSYS);
        assert_eq!(uthread_mutexattr_setrobust(a, PTHREAD_MUTEX_ROBUST), 0);
        let mut robust = 0;
        assert_eq!(uthread_mutexattr_getrobust(a, &mut robust), 0);
        assert_eq!(robust, PTHREAD_MUTEX_ROBUST);
    }
}

struct Held {
    mutex: usize,
    released: AtomicUsize,
}

unsafe extern "C-unwind" fn hold_for_a_while(arg: *mut c_void) -> *mut c_void {
    let held = unsafe { &*(arg as *const Held) };
    let mp = held.mutex as *mut uthread_mutex_t;
    unsafe { uthread_mutex_lock(mp) };
    std::thread::sleep(std::time::Duration::from_millis(150));
    held.released.store(1, Ordering::SeqCst);
    unsafe { uthread_mutex_unlock(mp) };
    std::ptr::null_mut()
}

#[test]
fn timedlock_expires_while_another_thread_holds_it() {
    let _guard = guard();
    let m = mutex_of_type(PTHREAD_MUTEX_ERRORCHECK);
    let held = Arc::new(Held {
        mutex: ptr(&*m) as usize,
        released: AtomicUsize::new(0),
    });
    let mut tid: uthread_t = 0;
    let rc = unsafe {
        uthread_create(&mut tid, std::ptr::null(), Some(hold_for_a_while), Arc::as_ptr(&held) as *mut c_void)
    };
    assert_eq!(rc, 0);
    while unsafe { uthread_mutex_trylock(ptr(&*m)) } == 0 {
        // Raced ahead of the holder; give the lock back and retry.
        unsafe { uthread_mutex_unlock(ptr(&*m)) };
        std::thread::yield_now();
    }
    let mut now = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) };
    let deadline = libc::timespec {
        tv_sec: now.tv_sec,
        tv_nsec: now.tv_nsec,
    };
    assert_eq!(unsafe { uthread_mutex_timedlock(ptr(&*m), &deadline) }, libc::ETIMEDOUT);
    let bad = libc::timespec { tv_sec: now.tv_sec + 5, tv_nsec: 1_000_000_000 };
    assert_eq!(unsafe { uthread_mutex_timedlock(ptr(&*m), &bad) }, libc::EINVAL);

    assert_eq!(unsafe { uthread_mutex_lock(ptr(&*m)) }, 0);
    assert_eq!(held.released.load(Ordering::SeqCst), 1);
    assert_eq!(unsafe { uthread_mutex_unlock(ptr(&*m)) }, 0);
    assert_eq!(unsafe { uthread_join(tid, std::ptr::null_mut()) }, 0);
}

// ---------------------------------------------------------------------------
// Robust mutexes
// ---------------------------------------------------------------------------

thread_local! {
    static PRETEND_PID: Cell<u32> = const { Cell::new(0) };
}

/// Lets a test thread pose as another process so its death can be scripted.
#[derive(Default)]
struct PerThreadProcess {
    dead: Mutex<HashSet<u32>>,
}

impl LivenessOracle for PerThreadProcess {
    fn current_process(&self) -> u32 {
        match PRETEND_PID.with(Cell::get) {
            0 => std::process::id(),
            pid => pid,
        }
    }

    fn is_alive(&self, pid: u32) -> bool {
        pid != 0 && !self.dead.lock().unwrap_or_else(|p| p.into_inner()).contains(&pid)
    }
}

const GHOST: u32 = 0x0ABC_0201;

unsafe extern "C-unwind" fn lock_as_ghost(arg: *mut c_void) -> *mut c_void {
    PRETEND_PID.with(|p| p.set(GHOST));
    let rc = unsafe { uthread_mutex_lock(arg as *mut uthread_mutex_t) };
    // Returns holding the lock: the "process" dies with it.
    rc as usize as *mut c_void
}

#[test]
fn robust_owner_death_is_reported_and_recoverable() {
    let _guard = guard();
    init_test_logging();
    let oracle = Arc::new(PerThreadProcess::default());
    liveness::set_oracle(oracle.clone());

    let mut attr = MaybeUninit::<uthread_mutexattr_t>::uninit();
    let a = attr.as_mut_ptr();
    unsafe {
        assert_eq!(uthread_mutexattr_init(a), 0);
        assert_eq!(uthread_mutexattr_settype(a, PTHREAD_MUTEX_ERRORCHECK), 0);
        assert_eq!(uthread_mutexattr_setpshared(a, PTHREAD_PROCESS_SHARED), 0);
        assert_eq!(uthread_mutexattr_setrobust(a, PTHREAD_MUTEX_ROBUST), 0);
    }
    let m = Box::new(uthread_mutex_t::new());
    let mp = ptr(&*m);
    assert_eq!(unsafe { uthread_mutex_init(mp, a) }, 0);

    let mut tid: uthread_t = 0;
    let rc = unsafe { uthread_create(&mut tid, std::ptr::null(), Some(lock_as_ghost), mp as *mut c_void) };
    assert_eq!(rc, 0);
    let mut ret: *mut c_void = std::ptr::null_mut();
    assert_eq!(unsafe { uthread_join(tid, &mut ret) }, 0);
    assert_eq!(ret as usize, 0);

    oracle.dead.lock().unwrap().insert(GHOST);
    unsafe {
        assert_eq!(uthread_mutex_lock(mp), libc::EOWNERDEAD);
        assert_eq!(uthread_mutex_consistent(mp), 0);
        assert_eq!(uthread_mutex_unlock(mp), 0);
        // Recovered: ordinary locking again.
        assert_eq!(uthread_mutex_lock(mp), 0);
        assert_eq!(uthread_mutex_unlock(mp), 0);
    }
    liveness::reset_oracle();
}

unsafe extern "C-unwind" fn lock_as_ghost_two(arg: *mut c_void) -> *mut c_void {
    PRETEND_PID.with(|p| p.set(GHOST + 1));
    let rc = unsafe { uthread_mutex_lock(arg as *mut uthread_mutex_t) };
    rc as usize as *mut c_void
}

#[test]
fn robust_unlock_without_consistent_poisons_the_mutex() {
    let _guard = guard();
    init_test_logging();
    let oracle = Arc::new(PerThreadProcess::default());
    liveness::set_oracle(oracle.clone());

    let mut attr = MaybeUninit::<uthread_mutexattr_t>::uninit();
    let a = attr.as_mut_ptr();
    unsafe {
        assert_eq!(uthread_mutexattr_init(a), 0);
        assert_eq!(uthread_mutexattr_setpshared(a, PTHREAD_PROCESS_SHARED), 0);
        assert_eq!(uthread_mutexattr_setrobust(a, PTHREAD_MUTEX_ROBUST), 0);
    }
    let m = Box::new(uthread_mutex_t::new());
    let mp = ptr(&*m);
    assert_eq!(unsafe { uthread_mutex_init(mp, a) }, 0);

    let mut tid: uthread_t = 0;
    let rc = unsafe { uthread_create(&mut tid, std::ptr::null(), Some(lock_as_ghost_two), mp as *mut c_void) };
    assert_eq!(rc, 0);
    assert_eq!(unsafe { uthread_join(tid, std::ptr::null_mut()) }, 0);

    oracle.dead.lock().unwrap().insert(GHOST + 1);
    unsafe {
        assert_eq!(uthread_mutex_lock(mp), libc::EOWNERDEAD);
        assert_eq!(uthread_mutex_unlock(mp), 0);
        assert_eq!(uthread_mutex_lock(mp), libc::ENOTRECOVERABLE);
        assert_eq!(uthread_mutex_trylock(mp), libc::ENOTRECOVERABLE);
    }
    liveness::reset_oracle();
}
