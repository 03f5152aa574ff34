#![cfg(target_os = "linux")]

//! Semaphores through the C ABI: `-1` plus errno on failure.

use std::ffi::c_void;
use std::mem::MaybeUninit;
use std::sync::Mutex;

use uthread_abi::errno_abi::{uthread_get_errno, uthread_set_errno, uthread_strerror_r};
use uthread_abi::pthread_abi::{uthread_create, uthread_join, uthread_t};
use uthread_abi::sem_abi::{
    uthread_sem_clockwait, uthread_sem_destroy, uthread_sem_getvalue, uthread_sem_init,
    uthread_sem_post, uthread_sem_t, uthread_sem_timedwait, uthread_sem_trywait, uthread_sem_wait,
};
use uthread_core::pthread::SEM_VALUE_MAX;

static TEST_GUARD: Mutex<()> = Mutex::new(());

fn guard() -> std::sync::MutexGuard<'static, ()> {
    TEST_GUARD.lock().unwrap_or_else(|p| p.into_inner())
}

fn new_sem(value: u32) -> Box<MaybeUninit<uthread_sem_t>> {
    let mut storage = Box::new(MaybeUninit::<uthread_sem_t>::uninit());
    assert_eq!(unsafe { uthread_sem_init(storage.as_mut_ptr(), 0, value) }, 0);
    storage
}

fn value_of(sem: *mut uthread_sem_t) -> i32 {
    let mut v = -1;
    assert_eq!(unsafe { uthread_sem_getvalue(sem, &mut v) }, 0);
    v
}

#[test]
fn init_above_max_fails_with_einval() {
    let _guard = guard();
    let mut storage = MaybeUninit::<uthread_sem_t>::uninit();
    uthread_set_errno(0);
    assert_eq!(unsafe { uthread_sem_init(storage.as_mut_ptr(), 0, SEM_VALUE_MAX + 1) }, -1);
    assert_eq!(uthread_get_errno(), libc::EINVAL);
}

#[test]
fn trywait_on_empty_sets_eagain() {
    let _guard = guard();
    let mut sem = new_sem(1);
    let p = sem.as_mut_ptr();
    unsafe {
        assert_eq!(uthread_sem_trywait(p), 0);
        assert_eq!(uthread_sem_trywait(p), -1);
    }
    assert_eq!(uthread_get_errno(), libc::EAGAIN);
    assert_eq!(value_of(p), 0);
}

#[test]
fn timedwait_expires_and_validates_deadline() {
    let _guard = guard();
    let mut sem = new_sem(0);
    let p = sem.as_mut_ptr();
    let mut now = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) };
    unsafe {
        assert_eq!(uthread_sem_timedwait(p, &now), -1);
        assert_eq!(uthread_get_errno(), libc::ETIMEDOUT);
        let bad = libc::timespec { tv_sec: now.tv_sec, tv_nsec: -1 };
        assert_eq!(uthread_sem_timedwait(p, &bad), -1);
        assert_eq!(uthread_get_errno(), libc::EINVAL);
        assert_eq!(uthread_sem_clockwait(p, 12345, &now), -1);
        assert_eq!(uthread_get_errno(), libc::EINVAL);
        assert_eq!(uthread_sem_timedwait(p, std::ptr::null()), -1);
        assert_eq!(uthread_get_errno(), libc::EINVAL);
    }
}

unsafe extern "C-unwind" fn wait_twice(arg: *mut c_void) -> *mut c_void {
    let p = arg as *mut uthread_sem_t;
    let a = unsafe { uthread_sem_wait(p) };
    let b = unsafe { uthread_sem_wait(p) };
    ((a == 0 && b == 0) as usize) as *mut c_void
}

#[test]
fn posts_release_a_blocked_waiter() {
    let _guard = guard();
    let mut sem = new_sem(0);
    let p = sem.as_mut_ptr();
    let mut tid: uthread_t = 0;
    assert_eq!(unsafe { uthread_create(&mut tid, std::ptr::null(), Some(wait_twice), p as *mut c_void) }, 0);
    unsafe {
        assert_eq!(uthread_sem_post(p), 0);
        assert_eq!(uthread_sem_post(p), 0);
    }
    let mut ret: *mut c_void = std::ptr::null_mut();
    assert_eq!(unsafe { uthread_join(tid, &mut ret) }, 0);
    assert_eq!(ret as usize, 1);
    assert_eq!(value_of(p), 0);
    assert_eq!(unsafe { uthread_sem_destroy(p) }, 0);
}

#[test]
fn post_at_max_overflows() {
    let _guard = guard();
    let mut sem = new_sem(SEM_VALUE_MAX);
    let p = sem.as_mut_ptr();
    assert_eq!(unsafe { uthread_sem_post(p) }, -1);
    assert_eq!(uthread_get_errno(), libc::EOVERFLOW);
}

#[test]
fn strerror_truncates_into_small_buffers() {
    let _guard = guard();
    let mut buf = [0xFFu8; 64];
    assert_eq!(unsafe { uthread_strerror_r(libc::EOWNERDEAD, buf.as_mut_ptr(), buf.len()) }, 0);
    let end = buf.iter().position(|&b| b == 0).unwrap();
    assert_eq!(&buf[..end], b"Owner died");

    let mut tiny = [0xFFu8; 4];
    assert_eq!(
        unsafe { uthread_strerror_r(libc::EINVAL, tiny.as_mut_ptr(), tiny.len()) },
        libc::ERANGE
    );
    assert_eq!(&tiny, b"Inv\0");
}
