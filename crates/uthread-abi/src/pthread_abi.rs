//! ABI layer for the thread side of `<pthread.h>`: lifecycle, attributes,
//! cancellation, cleanup handlers, thread-specific data and once.
//!
//! A `uthread_t` is the address of the thread's record. Joinable threads
//! created here are kept in a handle table until they are joined or
//! detached; other live threads are found through the registry.

use std::collections::HashMap;
use std::ffi::{c_int, c_void};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use uthread_core::errno;
use uthread_core::pthread::cleanup::{self, CleanupRoutine};
use uthread_core::pthread::tls::{self, KeyDestructor};
use uthread_core::pthread::{Once, ThreadAttr, ThreadRecord, cancel, exit, thread};

use crate::{errno_status, read_timespec, status_with, write_out};

pub type uthread_t = usize;
pub type uthread_attr_t = ThreadAttr;
pub type uthread_key_t = u32;
pub type uthread_once_t = Once;

pub type StartRoutine = unsafe extern "C-unwind" fn(*mut c_void) -> *mut c_void;
pub type OnceRoutine = unsafe extern "C-unwind" fn();
pub type ForeachCallback = unsafe extern "C" fn(uthread_t, *mut c_void) -> c_int;

type HandleTable = HashMap<uthread_t, Arc<ThreadRecord>>;

fn handle_table() -> &'static Mutex<HandleTable> {
    static TABLE: OnceLock<Mutex<HandleTable>> = OnceLock::new();
    TABLE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn resolve(handle: uthread_t) -> Option<Arc<ThreadRecord>> {
    if handle == 0 {
        return None;
    }
    if let Some(record) = handle_table().lock().get(&handle) {
        return Some(Arc::clone(record));
    }
    let me = thread::current();
    if me.addr() == handle {
        return Some(me);
    }
    let mut found = None;
    thread::foreach_np(|record| {
        if record.addr() == handle {
            found = Some(Arc::clone(record));
            -1
        } else {
            0
        }
    });
    found
}

fn forget(handle: uthread_t) {
    handle_table().lock().remove(&handle);
}

// ===========================================================================
// Lifecycle
// ===========================================================================

/// POSIX `pthread_create`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_create(
    thread_out: *mut uthread_t,
    attr: *const uthread_attr_t,
    start_routine: Option<StartRoutine>,
    arg: *mut c_void,
) -> c_int {
    let Some(start) = start_routine else {
        return errno::EINVAL;
    };
    if thread_out.is_null() {
        return errno::EINVAL;
    }
    // SAFETY: null or an attribute object set up by `uthread_attr_init`.
    let attr = unsafe { attr.as_ref() };
    let arg_addr = arg as usize;
    let spawned = thread::create(attr, move || {
        // SAFETY: the pthread_create contract makes `start` valid for `arg`.
        unsafe { start(arg_addr as *mut c_void) as usize }
    });
    match spawned {
        Ok(record) => {
            let handle = record.addr();
            if !record.is_detached() {
                handle_table().lock().insert(handle, Arc::clone(&record));
                // The child may have detached itself already.
                if record.is_detached() {
                    forget(handle);
                }
            }
            // SAFETY: validated non-null above.
            unsafe { thread_out.write(handle) };
            0
        }
        Err(e) => e,
    }
}

/// # Safety
///
/// `retval` must be null or writable.
unsafe fn joined(handle: uthread_t, result: Result<usize, i32>, retval: *mut *mut c_void) -> c_int {
    if result.is_ok() {
        forget(handle);
    }
    // SAFETY: forwarded caller contract.
    unsafe { status_with(result.map(|v| v as *mut c_void), retval) }
}

/// POSIX `pthread_join`. A cancellation point.
#[unsafe(no_mangle)]
pub unsafe extern "C-unwind" fn uthread_join(thread: uthread_t, retval: *mut *mut c_void) -> c_int {
    let Some(target) = resolve(thread) else {
        return errno::ESRCH;
    };
    // SAFETY: caller-provided output pointer.
    unsafe { joined(thread, thread::join(&target), retval) }
}

/// GNU `pthread_timedjoin_np`: `abstime` is on `CLOCK_REALTIME`.
#[unsafe(no_mangle)]
pub unsafe extern "C-unwind" fn uthread_timedjoin_np(
    thread: uthread_t,
    retval: *mut *mut c_void,
    abstime: *const libc::timespec,
) -> c_int {
    // SAFETY: null or a readable timespec.
    let Some(deadline) = (unsafe { read_timespec(abstime) }) else {
        return errno::EINVAL;
    };
    let Some(target) = resolve(thread) else {
        return errno::ESRCH;
    };
    // SAFETY: caller-provided output pointer.
    unsafe { joined(thread, thread::timedjoin(&target, &deadline), retval) }
}

/// GNU `pthread_tryjoin_np`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_tryjoin_np(thread: uthread_t, retval: *mut *mut c_void) -> c_int {
    let Some(target) = resolve(thread) else {
        return errno::ESRCH;
    };
    // SAFETY: caller-provided output pointer.
    unsafe { joined(thread, thread::tryjoin(&target), retval) }
}

/// POSIX `pthread_detach`.
#[unsafe(no_mangle)]
pub extern "C" fn uthread_detach(thread: uthread_t) -> c_int {
    let Some(target) = resolve(thread) else {
        return errno::ESRCH;
    };
    let rc = thread::detach(&target);
    if rc == 0 {
        forget(thread);
    }
    rc
}

/// POSIX `pthread_self`.
#[unsafe(no_mangle)]
pub extern "C" fn uthread_self() -> uthread_t {
    thread::current().addr()
}

/// POSIX `pthread_equal`.
#[unsafe(no_mangle)]
pub extern "C" fn uthread_equal(a: uthread_t, b: uthread_t) -> c_int {
    c_int::from(a == b)
}

/// POSIX `pthread_exit`.
#[unsafe(no_mangle)]
pub extern "C-unwind" fn uthread_exit(retval: *mut c_void) -> ! {
    exit::exit(retval as usize)
}

// ===========================================================================
// Cancellation and cleanup
// ===========================================================================

/// POSIX `pthread_cancel`.
#[unsafe(no_mangle)]
pub extern "C-unwind" fn uthread_cancel(thread: uthread_t) -> c_int {
    match resolve(thread) {
        Some(target) => cancel::cancel(&target),
        None => errno::ESRCH,
    }
}

/// POSIX `pthread_setcancelstate`.
#[unsafe(no_mangle)]
pub unsafe extern "C-unwind" fn uthread_setcancelstate(state: c_int, oldstate: *mut c_int) -> c_int {
    // SAFETY: caller-provided output pointer.
    unsafe { status_with(cancel::setcancelstate(state), oldstate) }
}

/// POSIX `pthread_setcanceltype`.
#[unsafe(no_mangle)]
pub unsafe extern "C-unwind" fn uthread_setcanceltype(kind: c_int, oldtype: *mut c_int) -> c_int {
    // SAFETY: caller-provided output pointer.
    unsafe { status_with(cancel::setcanceltype(kind), oldtype) }
}

/// POSIX `pthread_testcancel`.
#[unsafe(no_mangle)]
pub extern "C-unwind" fn uthread_testcancel() {
    cancel::testcancel();
}

/// `pthread_cleanup_push` as a function.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_cleanup_push(routine: Option<CleanupRoutine>, arg: *mut c_void) {
    if let Some(routine) = routine {
        // SAFETY: the caller keeps `arg` valid until the handler is popped.
        unsafe { cleanup::push_raw(routine, arg) };
    }
}

/// `pthread_cleanup_pop` as a function.
#[unsafe(no_mangle)]
pub extern "C" fn uthread_cleanup_pop(execute: c_int) {
    cleanup::pop_raw(execute != 0);
}

// ===========================================================================
// Thread-specific data
// ===========================================================================

/// POSIX `pthread_key_create`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_key_create(
    key: *mut uthread_key_t,
    destructor: Option<KeyDestructor>,
) -> c_int {
    if key.is_null() {
        return errno::EINVAL;
    }
    // SAFETY: validated non-null above.
    unsafe { status_with(tls::key_create(destructor), key) }
}

/// POSIX `pthread_key_delete`.
#[unsafe(no_mangle)]
pub extern "C" fn uthread_key_delete(key: uthread_key_t) -> c_int {
    tls::key_delete(key)
}

/// POSIX `pthread_getspecific`.
#[unsafe(no_mangle)]
pub extern "C" fn uthread_getspecific(key: uthread_key_t) -> *mut c_void {
    tls::getspecific(key)
}

/// POSIX `pthread_setspecific`.
#[unsafe(no_mangle)]
pub extern "C" fn uthread_setspecific(key: uthread_key_t, value: *const c_void) -> c_int {
    tls::setspecific(key, value)
}

// ===========================================================================
// Once
// ===========================================================================

/// POSIX `pthread_once`.
#[unsafe(no_mangle)]
pub unsafe extern "C-unwind" fn uthread_once(
    once_control: *mut uthread_once_t,
    init_routine: Option<OnceRoutine>,
) -> c_int {
    let Some(routine) = init_routine else {
        return errno::EINVAL;
    };
    // SAFETY: null or a live once object.
    let Some(once) = (unsafe { once_control.as_ref() }) else {
        return errno::EINVAL;
    };
    // SAFETY: the caller supplies a callable routine.
    once.call_once(|| unsafe { routine() })
}

// ===========================================================================
// Thread attributes
// ===========================================================================

/// POSIX `pthread_attr_init`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_attr_init(attr: *mut uthread_attr_t) -> c_int {
    if attr.is_null() {
        return errno::EINVAL;
    }
    // SAFETY: non-null; the storage is treated as uninitialized.
    unsafe { attr.write(ThreadAttr::new()) };
    0
}

/// POSIX `pthread_attr_destroy`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_attr_destroy(attr: *mut uthread_attr_t) -> c_int {
    if attr.is_null() {
        return errno::EINVAL;
    }
    // SAFETY: initialized by `uthread_attr_init` and not used afterwards.
    unsafe { std::ptr::drop_in_place(attr) };
    0
}

macro_rules! with_attr {
    ($attr:expr, |$a:ident| $body:expr) => {{
        // SAFETY: null or an initialized attribute object.
        match unsafe { $attr.as_mut() } {
            Some($a) => $body,
            None => errno::EINVAL,
        }
    }};
}

/// POSIX `pthread_attr_setdetachstate`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_attr_setdetachstate(attr: *mut uthread_attr_t, state: c_int) -> c_int {
    with_attr!(attr, |a| a.set_detach_state(state))
}

/// POSIX `pthread_attr_getdetachstate`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_attr_getdetachstate(
    attr: *mut uthread_attr_t,
    state: *mut c_int,
) -> c_int {
    // SAFETY: caller-provided output pointer.
    with_attr!(attr, |a| unsafe { status_with(Ok(a.detach_state()), state) })
}

/// POSIX `pthread_attr_setstacksize`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_attr_setstacksize(attr: *mut uthread_attr_t, size: usize) -> c_int {
    with_attr!(attr, |a| a.set_stack_size(size))
}

/// POSIX `pthread_attr_getstacksize`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_attr_getstacksize(
    attr: *mut uthread_attr_t,
    size: *mut usize,
) -> c_int {
    // SAFETY: caller-provided output pointer.
    with_attr!(attr, |a| unsafe { status_with(Ok(a.stack_size()), size) })
}

/// POSIX `pthread_attr_setguardsize`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_attr_setguardsize(attr: *mut uthread_attr_t, size: usize) -> c_int {
    with_attr!(attr, |a| a.set_guard_size(size))
}

/// POSIX `pthread_attr_getguardsize`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_attr_getguardsize(
    attr: *mut uthread_attr_t,
    size: *mut usize,
) -> c_int {
    // SAFETY: caller-provided output pointer.
    with_attr!(attr, |a| unsafe { status_with(Ok(a.guard_size()), size) })
}

/// POSIX `pthread_attr_setstack`. Caller-provided stacks are refused.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_attr_setstack(
    attr: *mut uthread_attr_t,
    stackaddr: *mut c_void,
    size: usize,
) -> c_int {
    with_attr!(attr, |a| a.set_stack(stackaddr as usize, size))
}

// ===========================================================================
// Miscellaneous
// ===========================================================================

/// POSIX `sched_yield` for runtime threads.
#[unsafe(no_mangle)]
pub extern "C" fn uthread_yield() -> c_int {
    thread::yield_now();
    0
}

/// POSIX `pthread_setconcurrency`.
#[unsafe(no_mangle)]
pub extern "C" fn uthread_setconcurrency(level: c_int) -> c_int {
    thread::setconcurrency(level)
}

/// POSIX `pthread_getconcurrency`.
#[unsafe(no_mangle)]
pub extern "C" fn uthread_getconcurrency() -> c_int {
    thread::getconcurrency()
}

/// Runtime identity of a live thread; `-1` with errno `ESRCH` otherwise.
#[unsafe(no_mangle)]
pub extern "C" fn uthread_gettid_np(thread: uthread_t) -> c_int {
    let result = resolve(thread)
        .ok_or(errno::ESRCH)
        .and_then(|target| thread::gettid_np(&target));
    match result {
        Ok(id) => id as c_int,
        Err(e) => errno_status(e),
    }
}

/// Calls `callback(handle, arg)` for every live thread; a negative return
/// stops the walk and is passed back.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_foreach_np(callback: Option<ForeachCallback>, arg: *mut c_void) -> c_int {
    let Some(callback) = callback else {
        return errno::EINVAL;
    };
    thread::foreach_np(|record| {
        // SAFETY: the caller supplies a callable routine valid for `arg`.
        unsafe { callback(record.addr(), arg) }
    })
}

/// Aborts the target's current blocking wait with `EINTR`.
#[unsafe(no_mangle)]
pub extern "C" fn uthread_interrupt_np(thread: uthread_t) -> c_int {
    match resolve(thread) {
        Some(target) => thread::interrupt_np(&target),
        None => errno::ESRCH,
    }
}

/// POSIX `pthread_getschedparam`. Scheduling is left to the OS.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uthread_getschedparam(
    thread: uthread_t,
    policy: *mut c_int,
    _param: *mut c_void,
) -> c_int {
    let Some(target) = resolve(thread) else {
        return errno::ESRCH;
    };
    // SAFETY: caller-provided output pointer.
    unsafe { write_out(policy, libc::SCHED_OTHER) };
    thread::getschedparam(&target)
}

/// POSIX `pthread_setschedparam`.
#[unsafe(no_mangle)]
pub extern "C" fn uthread_setschedparam(thread: uthread_t, _policy: c_int, priority: c_int) -> c_int {
    match resolve(thread) {
        Some(target) => thread::setschedparam(&target, priority),
        None => errno::ESRCH,
    }
}

/// POSIX `pthread_setschedprio`.
#[unsafe(no_mangle)]
pub extern "C" fn uthread_setschedprio(thread: uthread_t, priority: c_int) -> c_int {
    match resolve(thread) {
        Some(target) => thread::setschedprio(&target, priority),
        None => errno::ESRCH,
    }
}
