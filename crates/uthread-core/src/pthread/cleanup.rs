//! Per-thread cleanup-handler stack.
//!
//! Handlers are pushed and popped in strict LIFO order. `exit` (and so
//! cancellation) runs every handler still registered, innermost first,
//! before unwinding the thread. Two kinds of frames exist:
//!
//! - raw frames from the C ABI (`extern "C"` routine plus argument);
//! - scoped frames installed by [`with_cleanup`] around a blocking call
//!   inside the runtime. They borrow a context from the caller's stack and
//!   are removed when the call returns.

use std::cell::RefCell;
use std::ffi::c_void;

/// C cleanup routine.
pub type CleanupRoutine = unsafe extern "C" fn(*mut c_void);

enum Frame {
    Raw {
        routine: CleanupRoutine,
        arg: usize,
    },
    Scoped {
        call: unsafe fn(*const ()),
        data: *const (),
    },
}

thread_local! {
    static STACK: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

fn pop_frame() -> Option<Frame> {
    STACK.try_with(|s| s.borrow_mut().pop()).ok().flatten()
}

/// # Safety
///
/// Each frame's pointers must be valid at the moment it runs.
unsafe fn run_frame(frame: Frame) {
    match frame {
        // SAFETY: upheld by the caller of `push_raw`.
        Frame::Raw { routine, arg } => unsafe { routine(arg as *mut c_void) },
        // SAFETY: scoped frames only exist while their `with_cleanup`
        // call is on the stack, which is what `data` points into.
        Frame::Scoped { call, data } => unsafe { call(data) },
    }
}

/// Registers a C cleanup handler.
///
/// # Safety
///
/// `routine` must be safe to call with `arg` until the frame is popped or
/// run.
pub unsafe fn push_raw(routine: CleanupRoutine, arg: *mut c_void) {
    let _ = STACK.try_with(|s| {
        s.borrow_mut().push(Frame::Raw {
            routine,
            arg: arg as usize,
        })
    });
}

/// Removes the innermost raw handler, running it when `execute` is set.
/// A scoped frame on top is left alone: it belongs to a runtime call that
/// is still in progress.
pub fn pop_raw(execute: bool) {
    let frame = STACK
        .try_with(|s| {
            let mut s = s.borrow_mut();
            match s.last() {
                Some(Frame::Raw { .. }) => s.pop(),
                Some(Frame::Scoped { .. }) => {
                    tracing::warn!("cleanup pop does not match the innermost push; ignored");
                    None
                }
                None => None,
            }
        })
        .ok()
        .flatten();
    if let Some(frame) = frame {
        if execute {
            // SAFETY: the frame came from `push_raw`, whose contract covers it.
            unsafe { run_frame(frame) };
        }
    }
}

/// Number of registered handlers on the calling thread.
pub fn depth() -> usize {
    STACK.try_with(|s| s.borrow().len()).unwrap_or(0)
}

/// Runs and removes every handler, innermost first. Handlers may push and
/// pop handlers of their own.
pub(crate) fn run_all() {
    while let Some(frame) = pop_frame() {
        // SAFETY: raw frames are covered by `push_raw`; scoped frames are
        // still inside their `with_cleanup` call since `run_all` is only
        // reached from `exit`, before any unwinding happens.
        unsafe { run_frame(frame) };
    }
}

struct Scoped<'a, C> {
    ctx: &'a C,
    handler: fn(&C),
}

unsafe fn call_scoped<C>(data: *const ()) {
    // SAFETY: `data` was produced from a live `Scoped<C>` by `with_cleanup`.
    let scoped = unsafe { &*data.cast::<Scoped<'_, C>>() };
    (scoped.handler)(scoped.ctx);
}

struct Truncate(usize);

impl Drop for Truncate {
    fn drop(&mut self) {
        let _ = STACK.try_with(|s| s.borrow_mut().truncate(self.0));
    }
}

/// Runs `body` with `handler(ctx)` registered as a cleanup handler. If the
/// thread exits inside `body` the handler runs; otherwise it is discarded
/// when `body` returns.
pub fn with_cleanup<C, R>(ctx: &C, handler: fn(&C), body: impl FnOnce() -> R) -> R {
    let scoped = Scoped { ctx, handler };
    let depth = STACK
        .try_with(|s| {
            let mut s = s.borrow_mut();
            s.push(Frame::Scoped {
                call: call_scoped::<C>,
                data: (&scoped as *const Scoped<'_, C>).cast(),
            });
            s.len() - 1
        })
        .unwrap_or(usize::MAX);
    let _guard = Truncate(depth);
    body()
}
