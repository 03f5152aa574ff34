//! Thread cancellation: state, type, requests and cancellation points.
//!
//! Cancellation is cooperative. A request sets `CANCELLED` on the target;
//! the target acts on it at the next cancellation point, or immediately
//! when it runs in asynchronous mode. "Immediately" means at the next
//! runtime call or blocking wait, which `cancel` interrupts: threads are
//! never stopped at arbitrary instructions.
//!
//! Every blocking wait inside a cancellation point is bracketed by
//! [`cancelpoint_begin`] and [`cancelpoint_end`], which switch a deferred
//! thread to asynchronous mode for the duration of the wait.

use std::sync::Arc;

use super::exit::{PTHREAD_CANCELED, exit};
use super::thread::{self, ThreadFlags, ThreadRecord};
use crate::errno;

pub const PTHREAD_CANCEL_DISABLE: i32 = 0;
pub const PTHREAD_CANCEL_ENABLE: i32 = 1;
pub const PTHREAD_CANCEL_DEFERRED: i32 = 2;
pub const PTHREAD_CANCEL_ASYNCHRONOUS: i32 = 3;

#[must_use]
pub const fn valid_cancel_state(state: i32) -> bool {
    matches!(state, PTHREAD_CANCEL_DISABLE | PTHREAD_CANCEL_ENABLE)
}

#[must_use]
pub const fn valid_cancel_type(kind: i32) -> bool {
    matches!(kind, PTHREAD_CANCEL_DEFERRED | PTHREAD_CANCEL_ASYNCHRONOUS)
}

fn act_if_async_due(flags: ThreadFlags) {
    if flags.async_cancel_due() {
        exit(PTHREAD_CANCELED);
    }
}

/// Enables or disables cancellation for the calling thread and returns the
/// previous state.
pub fn setcancelstate(state: i32) -> Result<i32, i32> {
    if !valid_cancel_state(state) {
        return Err(errno::EINVAL);
    }
    let me = thread::current();
    let (old, new) = me.update_flags(|f| {
        if state == PTHREAD_CANCEL_DISABLE {
            f | ThreadFlags::CANCEL_DISABLE
        } else {
            f - ThreadFlags::CANCEL_DISABLE
        }
    });
    act_if_async_due(new);
    Ok(if old.contains(ThreadFlags::CANCEL_DISABLE) {
        PTHREAD_CANCEL_DISABLE
    } else {
        PTHREAD_CANCEL_ENABLE
    })
}

/// Selects deferred or asynchronous cancellation and returns the previous
/// type.
pub fn setcanceltype(kind: i32) -> Result<i32, i32> {
    if !valid_cancel_type(kind) {
        return Err(errno::EINVAL);
    }
    let me = thread::current();
    let (old, new) = me.update_flags(|f| {
        if kind == PTHREAD_CANCEL_ASYNCHRONOUS {
            f | ThreadFlags::CANCEL_ASYNC
        } else {
            f - ThreadFlags::CANCEL_ASYNC
        }
    });
    act_if_async_due(new);
    Ok(if old.contains(ThreadFlags::CANCEL_ASYNC) {
        PTHREAD_CANCEL_ASYNCHRONOUS
    } else {
        PTHREAD_CANCEL_DEFERRED
    })
}

/// Explicit cancellation point.
pub fn testcancel() {
    if thread::current().flags().cancel_due() {
        exit(PTHREAD_CANCELED);
    }
}

/// Requests cancellation of `target`. `ESRCH` if it has finished.
pub fn cancel(target: &Arc<ThreadRecord>) -> i32 {
    if target.id() == 0 || target.is_reaped() {
        return errno::ESRCH;
    }
    let (old, new) =
        target.update_flags(|f| f | ThreadFlags::CANCELLING | ThreadFlags::CANCELLED);
    if !old.contains(ThreadFlags::CANCELLED) {
        tracing::debug!(
            id = target.id(),
            asynchronous = new.contains(ThreadFlags::CANCEL_ASYNC),
            "cancellation requested"
        );
    }
    if new.async_cancel_due() {
        if Arc::ptr_eq(target, &thread::current()) {
            exit(PTHREAD_CANCELED);
        }
        target.waiter().interrupt();
    }
    0
}

/// Enters a cancellation point. Returns whether the thread was switched to
/// asynchronous mode, to be handed back to [`cancelpoint_end`].
pub fn cancelpoint_begin() -> bool {
    let me = thread::current();
    let flags = me.flags();
    if flags.intersects(ThreadFlags::CANCEL_ASYNC | ThreadFlags::CANCEL_DISABLE) {
        act_if_async_due(flags);
        return false;
    }
    let (_, new) =
        me.update_flags(|f| f | ThreadFlags::CANCEL_ASYNC | ThreadFlags::CANCEL_TRANS);
    act_if_async_due(new);
    true
}

/// Leaves a cancellation point entered with [`cancelpoint_begin`].
pub fn cancelpoint_end(switched: bool) {
    let me = thread::current();
    act_if_async_due(me.flags());
    if switched {
        me.update_flags(|f| f - (ThreadFlags::CANCEL_ASYNC | ThreadFlags::CANCEL_TRANS));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pthread::thread::{create, join};
    use crate::sync::waitchan::{self, WaitFlags};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::mpsc;

    #[test]
    fn invalid_arguments() {
        assert_eq!(setcancelstate(7), Err(errno::EINVAL));
        assert_eq!(setcanceltype(-1), Err(errno::EINVAL));
    }

    #[test]
    fn state_and_type_report_previous_values() {
        let t = create(None, || {
            let a = setcancelstate(PTHREAD_CANCEL_DISABLE).unwrap();
            let b = setcancelstate(PTHREAD_CANCEL_ENABLE).unwrap();
            let c = setcanceltype(PTHREAD_CANCEL_ASYNCHRONOUS).unwrap();
            let d = setcanceltype(PTHREAD_CANCEL_DEFERRED).unwrap();
            assert_eq!(
                (a, b, c, d),
                (
                    PTHREAD_CANCEL_ENABLE,
                    PTHREAD_CANCEL_DISABLE,
                    PTHREAD_CANCEL_DEFERRED,
                    PTHREAD_CANCEL_ASYNCHRONOUS
                )
            );
            1
        })
        .unwrap();
        assert_eq!(join(&t), Ok(1));
    }

    #[test]
    fn deferred_cancel_acts_at_testcancel() {
        let (tx, rx) = mpsc::channel::<()>();
        let (ready_tx, ready_rx) = mpsc::channel::<()>();
        let t = create(None, move || {
            ready_tx.send(()).unwrap();
            rx.recv().unwrap();
            testcancel();
            0
        })
        .unwrap();
        ready_rx.recv().unwrap();
        assert_eq!(cancel(&t), 0);
        tx.send(()).unwrap();
        assert_eq!(join(&t), Ok(PTHREAD_CANCELED));
    }

    #[test]
    fn disabled_cancel_is_held_until_enabled() {
        let (tx, rx) = mpsc::channel::<()>();
        let (ready_tx, ready_rx) = mpsc::channel::<()>();
        let t = create(None, move || {
            setcancelstate(PTHREAD_CANCEL_DISABLE).unwrap();
            ready_tx.send(()).unwrap();
            rx.recv().unwrap();
            testcancel();
            setcancelstate(PTHREAD_CANCEL_ENABLE).unwrap();
            testcancel();
            3
        })
        .unwrap();
        ready_rx.recv().unwrap();
        cancel(&t);
        tx.send(()).unwrap();
        assert_eq!(join(&t), Ok(PTHREAD_CANCELED));
    }

    #[test]
    fn cancel_wakes_a_blocked_cancellation_point() {
        static WORD: AtomicU32 = AtomicU32::new(0);
        let t = create(None, || {
            loop {
                let prev = cancelpoint_begin();
                waitchan::wait(&WORD, 0, None, WaitFlags::empty());
                cancelpoint_end(prev);
            }
        })
        .unwrap();
        while !t.waiter().is_parked() {
            std::thread::yield_now();
        }
        assert_eq!(cancel(&t), 0);
        assert_eq!(join(&t), Ok(PTHREAD_CANCELED));
        assert_eq!(WORD.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn async_self_cancel_exits_immediately() {
        let t = create(None, || {
            setcanceltype(PTHREAD_CANCEL_ASYNCHRONOUS).unwrap();
            cancel(&thread::current());
            5
        })
        .unwrap();
        assert_eq!(join(&t), Ok(PTHREAD_CANCELED));
    }

    #[test]
    fn cancel_of_finished_thread_is_esrch() {
        let t = create(None, || 0).unwrap();
        join(&t).unwrap();
        assert_eq!(cancel(&t), errno::ESRCH);
    }
}
