//! Thread exit by forced unwind.

use std::panic;

use super::cleanup;
use super::registry;
use super::thread::{self, ThreadFlags};

/// Exit value of a cancelled thread.
pub const PTHREAD_CANCELED: usize = usize::MAX;

/// Unwind payload carrying a thread out of its start routine. The thread
/// entry catches and disarms it; an armed marker that is dropped anywhere
/// else means some frame swallowed the unwind, and the process aborts.
#[derive(Debug)]
pub struct ThreadExit {
    armed: bool,
}

impl ThreadExit {
    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ThreadExit {
    fn drop(&mut self) {
        if self.armed {
            tracing::error!("thread exit unwind was caught and discarded; aborting");
            std::process::abort();
        }
    }
}

/// Terminates the calling thread with `retval`.
///
/// Cleanup handlers run innermost first, then the stack unwinds to the
/// thread entry, dropping every live frame on the way. When the main
/// thread exits, the process stays up until every other runtime thread has
/// finished and then exits with status 0.
pub fn exit(retval: usize) -> ! {
    let me = thread::current();
    me.set_retval(retval);
    me.update_flags(|f| f | ThreadFlags::EXITING);
    cleanup::run_all();

    if me.is_main() {
        thread::finish(&me);
        drop(me);
        registry::wait_for_live_threads();
        tracing::debug!("main thread exited after the last runtime thread");
        std::process::exit(0);
    }

    let adopted = me.flags().contains(ThreadFlags::ADOPTED);
    if adopted {
        // Nothing catches the marker on a foreign thread; publish the exit
        // now so joiners and the registry see it.
        thread::finish(&me);
    }
    drop(me);
    panic::resume_unwind(Box::new(ThreadExit { armed: !adopted }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pthread::cleanup::{depth, with_cleanup};
    use crate::pthread::thread::{create, join};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Bump(Arc<AtomicUsize>);

    impl Drop for Bump {
        fn drop(&mut self) {
            self.0.fetch_add(10, Ordering::SeqCst);
        }
    }

    #[test]
    fn exit_value_reaches_joiner() {
        let t = create(None, || exit(77)).unwrap();
        assert_eq!(join(&t), Ok(77));
    }

    #[test]
    fn exit_runs_handlers_then_drops_frames() {
        let hits = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&hits);
        let t = create(None, move || {
            let _guard = Bump(Arc::clone(&inner));
            with_cleanup(
                &*inner,
                |h| {
                    // Runs before any destructor.
                    assert_eq!(h.load(Ordering::SeqCst), 0);
                    h.fetch_add(1, Ordering::SeqCst);
                },
                || -> usize { exit(3) },
            )
        })
        .unwrap();
        assert_eq!(join(&t), Ok(3));
        assert_eq!(hits.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn handler_stack_is_empty_after_exit() {
        let t = create(None, || with_cleanup(&(), |_| {}, || -> usize { exit(0) }))
            .map(|t| join(&t));
        assert_eq!(t, Ok(Ok(0)));
        assert_eq!(depth(), 0);
    }
}
