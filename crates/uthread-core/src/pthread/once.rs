//! One-time initialization, fork-aware.
//!
//! The control word is `ONCE_INIT`, `ONCE_DONE`, or an in-progress token
//! `(pid << 2) | 1` naming the process whose thread is running the
//! routine. A child forked while the routine ran inherits a token with
//! its parent's pid; nobody in the child will ever finish it, so a token
//! from another process is treated as stale and taken over.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};

use super::cleanup;
use super::exit::ThreadExit;
use crate::sync::liveness;
use crate::sync::waitchan::{self, WaitFlags};

pub const ONCE_INIT: u32 = 0;
pub const ONCE_IN_PROGRESS: u32 = 1;
pub const ONCE_DONE: u32 = 2;

#[inline]
fn in_progress_token() -> u32 {
    (liveness::current_process() << 2) | ONCE_IN_PROGRESS
}

fn abandon(word: &AtomicU32) {
    waitchan::set_wake(word, ONCE_INIT, WaitFlags::BROADCAST);
}

#[derive(Debug, Default)]
pub struct Once {
    word: AtomicU32,
}

impl Once {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            word: AtomicU32::new(ONCE_INIT),
        }
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.word.load(Ordering::Acquire) == ONCE_DONE
    }

    /// Raw control word.
    #[must_use]
    pub fn state(&self) -> u32 {
        self.word.load(Ordering::Acquire)
    }

    /// Runs `routine` unless it has already completed. Concurrent callers
    /// wait for the running one. If the routine is abandoned (the thread
    /// exits or panics inside it) the control word is reset so a later
    /// caller runs it again.
    pub fn call_once(&self, routine: impl FnOnce()) -> i32 {
        loop {
            let val = self.word.load(Ordering::Acquire);
            if val == ONCE_DONE {
                return 0;
            }
            let token = in_progress_token();
            if val == token {
                waitchan::wait(&self.word, token, None, WaitFlags::empty());
                continue;
            }
            if self
                .word
                .compare_exchange(val, token, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            if val != ONCE_INIT {
                tracing::debug!(stale = val, "once control held by another process; taking over");
            }

            let ran = cleanup::with_cleanup(&self.word, abandon, || {
                panic::catch_unwind(AssertUnwindSafe(routine))
            });
            if let Err(payload) = ran {
                // A thread exit already ran the cleanup handler.
                if !payload.is::<ThreadExit>() {
                    abandon(&self.word);
                }
                panic::resume_unwind(payload);
            }
            waitchan::set_wake(&self.word, ONCE_DONE, WaitFlags::BROADCAST);
            return 0;
        }
    }
}
