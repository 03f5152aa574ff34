//! Spinlocks. No waiters are ever parked; contended lockers spin a bounded
//! number of times and then yield the processor.

use std::sync::atomic::{AtomicU32, Ordering};

use super::attr::{PTHREAD_PROCESS_PRIVATE, PTHREAD_PROCESS_SHARED};
use crate::errno;

const SPIN_UNLOCKED: u32 = 0;
const SPIN_LOCKED: u32 = 1;
const SPIN_LIMIT: u32 = 1000;

#[derive(Debug, Default)]
pub struct SpinLock {
    word: AtomicU32,
}

impl SpinLock {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            word: AtomicU32::new(SPIN_UNLOCKED),
        }
    }

    /// `EINVAL` for an unknown `pshared` value.
    pub fn init(&self, pshared: i32) -> i32 {
        if pshared != PTHREAD_PROCESS_PRIVATE && pshared != PTHREAD_PROCESS_SHARED {
            return errno::EINVAL;
        }
        self.word.store(SPIN_UNLOCKED, Ordering::Release);
        0
    }

    pub fn lock(&self) -> i32 {
        loop {
            if self.word.swap(SPIN_LOCKED, Ordering::Acquire) == SPIN_UNLOCKED {
                return 0;
            }
            let mut spins = 0;
            while self.word.load(Ordering::Relaxed) != SPIN_UNLOCKED {
                spins += 1;
                if spins >= SPIN_LIMIT {
                    std::thread::yield_now();
                    spins = 0;
                } else {
                    std::hint::spin_loop();
                }
            }
        }
    }

    pub fn trylock(&self) -> i32 {
        match self.word.compare_exchange(
            SPIN_UNLOCKED,
            SPIN_LOCKED,
            Ordering::Acquire,
            Ordering::Relaxed,
        ) {
            Ok(_) => 0,
            Err(_) => errno::EBUSY,
        }
    }

    pub fn unlock(&self) -> i32 {
        self.word.store(SPIN_UNLOCKED, Ordering::Release);
        0
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.word.load(Ordering::Relaxed) != SPIN_UNLOCKED
    }

    pub fn destroy(&self) -> i32 {
        0
    }
}
