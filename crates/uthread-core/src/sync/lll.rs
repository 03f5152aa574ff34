//! Low-level locks on a single 32-bit word.
//!
//! Plain locks use the classic three-state word: 0 free, 1 held, 2 held
//! with possible waiters. Unlock only wakes when it observed state 2.
//!
//! Robust locks store the owning process id in the word, with bit 31
//! flagging waiters and bit 30 flagging that the previous owner died.
//! Acquisition polls the liveness oracle with a doubling sleep slice so a
//! dead owner is eventually noticed and the lock claimed (`EOWNERDEAD`).

use std::sync::atomic::{AtomicU32, Ordering};

use crate::config;
use crate::errno;
use crate::sync::liveness;
use crate::sync::waitchan::{self, WaitFlags, WaitStatus};
use crate::time::Timespec;

pub const LLL_FREE: u32 = 0;
pub const LLL_LOCKED: u32 = 1;
pub const LLL_CONTENDED: u32 = 2;

/// Robust word: at least one waiter may be blocked.
pub const LLL_WAITERS: u32 = 1 << 31;
/// Robust word: the lock was claimed from a dead owner and not yet made consistent.
pub const LLL_DEAD_OWNER: u32 = 1 << 30;
/// Robust word: bits holding the owner process id.
pub const LLL_OWNER_MASK: u32 = !(LLL_WAITERS | LLL_DEAD_OWNER);

// ---------------------------------------------------------------------------
// Plain lock
// ---------------------------------------------------------------------------

#[inline]
fn try_fast(word: &AtomicU32) -> bool {
    word.compare_exchange(LLL_FREE, LLL_LOCKED, Ordering::Acquire, Ordering::Relaxed)
        .is_ok()
}

pub fn lock(word: &AtomicU32, flags: WaitFlags) {
    if try_fast(word) {
        return;
    }
    while word.swap(LLL_CONTENDED, Ordering::Acquire) != LLL_FREE {
        waitchan::wait(word, LLL_CONTENDED, None, flags);
    }
}

pub fn trylock(word: &AtomicU32) -> i32 {
    if word.load(Ordering::Relaxed) == LLL_FREE && try_fast(word) {
        0
    } else {
        errno::EBUSY
    }
}

/// Like [`lock`] with an absolute deadline on `clock_id`. The deadline is
/// only looked at once the uncontended attempt has failed.
pub fn timedlock(word: &AtomicU32, abstime: &Timespec, clock_id: i32, flags: WaitFlags) -> i32 {
    if try_fast(word) {
        return 0;
    }
    loop {
        if word.swap(LLL_CONTENDED, Ordering::Acquire) == LLL_FREE {
            return 0;
        }
        let left = match abstime.remaining(clock_id) {
            Ok(left) => left,
            Err(e) => return e,
        };
        if waitchan::wait(word, LLL_CONTENDED, Some(left), flags | WaitFlags::TIMED)
            == WaitStatus::TimedOut
        {
            return errno::ETIMEDOUT;
        }
    }
}

/// Acquires assuming contention: the word is left at 2 so the matching
/// unlock always wakes. Used when a condition variable waiter returns to
/// its mutex, since other waiters may have been requeued behind it.
pub fn lock_contended(word: &AtomicU32, flags: WaitFlags) {
    while word.swap(LLL_CONTENDED, Ordering::Acquire) != LLL_FREE {
        waitchan::wait(word, LLL_CONTENDED, None, flags);
    }
}

pub fn unlock(word: &AtomicU32, flags: WaitFlags) {
    if word.swap(LLL_FREE, Ordering::Release) != LLL_LOCKED {
        waitchan::wake_word(word, flags);
    }
}

// ---------------------------------------------------------------------------
// Robust lock
// ---------------------------------------------------------------------------

pub fn robust_lock(word: &AtomicU32, flags: WaitFlags) -> i32 {
    robust_acquire(word, None, flags)
}

pub fn robust_timedlock(
    word: &AtomicU32,
    abstime: &Timespec,
    clock_id: i32,
    flags: WaitFlags,
) -> i32 {
    robust_acquire(word, Some((abstime, clock_id)), flags)
}

fn robust_acquire(word: &AtomicU32, deadline: Option<(&Timespec, i32)>, flags: WaitFlags) -> i32 {
    let oracle = liveness::oracle();
    let me = oracle.current_process() & LLL_OWNER_MASK;

    // Take it while free, otherwise make sure the holder will wake us.
    loop {
        let val = word.load(Ordering::SeqCst);
        if val == LLL_FREE {
            if word
                .compare_exchange(LLL_FREE, me, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return 0;
            }
        } else if val & LLL_WAITERS != 0
            || word
                .compare_exchange(val, val | LLL_WAITERS, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
        {
            break;
        }
    }

    // We announced ourselves as a waiter, so whatever we store from now on
    // keeps the waiters bit for the others still queued.
    let claim = me | LLL_WAITERS;
    let cfg = config::runtime_config();
    let mut slice = cfg.robust_poll;
    loop {
        let val = word.load(Ordering::SeqCst);
        if val == LLL_FREE {
            if word
                .compare_exchange(LLL_FREE, claim, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return 0;
            }
            continue;
        }

        let owner = val & LLL_OWNER_MASK;
        if !oracle.is_alive(owner) {
            if word
                .compare_exchange(val, claim, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                tracing::warn!(
                    owner,
                    claimant = me,
                    "robust lock owner died; lock claimed"
                );
                return errno::EOWNERDEAD;
            }
            continue;
        }

        let mut wait_for = slice;
        if let Some((abstime, clock_id)) = deadline {
            // A slice expiring is not a timeout; only the deadline is.
            match abstime.remaining(clock_id) {
                Ok(left) => wait_for = wait_for.min(left),
                Err(e) => return e,
            }
        }
        waitchan::wait(word, val, Some(wait_for), flags | WaitFlags::TIMED);
        slice = (slice * 2).min(cfg.robust_poll_max);
    }
}

pub fn robust_trylock(word: &AtomicU32) -> i32 {
    let oracle = liveness::oracle();
    let me = oracle.current_process() & LLL_OWNER_MASK;
    let val = word.load(Ordering::SeqCst);
    if val == LLL_FREE {
        if word
            .compare_exchange(LLL_FREE, me, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return 0;
        }
    } else if !oracle.is_alive(val & LLL_OWNER_MASK)
        && word
            .compare_exchange(val, me | (val & LLL_WAITERS), Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    {
        tracing::warn!(owner = val & LLL_OWNER_MASK, claimant = me, "robust lock owner died; lock claimed");
        return errno::EOWNERDEAD;
    }
    errno::EBUSY
}

pub fn robust_unlock(word: &AtomicU32, flags: WaitFlags) {
    loop {
        let val = word.load(Ordering::SeqCst);
        if val & LLL_WAITERS != 0 {
            waitchan::set_wake(word, LLL_FREE, flags);
            return;
        }
        if word
            .compare_exchange(val, LLL_FREE, Ordering::Release, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use crate::config::RuntimeConfig;
    use crate::time::CLOCK_MONOTONIC;

    fn fast_polling() {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
        config::override_for_tests(RuntimeConfig {
            robust_poll: Duration::from_millis(2),
            robust_poll_max: Duration::from_millis(20),
            ..RuntimeConfig::default()
        });
    }

    #[test]
    fn uncontended_lock_stays_at_one() {
        let w = AtomicU32::new(0);
        lock(&w, WaitFlags::empty());
        assert_eq!(w.load(Ordering::SeqCst), LLL_LOCKED);
        assert_eq!(trylock(&w), errno::EBUSY);
        unlock(&w, WaitFlags::empty());
        assert_eq!(w.load(Ordering::SeqCst), LLL_FREE);
        assert_eq!(trylock(&w), 0);
    }

    #[test]
    fn contended_lock_excludes() {
        let w = Arc::new(AtomicU32::new(0));
        let counter = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let (w, c) = (Arc::clone(&w), Arc::clone(&counter));
            handles.push(thread::spawn(move || {
                for _ in 0..2_000 {
                    lock(&w, WaitFlags::empty());
                    // Non-atomic read-modify-write under the lock.
                    let v = c.load(Ordering::Relaxed);
                    c.store(v + 1, Ordering::Relaxed);
                    unlock(&w, WaitFlags::empty());
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 8_000);
    }

    #[test]
    fn timedlock_ignores_bad_deadline_when_free() {
        let w = AtomicU32::new(0);
        let bogus = Timespec::new(0, -1);
        assert_eq!(timedlock(&w, &bogus, CLOCK_MONOTONIC, WaitFlags::empty()), 0);
        assert_eq!(
            timedlock(&w, &bogus, CLOCK_MONOTONIC, WaitFlags::empty()),
            errno::EINVAL
        );
    }

    #[test]
    fn timedlock_times_out_while_held() {
        let w = AtomicU32::new(LLL_LOCKED);
        let deadline = Timespec::after(CLOCK_MONOTONIC, Duration::from_millis(30));
        let start = Instant::now();
        assert_eq!(
            timedlock(&w, &deadline, CLOCK_MONOTONIC, WaitFlags::empty()),
            errno::ETIMEDOUT
        );
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn lock_contended_forces_wake_on_unlock() {
        let w = AtomicU32::new(0);
        lock_contended(&w, WaitFlags::empty());
        assert_eq!(w.load(Ordering::SeqCst), LLL_CONTENDED);
        unlock(&w, WaitFlags::empty());
        assert_eq!(w.load(Ordering::SeqCst), LLL_FREE);
    }

    #[test]
    fn robust_lock_records_pid() {
        let w = AtomicU32::new(0);
        assert_eq!(robust_lock(&w, WaitFlags::SHARED), 0);
        let me = liveness::current_process() & LLL_OWNER_MASK;
        assert_eq!(w.load(Ordering::SeqCst), me);
        assert_eq!(robust_trylock(&w), errno::EBUSY);
        robust_unlock(&w, WaitFlags::SHARED);
        assert_eq!(w.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn robust_lock_claims_from_dead_owner() {
        fast_polling();
        let scripted = liveness::install_scripted();
        let ghost = 0x0ABC_0001;
        scripted.mark_dead(ghost);
        let w = AtomicU32::new(ghost);
        assert_eq!(robust_lock(&w, WaitFlags::SHARED), errno::EOWNERDEAD);
        let v = w.load(Ordering::SeqCst);
        assert_eq!(v & LLL_OWNER_MASK, liveness::current_process() & LLL_OWNER_MASK);

        let w = AtomicU32::new(ghost | LLL_WAITERS);
        assert_eq!(robust_trylock(&w), errno::EOWNERDEAD);
        assert_ne!(w.load(Ordering::SeqCst) & LLL_WAITERS, 0);
    }

    #[test]
    fn robust_timedlock_waits_full_deadline_across_slices() {
        fast_polling();
        let scripted = liveness::install_scripted();
        let live_owner = 0x0ABC_0002;
        scripted.revive(live_owner);
        let w = AtomicU32::new(live_owner);
        let deadline = Timespec::after(CLOCK_MONOTONIC, Duration::from_millis(60));
        let start = Instant::now();
        assert_eq!(
            robust_timedlock(&w, &deadline, CLOCK_MONOTONIC, WaitFlags::SHARED),
            errno::ETIMEDOUT
        );
        // Several 2ms slices elapse before the deadline is reported.
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_ne!(w.load(Ordering::SeqCst) & LLL_WAITERS, 0);
    }

    #[test]
    fn robust_unlock_wakes_polling_waiter() {
        fast_polling();
        let w = Arc::new(AtomicU32::new(0));
        assert_eq!(robust_lock(&w, WaitFlags::empty()), 0);
        let w2 = Arc::clone(&w);
        let h = thread::spawn(move || robust_lock(&w2, WaitFlags::empty()));
        while w.load(Ordering::SeqCst) & LLL_WAITERS == 0 {
            thread::yield_now();
        }
        robust_unlock(&w, WaitFlags::empty());
        assert_eq!(h.join().unwrap(), 0);
        robust_unlock(&w, WaitFlags::empty());
    }
}
