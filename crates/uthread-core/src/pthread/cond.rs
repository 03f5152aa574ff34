//! POSIX condition variables.
//!
//! State is a [`PairedCounter`] of (wakeup sequence, waiter count). A
//! waiter registers itself and captures the sequence before it releases
//! the mutex, then blocks on the sequence limb until a signal or broadcast
//! moves it. Spurious returns are allowed; callers loop on their predicate.
//!
//! Process-private condition variables remember the mutex they are used
//! with so broadcast can move all but one waiter straight onto the mutex
//! queue instead of waking a herd that would immediately block again.
//! Using one condition variable with several mutexes disables that.

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicUsize, Ordering};

use super::attr::{ATTR_SHARED, CondAttr};
use super::cancel;
use super::cleanup;
use super::mutex::Mutex;
use crate::errno;
use crate::sync::paired::{Limb, PairedCounter};
use crate::sync::waitchan::{self, WaitFlags, WaitKey, WaitStatus};
use crate::time::{CLOCK_MONOTONIC, CLOCK_REALTIME, Timespec, valid_clock_id};

pub const PTHREAD_COND_CLOCK_REALTIME: i32 = CLOCK_REALTIME;
pub const PTHREAD_COND_CLOCK_MONOTONIC: i32 = CLOCK_MONOTONIC;

/// Cached-mutex value once the condvar has seen more than one mutex.
const MIXED_MUTEXES: usize = usize::MAX;

/// Set in `flags` by destroy, cleared by init.
const COND_DESTROYED: u32 = 0x8000_0000;

#[derive(Debug)]
pub struct Cond {
    sw: PairedCounter,
    mutex_key: AtomicUsize,
    flags: AtomicU32,
    clock: AtomicI32,
}

impl Default for Cond {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a blocking wait ended without a wakeup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Abandoned {
    Errno(i32),
    Interrupted,
}

struct WaitCtx<'a> {
    cond: &'a Cond,
    mutex: &'a Mutex,
    seq: u32,
}

/// Runs if the waiter is cancelled while blocked: leave the waiter count
/// consistent, pass on a wakeup we may have consumed, and exit holding the
/// mutex.
fn abandon_wait(ctx: &WaitCtx<'_>) {
    let (seq, _) = ctx.cond.sw.add_hi(-1);
    if seq != ctx.seq {
        ctx.cond.wake_all();
    }
    let _ = ctx.mutex.cond_lock();
}

impl Cond {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            sw: PairedCounter::new(0, 0),
            mutex_key: AtomicUsize::new(0),
            flags: AtomicU32::new(0),
            clock: AtomicI32::new(CLOCK_REALTIME),
        }
    }

    #[must_use]
    pub fn with_attr(attr: &CondAttr) -> Self {
        let cv = Self::new();
        cv.flags.store(attr.flags(), Ordering::Relaxed);
        cv.clock.store(attr.clock(), Ordering::Relaxed);
        cv
    }

    /// (Re)initializes. `EBUSY` while threads are waiting.
    pub fn init(&self, attr: Option<&CondAttr>) -> i32 {
        if self.sw.hi() != 0 {
            return errno::EBUSY;
        }
        let attr = attr.copied().unwrap_or_default();
        if !valid_clock_id(attr.clock()) {
            return errno::EINVAL;
        }
        self.sw.store(0, 0);
        self.mutex_key.store(0, Ordering::Relaxed);
        self.flags.store(attr.flags(), Ordering::SeqCst);
        self.clock.store(attr.clock(), Ordering::Relaxed);
        0
    }

    /// `EINVAL` if already destroyed; every later operation but
    /// [`Self::init`] then fails with `EINVAL` too.
    pub fn destroy(&self) -> i32 {
        if self.is_destroyed() {
            return errno::EINVAL;
        }
        if self.sw.hi() != 0 {
            return errno::EBUSY;
        }
        self.mutex_key.store(0, Ordering::Relaxed);
        self.flags.fetch_or(COND_DESTROYED, Ordering::SeqCst);
        0
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.flags.load(Ordering::SeqCst) & COND_DESTROYED != 0
    }

    #[must_use]
    pub fn waiters(&self) -> u32 {
        self.sw.hi()
    }

    #[must_use]
    pub fn sequence(&self) -> u32 {
        self.sw.lo()
    }

    #[must_use]
    pub fn clock(&self) -> i32 {
        self.clock.load(Ordering::Relaxed)
    }

    fn shared(&self) -> bool {
        self.flags.load(Ordering::Relaxed) & ATTR_SHARED != 0
    }

    fn wait_flags(&self) -> WaitFlags {
        if self.shared() {
            WaitFlags::SHARED
        } else {
            WaitFlags::empty()
        }
    }

    fn key(&self) -> WaitKey {
        WaitKey::of_limb(&self.sw, Limb::Lo)
    }

    fn remember_mutex(&self, mutex: &Mutex) {
        if self.shared() {
            return;
        }
        let key = mutex.wait_key().addr();
        match self
            .mutex_key
            .compare_exchange(0, key, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {}
            Err(seen) if seen == key || seen == MIXED_MUTEXES => {}
            Err(_) => self.mutex_key.store(MIXED_MUTEXES, Ordering::SeqCst),
        }
    }

    fn wake_all(&self) {
        waitchan::wake(self.key(), self.wait_flags() | WaitFlags::BROADCAST);
    }

    pub fn signal(&self) -> i32 {
        if self.is_destroyed() {
            return errno::EINVAL;
        }
        let (_, waiters) = self.sw.add_lo(1);
        if waiters > 0 {
            waitchan::wake(self.key(), self.wait_flags());
        }
        0
    }

    pub fn broadcast(&self) -> i32 {
        if self.is_destroyed() {
            return errno::EINVAL;
        }
        let (_, waiters) = self.sw.add_lo(1);
        if waiters == 0 {
            return 0;
        }
        let cached = self.mutex_key.load(Ordering::SeqCst);
        if cached == 0 || cached == MIXED_MUTEXES {
            self.wake_all();
        } else {
            waitchan::requeue(
                self.key(),
                WaitKey::from_addr(cached),
                true,
                self.wait_flags(),
            );
        }
        0
    }

    /// Blocks until the sequence moves away from `seq`.
    fn block(&self, seq: u32, abstime: Option<&Timespec>, cancellable: bool) -> Result<(), Abandoned> {
        let flags = self.wait_flags();
        loop {
            if self.sw.lo() != seq {
                return Ok(());
            }
            let timeout = match abstime {
                Some(abstime) => Some(abstime.remaining(self.clock()).map_err(Abandoned::Errno)?),
                None => None,
            };
            let flags = if timeout.is_some() {
                flags | WaitFlags::TIMED
            } else {
                flags
            };
            let status = if cancellable {
                let prev = cancel::cancelpoint_begin();
                let status = waitchan::wait_limb(&self.sw, Limb::Lo, seq, timeout, flags);
                cancel::cancelpoint_end(prev);
                status
            } else {
                waitchan::wait_limb(&self.sw, Limb::Lo, seq, timeout, flags)
            };
            match status {
                WaitStatus::Woken => return Ok(()),
                WaitStatus::TimedOut if self.sw.lo() != seq => return Ok(()),
                WaitStatus::TimedOut => return Err(Abandoned::Errno(errno::ETIMEDOUT)),
                WaitStatus::Interrupted if cancellable => continue,
                WaitStatus::Interrupted => return Err(Abandoned::Interrupted),
            }
        }
    }

    fn wait_on(&self, mutex: &Mutex, abstime: Option<&Timespec>, cancellable: bool) -> i32 {
        if self.is_destroyed() {
            return errno::EINVAL;
        }
        self.remember_mutex(mutex);
        // Register before the mutex is released, so a signal sent right
        // after the unlock already counts us.
        let (seq, _) = self.sw.add_hi(1);
        let rc = mutex.unlock();
        if rc != 0 {
            self.sw.add_hi(-1);
            return rc;
        }

        let ctx = WaitCtx {
            cond: self,
            mutex,
            seq,
        };
        let outcome = if cancellable {
            cleanup::with_cleanup(&ctx, abandon_wait, || self.block(seq, abstime, true))
        } else {
            self.block(seq, abstime, false)
        };
        self.sw.add_hi(-1);

        match outcome {
            Ok(()) => mutex.cond_lock(),
            Err(Abandoned::Errno(e)) => {
                let _ = mutex.cond_lock();
                e
            }
            Err(Abandoned::Interrupted) => errno::EINTR,
        }
    }

    /// Atomically releases `mutex` and waits for a wakeup; `mutex` is held
    /// again on return. A cancellation point.
    pub fn wait(&self, mutex: &Mutex) -> i32 {
        self.wait_on(mutex, None, true)
    }

    /// [`Self::wait`] with an absolute deadline on the condvar's clock.
    /// Returns `ETIMEDOUT` (with the mutex reacquired) once it passes.
    pub fn timedwait(&self, mutex: &Mutex, abstime: &Timespec) -> i32 {
        self.wait_on(mutex, Some(abstime), true)
    }

    /// Not a cancellation point: an interrupt returns `EINTR` without
    /// reacquiring `mutex`.
    pub fn wait_interruptible(&self, mutex: &Mutex) -> i32 {
        self.wait_on(mutex, None, false)
    }

    pub fn timedwait_interruptible(&self, mutex: &Mutex, abstime: &Timespec) -> i32 {
        self.wait_on(mutex, Some(abstime), false)
    }
}

// ---------------------------------------------------------------------------
// Semantics contract
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondContractState {
    /// No waiters.
    Idle,
    /// One or more threads blocked in a wait.
    Waiting,
    Destroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondContractOp {
    Init,
    Destroy,
    Wait,
    TimedWait,
    Signal,
    Broadcast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CondContractOutcome {
    pub next: CondContractState,
    pub errno: i32,
    pub blocks: bool,
}

/// Abstract transition for condvar operations. `waiters` is the number of
/// blocked threads before the operation.
#[must_use]
pub const fn cond_contract_transition(
    state: CondContractState,
    op: CondContractOp,
    waiters: u32,
) -> CondContractOutcome {
    use CondContractOp as Op;
    use CondContractState as S;
    let (next, errno, blocks) = match (state, op) {
        (S::Destroyed, Op::Init) => (S::Idle, 0, false),
        (S::Destroyed, _) => (S::Destroyed, errno::EINVAL, false),
        (S::Idle, Op::Init) => (S::Idle, 0, false),
        (S::Idle, Op::Destroy) => (S::Destroyed, 0, false),
        (_, Op::Wait | Op::TimedWait) => (S::Waiting, 0, true),
        (S::Idle, Op::Signal | Op::Broadcast) => (S::Idle, 0, false),
        (S::Waiting, Op::Init | Op::Destroy) => (S::Waiting, errno::EBUSY, false),
        (S::Waiting, Op::Signal) if waiters > 1 => (S::Waiting, 0, false),
        (S::Waiting, Op::Signal | Op::Broadcast) => (S::Idle, 0, false),
    };
    CondContractOutcome {
        next,
        errno,
        blocks,
    }
}

#[must_use]
pub const fn valid_cond_clock(clock_id: i32) -> bool {
    valid_clock_id(clock_id)
}
