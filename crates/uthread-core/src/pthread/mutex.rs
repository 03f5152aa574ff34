//! POSIX mutexes.
//!
//! Implements the normal, recursive and error-checking mutex types over
//! the low-level lock in [`crate::sync::lll`], each optionally robust.
//! Robustness is honored only for process-shared mutexes: the lock word of
//! a robust mutex holds the owning process id, and death is detected per
//! process through the liveness oracle.
//!
//! In strict mode a normal mutex keeps no ownership record at all. In
//! hardened mode (`UTHREAD_MODE=hardened`) normal mutexes track their
//! owner like error-checking ones, so relocking reports `EDEADLK` and a
//! foreign unlock reports `EPERM` instead of hanging or corrupting state.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use super::attr::{
    ATTR_ROBUST, ATTR_SHARED, MutexAttr, PTHREAD_MUTEX_ERRORCHECK, PTHREAD_MUTEX_NORMAL,
    PTHREAD_MUTEX_RECURSIVE, PTHREAD_MUTEX_TYPE_MAX, valid_mutex_type,
};
use super::thread::{self, ThreadRecord};
use crate::config;
use crate::errno;
use crate::sync::liveness;
use crate::sync::lll::{self, LLL_DEAD_OWNER, LLL_OWNER_MASK, LLL_WAITERS};
use crate::sync::waitchan::{WaitFlags, WaitKey};
use crate::time::{CLOCK_REALTIME, Timespec};

/// Owner value of a robust mutex released without being made consistent.
pub const NOTRECOVERABLE_ID: u32 = 1 << 31;

// ---------------------------------------------------------------------------
// Mutex object
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Mutex {
    lock: AtomicU32,
    owner: AtomicU32,
    shpid: AtomicU32,
    count: AtomicU32,
    kind: AtomicI32,
    flags: AtomicU32,
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy)]
enum Acquire<'a> {
    Block,
    Try,
    Until(&'a Timespec),
}

/// Drops the robust bit of a process-private mutex.
#[inline]
const fn effective_flags(flags: u32) -> u32 {
    if flags & ATTR_SHARED == 0 {
        flags & !ATTR_ROBUST
    } else {
        flags
    }
}

#[inline]
fn wait_flags(flags: u32) -> WaitFlags {
    if flags & ATTR_SHARED != 0 {
        WaitFlags::SHARED
    } else {
        WaitFlags::empty()
    }
}

impl Mutex {
    /// A normal, process-private mutex (`PTHREAD_MUTEX_INITIALIZER`).
    #[must_use]
    pub const fn new() -> Self {
        Self {
            lock: AtomicU32::new(0),
            owner: AtomicU32::new(0),
            shpid: AtomicU32::new(0),
            count: AtomicU32::new(0),
            kind: AtomicI32::new(PTHREAD_MUTEX_NORMAL),
            flags: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn with_attr(attr: &MutexAttr) -> Self {
        let m = Self::new();
        m.kind.store(attr.kind(), Ordering::Relaxed);
        m.flags.store(effective_flags(attr.flags()), Ordering::Relaxed);
        m
    }

    /// (Re)initializes the mutex. `EBUSY` while it is locked.
    pub fn init(&self, attr: Option<&MutexAttr>) -> i32 {
        if self.lock.load(Ordering::SeqCst) != 0 {
            return errno::EBUSY;
        }
        let attr = attr.copied().unwrap_or_default();
        self.owner.store(0, Ordering::Relaxed);
        self.shpid.store(0, Ordering::Relaxed);
        self.count.store(0, Ordering::Relaxed);
        self.flags.store(effective_flags(attr.flags()), Ordering::Relaxed);
        self.kind.store(attr.kind(), Ordering::SeqCst);
        0
    }

    /// Type of the mutex, or `PTHREAD_MUTEX_TYPE_MAX` once destroyed.
    #[must_use]
    pub fn kind(&self) -> i32 {
        self.kind.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_robust(&self) -> bool {
        self.flags.load(Ordering::Relaxed) & ATTR_ROBUST != 0
    }

    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.flags.load(Ordering::Relaxed) & ATTR_SHARED != 0
    }

    /// Current owner identity (0 when untracked or free).
    #[must_use]
    pub fn owner(&self) -> u32 {
        self.owner.load(Ordering::SeqCst)
    }

    /// Raw lock word.
    #[must_use]
    pub fn lock_word(&self) -> u32 {
        self.lock.load(Ordering::SeqCst)
    }

    pub(crate) fn wait_key(&self) -> WaitKey {
        WaitKey::of_word(&self.lock)
    }

    fn tracked(&self, kind: i32) -> bool {
        kind != PTHREAD_MUTEX_NORMAL || config::mode().is_hardened()
    }

    fn held_by(&self, me: u32, flags: u32) -> bool {
        self.lock.load(Ordering::SeqCst) != 0
            && self.owner.load(Ordering::SeqCst) == me
            && (flags & ATTR_SHARED == 0
                || self.shpid.load(Ordering::SeqCst) == liveness::current_process())
    }

    fn take_ownership(&self, me: u32, flags: u32) {
        self.owner.store(me, Ordering::SeqCst);
        if flags & ATTR_SHARED != 0 {
            self.shpid
                .store(liveness::current_process(), Ordering::SeqCst);
        }
        self.count.store(1, Ordering::Relaxed);
    }

    fn bump_count(&self) -> i32 {
        let count = self.count.load(Ordering::Relaxed);
        match count.checked_add(1) {
            Some(next) => {
                self.count.store(next, Ordering::Relaxed);
                0
            }
            None => errno::EAGAIN,
        }
    }

    fn lock_plain(&self, how: Acquire<'_>, wflags: WaitFlags) -> i32 {
        match how {
            Acquire::Block => {
                lll::lock(&self.lock, wflags);
                0
            }
            Acquire::Try => lll::trylock(&self.lock),
            Acquire::Until(abstime) => lll::timedlock(&self.lock, abstime, CLOCK_REALTIME, wflags),
        }
    }

    fn acquire(&self, how: Acquire<'_>) -> i32 {
        let kind = self.kind();
        if !valid_mutex_type(kind) {
            return errno::EINVAL;
        }
        let flags = self.flags.load(Ordering::Relaxed);
        let wflags = wait_flags(flags);
        if flags & ATTR_ROBUST != 0 {
            return self.acquire_robust(kind, flags, how, wflags);
        }
        if !self.tracked(kind) {
            return self.lock_plain(how, wflags);
        }

        let me = thread::current_id();
        if self.held_by(me, flags) {
            return match (kind, how) {
                (PTHREAD_MUTEX_RECURSIVE, _) => self.bump_count(),
                (_, Acquire::Try) => errno::EBUSY,
                _ => errno::EDEADLK,
            };
        }
        let rc = self.lock_plain(how, wflags);
        if rc == 0 {
            self.take_ownership(me, flags);
        }
        rc
    }

    fn acquire_robust(&self, kind: i32, flags: u32, how: Acquire<'_>, wflags: WaitFlags) -> i32 {
        if self.owner.load(Ordering::SeqCst) == NOTRECOVERABLE_ID {
            return errno::ENOTRECOVERABLE;
        }
        let me = thread::current_id();
        let pid = liveness::current_process() & LLL_OWNER_MASK;
        if self.owner.load(Ordering::SeqCst) == me
            && self.lock.load(Ordering::SeqCst) & LLL_OWNER_MASK == pid
        {
            match (kind, how) {
                (PTHREAD_MUTEX_RECURSIVE, _) => return self.bump_count(),
                (_, Acquire::Try) => return errno::EBUSY,
                (PTHREAD_MUTEX_ERRORCHECK, _) => return errno::EDEADLK,
                _ if config::mode().is_hardened() => return errno::EDEADLK,
                _ => {}
            }
        }

        let rc = match how {
            Acquire::Block => lll::robust_lock(&self.lock, wflags),
            Acquire::Try => lll::robust_trylock(&self.lock),
            Acquire::Until(abstime) => {
                lll::robust_timedlock(&self.lock, abstime, CLOCK_REALTIME, wflags)
            }
        };
        if rc != 0 && rc != errno::EOWNERDEAD {
            return rc;
        }
        // Made unrecoverable while we queued for the word.
        if self.owner.load(Ordering::SeqCst) == NOTRECOVERABLE_ID {
            lll::robust_unlock(&self.lock, wflags);
            return errno::ENOTRECOVERABLE;
        }
        self.take_ownership(me, flags);
        if rc == errno::EOWNERDEAD {
            self.lock.fetch_or(LLL_DEAD_OWNER, Ordering::SeqCst);
            tracing::warn!(owner = me, "robust mutex recovered from a dead owner; state inconsistent");
        }
        rc
    }

    pub fn lock(&self) -> i32 {
        self.acquire(Acquire::Block)
    }

    pub fn trylock(&self) -> i32 {
        self.acquire(Acquire::Try)
    }

    /// Lock with an absolute `CLOCK_REALTIME` deadline.
    pub fn timedlock(&self, abstime: &Timespec) -> i32 {
        self.acquire(Acquire::Until(abstime))
    }

    pub fn unlock(&self) -> i32 {
        let kind = self.kind();
        if !valid_mutex_type(kind) {
            return errno::EINVAL;
        }
        let flags = self.flags.load(Ordering::Relaxed);
        let wflags = wait_flags(flags);
        if flags & ATTR_ROBUST != 0 {
            return self.unlock_robust(kind, wflags);
        }
        if self.tracked(kind) {
            let me = thread::current_id();
            if !self.held_by(me, flags) {
                return errno::EPERM;
            }
            let count = self.count.load(Ordering::Relaxed);
            if kind == PTHREAD_MUTEX_RECURSIVE && count > 1 {
                self.count.store(count - 1, Ordering::Relaxed);
                return 0;
            }
            self.count.store(0, Ordering::Relaxed);
            self.owner.store(0, Ordering::SeqCst);
        }
        lll::unlock(&self.lock, wflags);
        0
    }

    fn unlock_robust(&self, kind: i32, wflags: WaitFlags) -> i32 {
        let owner = self.owner.load(Ordering::SeqCst);
        if owner == NOTRECOVERABLE_ID {
            return 0;
        }
        let pid = liveness::current_process() & LLL_OWNER_MASK;
        let word = self.lock.load(Ordering::SeqCst);
        if owner != thread::current_id() || word & LLL_OWNER_MASK != pid {
            return errno::EPERM;
        }
        let count = self.count.load(Ordering::Relaxed);
        if kind == PTHREAD_MUTEX_RECURSIVE && count > 1 {
            self.count.store(count - 1, Ordering::Relaxed);
            return 0;
        }
        self.count.store(0, Ordering::Relaxed);
        if word & LLL_DEAD_OWNER != 0 {
            tracing::warn!(owner, "robust mutex released while inconsistent; now not recoverable");
            self.owner.store(NOTRECOVERABLE_ID, Ordering::SeqCst);
        } else {
            self.owner.store(0, Ordering::SeqCst);
        }
        lll::robust_unlock(&self.lock, wflags);
        0
    }

    /// Marks a robust mutex recovered with `EOWNERDEAD` as consistent again.
    pub fn consistent(&self) -> i32 {
        if !self.is_robust() {
            return errno::EINVAL;
        }
        let pid = liveness::current_process() & LLL_OWNER_MASK;
        let word = self.lock.load(Ordering::SeqCst);
        if word & LLL_DEAD_OWNER == 0
            || word & LLL_OWNER_MASK != pid
            || self.owner.load(Ordering::SeqCst) != thread::current_id()
        {
            return errno::EINVAL;
        }
        if self
            .lock
            .compare_exchange(word, pid | LLL_WAITERS, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return errno::EINVAL;
        }
        self.count.store(1, Ordering::Relaxed);
        0
    }

    /// Hands a held mutex to `target` without unlocking it.
    pub fn transfer_np(&self, target: &ThreadRecord) -> i32 {
        let tid = target.id();
        if tid == 0 {
            return errno::ESRCH;
        }
        let me = thread::current_id();
        if tid == me {
            return 0;
        }
        let kind = self.kind();
        if !valid_mutex_type(kind) {
            return errno::EINVAL;
        }
        let flags = self.flags.load(Ordering::Relaxed);
        if flags & ATTR_ROBUST == 0 && !self.tracked(kind) {
            return 0;
        }
        if self.owner.load(Ordering::SeqCst) != me || self.lock.load(Ordering::SeqCst) == 0 {
            return errno::EPERM;
        }
        self.owner.store(tid, Ordering::SeqCst);
        0
    }

    /// `EBUSY` while locked; afterwards every operation but `init` fails
    /// with `EINVAL`.
    pub fn destroy(&self) -> i32 {
        if !valid_mutex_type(self.kind()) {
            return errno::EINVAL;
        }
        if self.lock.load(Ordering::SeqCst) != 0 {
            return errno::EBUSY;
        }
        self.kind.store(PTHREAD_MUTEX_TYPE_MAX, Ordering::SeqCst);
        0
    }

    pub fn getprioceiling(&self) -> Result<i32, i32> {
        Err(errno::ENOSYS)
    }

    pub fn setprioceiling(&self, _ceiling: i32) -> Result<i32, i32> {
        Err(errno::ENOSYS)
    }

    /// Reacquire after a condition wait. The word is left marked contended
    /// (or with the waiters bit, when robust) since requeued waiters may be
    /// queued behind it.
    pub(crate) fn cond_lock(&self) -> i32 {
        let kind = self.kind();
        if !valid_mutex_type(kind) {
            return errno::EINVAL;
        }
        let flags = self.flags.load(Ordering::Relaxed);
        let wflags = wait_flags(flags);
        if flags & ATTR_ROBUST != 0 {
            let rc = self.acquire_robust(kind, flags, Acquire::Block, wflags);
            if rc == 0 || rc == errno::EOWNERDEAD {
                self.lock.fetch_or(LLL_WAITERS, Ordering::SeqCst);
            }
            return rc;
        }
        lll::lock_contended(&self.lock, wflags);
        if self.tracked(kind) {
            self.take_ownership(thread::current_id(), flags);
        }
        0
    }
}

// ---------------------------------------------------------------------------
// Semantics contract
// ---------------------------------------------------------------------------

/// Abstract mutex state as seen by the calling thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexContractState {
    Unlocked,
    /// Held by the calling thread.
    OwnedBySelf,
    /// Held by another thread.
    OwnedByOther,
    /// Held by the calling thread after recovery from a dead owner.
    Inconsistent,
    NotRecoverable,
    Destroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexContractOp {
    Init,
    Lock,
    TryLock,
    Unlock,
    Consistent,
    Destroy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutexContractOutcome {
    pub next: MutexContractState,
    pub errno: i32,
    /// The call blocks (possibly forever, for a strict normal relock).
    pub blocks: bool,
}

const fn outcome(next: MutexContractState, errno: i32, blocks: bool) -> MutexContractOutcome {
    MutexContractOutcome {
        next,
        errno,
        blocks,
    }
}

/// Expected result of `op` on a mutex of type `kind` in `state`.
///
/// `tracked` says whether ownership is recorded (every type but a strict
/// normal mutex); `depth` is the recursion depth while owned by self.
#[must_use]
pub const fn mutex_contract_transition(
    state: MutexContractState,
    op: MutexContractOp,
    kind: i32,
    tracked: bool,
    depth: u32,
) -> MutexContractOutcome {
    use MutexContractOp as Op;
    use MutexContractState as S;
    let recursive = kind == PTHREAD_MUTEX_RECURSIVE;
    match state {
        S::Destroyed => match op {
            Op::Init => outcome(S::Unlocked, 0, false),
            _ => outcome(S::Destroyed, errno::EINVAL, false),
        },
        S::Unlocked => match op {
            Op::Init => outcome(S::Unlocked, 0, false),
            Op::Lock | Op::TryLock => outcome(S::OwnedBySelf, 0, false),
            Op::Unlock if tracked => outcome(S::Unlocked, errno::EPERM, false),
            Op::Unlock => outcome(S::Unlocked, 0, false),
            Op::Consistent => outcome(S::Unlocked, errno::EINVAL, false),
            Op::Destroy => outcome(S::Destroyed, 0, false),
        },
        S::OwnedBySelf | S::Inconsistent => match op {
            Op::Init | Op::Destroy => outcome(state, errno::EBUSY, false),
            Op::Lock if recursive => outcome(state, 0, false),
            Op::Lock if tracked => outcome(state, errno::EDEADLK, false),
            Op::Lock => outcome(state, 0, true),
            Op::TryLock if recursive => outcome(state, 0, false),
            Op::TryLock => outcome(state, errno::EBUSY, false),
            Op::Unlock if recursive && depth > 1 => outcome(state, 0, false),
            Op::Unlock => match state {
                S::Inconsistent => outcome(S::NotRecoverable, 0, false),
                _ => outcome(S::Unlocked, 0, false),
            },
            Op::Consistent => match state {
                S::Inconsistent => outcome(S::OwnedBySelf, 0, false),
                _ => outcome(state, errno::EINVAL, false),
            },
        },
        S::OwnedByOther => match op {
            Op::Init | Op::Destroy => outcome(S::OwnedByOther, errno::EBUSY, false),
            Op::Lock => outcome(S::OwnedBySelf, 0, true),
            Op::TryLock => outcome(S::OwnedByOther, errno::EBUSY, false),
            Op::Unlock if tracked => outcome(S::OwnedByOther, errno::EPERM, false),
            Op::Unlock => outcome(S::Unlocked, 0, false),
            Op::Consistent => outcome(S::OwnedByOther, errno::EINVAL, false),
        },
        S::NotRecoverable => match op {
            Op::Lock | Op::TryLock => outcome(S::NotRecoverable, errno::ENOTRECOVERABLE, false),
            Op::Unlock => outcome(S::NotRecoverable, 0, false),
            Op::Consistent => outcome(S::NotRecoverable, errno::EINVAL, false),
            Op::Init => outcome(S::Unlocked, 0, false),
            Op::Destroy => outcome(S::Destroyed, 0, false),
        },
    }
}
