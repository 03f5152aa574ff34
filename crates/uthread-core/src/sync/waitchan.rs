//! Address-keyed wait/wake channel.
//!
//! Every blocking operation in the runtime funnels through this module: a
//! thread parks on the address of a word only if the word still holds an
//! expected value, and a waker mutates the word and then wakes one or all
//! parked threads. Queues live in `parking_lot_core`'s global hash table,
//! so the check-and-enqueue step and the wake step serialize on the same
//! bucket lock and wakeups cannot be lost.
//!
//! Besides the usual wake-one and wake-all, waiters can be requeued from
//! one address to another (condition variable broadcast moves its waiters
//! onto the mutex), and a single parked thread can be interrupted by
//! another thread through its [`Waiter`] slot. Interrupted waits report
//! [`WaitStatus::Interrupted`]; cancellation relies on this.
//!
//! Queues are process-local. `WaitFlags::SHARED` is carried for objects
//! marked process-shared. It does not select a different queue, but
//! shared waiters are never requeued.

use std::cell::OnceCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bitflags::bitflags;
use parking_lot_core::{FilterOp, ParkResult, ParkToken, RequeueOp, UnparkToken};

use super::paired::{Limb, PairedCounter};

bitflags! {
    /// Flags accepted by the wait/wake operations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct WaitFlags: u32 {
        /// Object lives in memory shared between processes.
        const SHARED = 0x01;
        /// Compare both limbs of a paired counter.
        const QUAD = 0x02;
        /// The wait carries a timeout.
        const TIMED = 0x04;
        /// Wake every waiter instead of one.
        const BROADCAST = 0x08;
        /// Store a new value before waking.
        const MUTATE = 0x10;
    }
}

/// Outcome of a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// Woken, or the value had already changed.
    Woken,
    /// Another thread interrupted the wait.
    Interrupted,
    TimedOut,
}

const WAKE_TOKEN: UnparkToken = UnparkToken(0);
const INTERRUPT_TOKEN: UnparkToken = UnparkToken(1);

/// Queue identity. Usually the address of the word being waited on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaitKey(usize);

impl WaitKey {
    #[inline]
    pub fn of_word(word: &AtomicU32) -> Self {
        Self(word as *const AtomicU32 as usize)
    }

    #[inline]
    pub fn of_limb(pc: &PairedCounter, limb: Limb) -> Self {
        Self(pc.limb_addr(limb))
    }

    /// Whole-pair waits use an odd key so they never share a queue with
    /// waiters on the low limb at the same address.
    #[inline]
    pub fn of_quad(pc: &PairedCounter) -> Self {
        Self(pc.addr() | 1)
    }

    #[inline]
    pub const fn from_addr(addr: usize) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn addr(self) -> usize {
        self.0
    }
}

// ---------------------------------------------------------------------------
// Per-thread interrupt slot
// ---------------------------------------------------------------------------

/// Per-thread record that lets another thread abort a blocked wait.
#[derive(Debug, Default)]
pub struct Waiter {
    /// Key the owner is parked on, 0 when not parked.
    blocked_on: AtomicUsize,
    /// Interrupt requested and not yet consumed by a wait.
    pending: AtomicBool,
}

impl Waiter {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            blocked_on: AtomicUsize::new(0),
            pending: AtomicBool::new(false),
        }
    }

    /// Requests an interrupt. If the owner is parked, it is woken with
    /// [`WaitStatus::Interrupted`]; otherwise its next wait returns that
    /// status immediately. Returns whether a parked wait was aborted.
    pub fn interrupt(&self) -> bool {
        self.pending.store(true, Ordering::SeqCst);
        let key = self.blocked_on.load(Ordering::SeqCst);
        if key == 0 {
            return false;
        }
        let me = self as *const Waiter as usize;
        // SAFETY: the filter and callback only compare tokens; neither
        // re-enters parking_lot.
        let res = unsafe {
            parking_lot_core::unpark_filter(
                key,
                |ParkToken(token)| {
                    if token == me {
                        FilterOp::Unpark
                    } else {
                        FilterOp::Skip
                    }
                },
                |_| INTERRUPT_TOKEN,
            )
        };
        res.unparked_threads > 0
    }

    #[inline]
    pub fn is_parked(&self) -> bool {
        self.blocked_on.load(Ordering::SeqCst) != 0
    }

    #[inline]
    pub fn has_pending_interrupt(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }
}

thread_local! {
    static WAITER: OnceCell<Arc<Waiter>> = const { OnceCell::new() };
}

/// The calling thread's interrupt slot.
pub fn current_waiter() -> Arc<Waiter> {
    WAITER
        .try_with(|slot| Arc::clone(slot.get_or_init(|| Arc::new(Waiter::new()))))
        .unwrap_or_else(|_| Arc::new(Waiter::new()))
}

/// Installs `waiter` as the calling thread's slot, so interrupts sent
/// before the thread started are seen by its first wait. Fails if the
/// thread already has one.
pub fn adopt_waiter(waiter: Arc<Waiter>) -> bool {
    WAITER
        .try_with(|slot| slot.set(waiter).is_ok())
        .unwrap_or(false)
}

fn park(key: WaitKey, validate: impl FnOnce() -> bool, timeout: Option<Duration>) -> WaitStatus {
    let waiter = current_waiter();
    let deadline = timeout.and_then(|d| Instant::now().checked_add(d));
    let token = ParkToken(Arc::as_ptr(&waiter) as usize);
    let pending = &waiter.pending;

    waiter.blocked_on.store(key.0, Ordering::SeqCst);
    // SAFETY: `validate` reads atomics only, the other callbacks are empty;
    // none of them re-enters parking_lot or panics.
    let result = unsafe {
        parking_lot_core::park(
            key.0,
            || !pending.load(Ordering::SeqCst) && validate(),
            || {},
            |_, _| {},
            token,
            deadline,
        )
    };
    waiter.blocked_on.store(0, Ordering::SeqCst);

    match result {
        ParkResult::Unparked(t) if t == INTERRUPT_TOKEN => {
            waiter.pending.store(false, Ordering::SeqCst);
            WaitStatus::Interrupted
        }
        ParkResult::Unparked(_) => WaitStatus::Woken,
        ParkResult::Invalid => {
            if waiter.pending.swap(false, Ordering::SeqCst) {
                WaitStatus::Interrupted
            } else {
                WaitStatus::Woken
            }
        }
        ParkResult::TimedOut => WaitStatus::TimedOut,
    }
}

#[inline]
fn debug_check_wait_flags(flags: WaitFlags) {
    debug_assert!(
        !flags.intersects(WaitFlags::BROADCAST | WaitFlags::MUTATE),
        "wake-side flags passed to a wait: {flags:?}"
    );
}

// ---------------------------------------------------------------------------
// Wait operations
// ---------------------------------------------------------------------------

/// Blocks while `word == expected`.
pub fn wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>, flags: WaitFlags) -> WaitStatus {
    debug_check_wait_flags(flags);
    park(
        WaitKey::of_word(word),
        || word.load(Ordering::SeqCst) == expected,
        timeout,
    )
}

/// Blocks while one limb of `pc` equals `expected`.
pub fn wait_limb(
    pc: &PairedCounter,
    limb: Limb,
    expected: u32,
    timeout: Option<Duration>,
    flags: WaitFlags,
) -> WaitStatus {
    debug_check_wait_flags(flags);
    park(
        WaitKey::of_limb(pc, limb),
        || pc.limb(limb) == expected,
        timeout,
    )
}

/// Blocks while both limbs of `pc` equal `expected`.
pub fn wait_quad(
    pc: &PairedCounter,
    expected: (u32, u32),
    timeout: Option<Duration>,
    flags: WaitFlags,
) -> WaitStatus {
    debug_check_wait_flags(flags);
    park(WaitKey::of_quad(pc), || pc.load() == expected, timeout)
}

/// Blocks on `key` while `still_blocked` holds. The predicate runs under
/// the queue lock, so a waker that changes the state and then wakes `key`
/// cannot slip in between the check and the enqueue.
pub fn wait_while(
    key: WaitKey,
    still_blocked: impl FnOnce() -> bool,
    timeout: Option<Duration>,
    flags: WaitFlags,
) -> WaitStatus {
    debug_check_wait_flags(flags);
    park(key, still_blocked, timeout)
}

// ---------------------------------------------------------------------------
// Wake operations
// ---------------------------------------------------------------------------

/// Wakes one waiter on `key`, or all of them with `BROADCAST`. Returns the
/// number of threads woken.
pub fn wake(key: WaitKey, flags: WaitFlags) -> usize {
    if flags.contains(WaitFlags::BROADCAST) {
        // SAFETY: no callbacks.
        unsafe { parking_lot_core::unpark_all(key.0, WAKE_TOKEN) }
    } else {
        // SAFETY: the callback returns a constant token.
        unsafe { parking_lot_core::unpark_one(key.0, |_| WAKE_TOKEN) }.unparked_threads
    }
}

#[inline]
pub fn wake_word(word: &AtomicU32, flags: WaitFlags) -> usize {
    wake(WaitKey::of_word(word), flags)
}

/// Stores `value` into `word` and wakes its waiters.
pub fn set_wake(word: &AtomicU32, value: u32, flags: WaitFlags) -> usize {
    word.store(value, Ordering::SeqCst);
    wake(WaitKey::of_word(word), flags | WaitFlags::MUTATE)
}

/// Moves the waiters on `src` to `dst`. With `wake_one`, the first waiter
/// is woken instead of moved. Returns the number of threads touched.
///
/// `SHARED` waiters are never moved: they are all woken on `src` instead,
/// and `BROADCAST` asks for the same wake-all. `MUTATE`, `QUAD` and `TIMED`
/// mean nothing here.
///
/// A requeued waiter keeps reporting `src` as its parked key, so an
/// interrupt aimed at it stays pending until it leaves `dst`.
pub fn requeue(src: WaitKey, dst: WaitKey, wake_one: bool, flags: WaitFlags) -> usize {
    debug_assert!(
        (flags - (WaitFlags::SHARED | WaitFlags::BROADCAST)).is_empty(),
        "wait-side flags passed to a requeue: {flags:?}"
    );
    if flags.intersects(WaitFlags::SHARED | WaitFlags::BROADCAST) {
        return wake(src, WaitFlags::BROADCAST);
    }
    let op = if wake_one {
        RequeueOp::UnparkOneRequeueRest
    } else {
        RequeueOp::RequeueAll
    };
    // SAFETY: both callbacks return constants.
    let res = unsafe { parking_lot_core::unpark_requeue(src.0, dst.0, || op, |_, _| WAKE_TOKEN) };
    res.unparked_threads + res.requeued_threads
}
