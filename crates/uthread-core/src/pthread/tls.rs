//! Thread-specific data keys.
//!
//! Keys index a fixed process-wide table. Each slot carries a sequence
//! number that is odd while the key is allocated; per-thread values
//! remember the sequence they were stored under, so a value set before
//! a key was deleted and re-created reads back as unset.

use std::cell::RefCell;
use std::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::errno;

pub const PTHREAD_KEYS_MAX: usize = 512;
pub const PTHREAD_DESTRUCTOR_ITERATIONS: usize = 4;

/// Destructor run on a thread's non-null value when the thread finishes.
pub type KeyDestructor = unsafe extern "C" fn(*mut c_void);

struct KeySlot {
    seq: AtomicUsize,
    destructor: Mutex<Option<KeyDestructor>>,
}

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_SLOT: KeySlot = KeySlot {
    seq: AtomicUsize::new(0),
    destructor: parking_lot::const_mutex(None),
};

static KEYS: [KeySlot; PTHREAD_KEYS_MAX] = [EMPTY_SLOT; PTHREAD_KEYS_MAX];

#[inline]
const fn seq_in_use(seq: usize) -> bool {
    seq & 1 == 1
}

#[derive(Clone, Copy, Default)]
struct Value {
    seq: usize,
    data: usize,
}

thread_local! {
    static VALUES: RefCell<Vec<Value>> = const { RefCell::new(Vec::new()) };
}

/// Allocates a key. `EAGAIN` when every key is taken.
pub fn key_create(destructor: Option<KeyDestructor>) -> Result<u32, i32> {
    for (key, slot) in KEYS.iter().enumerate() {
        let seq = slot.seq.load(Ordering::SeqCst);
        if seq_in_use(seq) {
            continue;
        }
        // Destructor first, so a thread finishing right after the CAS
        // never sees a live key with a stale destructor.
        let mut dtor = slot.destructor.lock();
        if slot
            .seq
            .compare_exchange(seq, seq.wrapping_add(1), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            *dtor = destructor;
            return Ok(key as u32);
        }
    }
    tracing::warn!(max = PTHREAD_KEYS_MAX, "thread-specific keys exhausted");
    Err(errno::EAGAIN)
}

/// Frees `key`. Values still set in other threads are abandoned without
/// running the destructor.
pub fn key_delete(key: u32) -> i32 {
    let Some(slot) = KEYS.get(key as usize) else {
        return errno::EINVAL;
    };
    let mut dtor = slot.destructor.lock();
    let seq = slot.seq.load(Ordering::SeqCst);
    if !seq_in_use(seq)
        || slot
            .seq
            .compare_exchange(seq, seq.wrapping_add(1), Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
    {
        return errno::EINVAL;
    }
    *dtor = None;
    0
}

fn live_seq(key: u32) -> Option<usize> {
    let seq = KEYS.get(key as usize)?.seq.load(Ordering::SeqCst);
    seq_in_use(seq).then_some(seq)
}

/// The calling thread's value for `key`; null when unset or invalid.
pub fn getspecific(key: u32) -> *mut c_void {
    let Some(seq) = live_seq(key) else {
        return std::ptr::null_mut();
    };
    VALUES
        .try_with(|v| {
            v.borrow()
                .get(key as usize)
                .filter(|value| value.seq == seq)
                .map_or(0, |value| value.data)
        })
        .unwrap_or(0) as *mut c_void
}

/// Sets the calling thread's value for `key`.
pub fn setspecific(key: u32, data: *const c_void) -> i32 {
    let Some(seq) = live_seq(key) else {
        return errno::EINVAL;
    };
    VALUES
        .try_with(|v| {
            let mut v = v.borrow_mut();
            let idx = key as usize;
            if v.len() <= idx {
                v.resize(idx + 1, Value::default());
            }
            v[idx] = Value {
                seq,
                data: data as usize,
            };
            0
        })
        .unwrap_or(errno::ENOMEM)
}

/// Runs destructors for the calling thread's non-null values, repeating
/// while destructors keep setting new values, up to
/// [`PTHREAD_DESTRUCTOR_ITERATIONS`] rounds.
pub(crate) fn run_destructors() {
    for _ in 0..PTHREAD_DESTRUCTOR_ITERATIONS {
        let mut ran = false;
        for key in 0..PTHREAD_KEYS_MAX {
            let taken = VALUES.try_with(|v| {
                let mut v = v.borrow_mut();
                let value = v.get_mut(key)?;
                let taken = *value;
                *value = Value::default();
                (taken.data != 0).then_some(taken)
            });
            let Ok(Some(value)) = taken else {
                continue;
            };
            let slot = &KEYS[key];
            if slot.seq.load(Ordering::SeqCst) != value.seq {
                continue;
            }
            let dtor = *slot.destructor.lock();
            if let Some(dtor) = dtor {
                ran = true;
                // SAFETY: the destructor was registered for this key and is
                // called with a value this thread stored under it.
                unsafe { dtor(value.data as *mut c_void) };
            }
        }
        if !ran {
            return;
        }
    }
    tracing::debug!(
        rounds = PTHREAD_DESTRUCTOR_ITERATIONS,
        "thread-specific destructors still setting values; giving up"
    );
}
