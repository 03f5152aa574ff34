//! Process-wide registry of live threads.
//!
//! Threads are linked when created (or adopted) and unlinked when they
//! finish. The registry only holds weak references; ownership stays with
//! the thread itself and whoever holds its handle. One lock guards the map
//! and it is held for O(log n) link/unlink or for a full walk.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::thread::ThreadRecord;
use crate::errno;
use crate::sync::waitchan::{self, WaitFlags};

/// Thread identities carry 29 significant bits.
pub const THREAD_ID_BITS: u32 = 29;
pub const THREAD_ID_MASK: u32 = (1 << THREAD_ID_BITS) - 1;
/// Identity reserved for the process's main thread.
pub const MAIN_THREAD_ID: u32 = 1;

struct Registry {
    threads: BTreeMap<u32, Weak<ThreadRecord>>,
    counter: u32,
}

static REGISTRY: Mutex<Registry> = parking_lot::const_mutex(Registry {
    threads: BTreeMap::new(),
    counter: MAIN_THREAD_ID,
});

/// Threads started through the runtime that have not finished yet.
static LIVE_THREADS: AtomicU32 = AtomicU32::new(0);

/// Links `record` and returns its fresh identity. Identities are handed
/// out cyclically, skipping 0 and any still in use.
pub(crate) fn link(record: &Arc<ThreadRecord>, main: bool) -> Result<u32, i32> {
    let mut reg = REGISTRY.lock();
    let id = if main && !reg.threads.contains_key(&MAIN_THREAD_ID) {
        MAIN_THREAD_ID
    } else {
        let mut candidate = reg.counter;
        let mut tries = 0u32;
        loop {
            candidate = candidate.wrapping_add(1) & THREAD_ID_MASK;
            if candidate != 0 && !reg.threads.contains_key(&candidate) {
                break;
            }
            tries += 1;
            if tries > THREAD_ID_MASK {
                return Err(errno::EAGAIN);
            }
        }
        reg.counter = candidate;
        candidate
    };
    reg.threads.insert(id, Arc::downgrade(record));
    Ok(id)
}

pub(crate) fn unlink(id: u32) {
    REGISTRY.lock().threads.remove(&id);
}

/// The live thread with identity `id`, if any.
pub fn lookup(id: u32) -> Option<Arc<ThreadRecord>> {
    REGISTRY.lock().threads.get(&id).and_then(Weak::upgrade)
}

/// Number of linked threads, adopted ones included.
pub fn linked_count() -> usize {
    REGISTRY.lock().threads.len()
}

/// Calls `f` on every linked thread while holding the registry lock.
/// A negative return stops the walk and is returned. `f` must not create,
/// adopt or finish threads.
pub(crate) fn walk(mut f: impl FnMut(&Arc<ThreadRecord>) -> i32) -> i32 {
    let reg = REGISTRY.lock();
    let mut ret = 0;
    for record in reg.threads.values().filter_map(Weak::upgrade) {
        ret = f(&record);
        if ret < 0 {
            break;
        }
    }
    ret
}

// ---------------------------------------------------------------------------
// Live thread total
// ---------------------------------------------------------------------------

pub(crate) fn live_inc() {
    LIVE_THREADS.fetch_add(1, Ordering::SeqCst);
}

pub(crate) fn live_dec() {
    if LIVE_THREADS.fetch_sub(1, Ordering::SeqCst) == 1 {
        waitchan::wake_word(&LIVE_THREADS, WaitFlags::BROADCAST);
    }
}

#[must_use]
pub fn live_threads() -> u32 {
    LIVE_THREADS.load(Ordering::SeqCst)
}

/// Blocks until every runtime-started thread has finished.
pub(crate) fn wait_for_live_threads() {
    loop {
        let live = LIVE_THREADS.load(Ordering::SeqCst);
        if live == 0 {
            return;
        }
        waitchan::wait(&LIVE_THREADS, live, None, WaitFlags::empty());
    }
}
