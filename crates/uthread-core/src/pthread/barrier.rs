//! Reusable N-party barriers.

use std::sync::atomic::{AtomicU32, Ordering};

use super::attr::{ATTR_SHARED, BarrierAttr};
use crate::errno;
use crate::sync::paired::{Limb, PairedCounter};
use crate::sync::waitchan::{self, WaitFlags, WaitKey};

/// Returned to exactly one party per round.
pub const PTHREAD_BARRIER_SERIAL_THREAD: i32 = 1;

#[derive(Debug)]
pub struct Barrier {
    /// (generation, arrivals)
    seq: PairedCounter,
    /// Parties minus one.
    total: AtomicU32,
    /// 1 for the barrier itself plus one per in-flight waiter.
    nrefs: AtomicU32,
    flags: AtomicU32,
}

impl Barrier {
    /// Barrier for `count` parties. `EINVAL` for zero.
    pub fn new(count: u32, attr: Option<&BarrierAttr>) -> Result<Self, i32> {
        if count == 0 {
            return Err(errno::EINVAL);
        }
        Ok(Self {
            seq: PairedCounter::new(0, 0),
            total: AtomicU32::new(count - 1),
            nrefs: AtomicU32::new(1),
            flags: AtomicU32::new(attr.map_or(0, BarrierAttr::flags)),
        })
    }

    pub fn init(&self, count: u32, attr: Option<&BarrierAttr>) -> i32 {
        if count == 0 {
            return errno::EINVAL;
        }
        self.seq.store(0, 0);
        self.total.store(count - 1, Ordering::SeqCst);
        self.nrefs.store(1, Ordering::SeqCst);
        self.flags
            .store(attr.map_or(0, BarrierAttr::flags), Ordering::Relaxed);
        0
    }

    fn wait_flags(&self) -> WaitFlags {
        if self.flags.load(Ordering::Relaxed) & ATTR_SHARED != 0 {
            WaitFlags::SHARED
        } else {
            WaitFlags::empty()
        }
    }

    fn release_ref(&self) {
        if self.nrefs.fetch_sub(1, Ordering::SeqCst) == 1 {
            waitchan::wake_word(&self.nrefs, WaitFlags::BROADCAST);
        }
    }

    /// Blocks until every party has arrived. One caller per round gets
    /// [`PTHREAD_BARRIER_SERIAL_THREAD`], the rest 0. Not a cancellation
    /// point.
    pub fn wait(&self) -> i32 {
        self.nrefs.fetch_add(1, Ordering::SeqCst);
        let total = self.total.load(Ordering::SeqCst);
        let flags = self.wait_flags();

        // Arrivals never exceed `total`: the party that would push past it
        // completes the round instead.
        let arrived = self.seq.fetch_update(|(gen_, n)| {
            if n >= total {
                Some((gen_.wrapping_add(1), 0))
            } else {
                Some((gen_, n + 1))
            }
        });
        let (Ok((generation, n)) | Err((generation, n))) = arrived;

        let rc = if n >= total {
            waitchan::wake(
                WaitKey::of_limb(&self.seq, Limb::Lo),
                flags | WaitFlags::BROADCAST,
            );
            PTHREAD_BARRIER_SERIAL_THREAD
        } else {
            while self.seq.lo() == generation {
                waitchan::wait_limb(&self.seq, Limb::Lo, generation, None, flags);
            }
            0
        };
        self.release_ref();
        rc
    }

    /// Waits for in-flight `wait` calls to drain. `EBUSY` if a round is
    /// half full.
    pub fn destroy(&self) -> i32 {
        if self.seq.hi() != 0 {
            return errno::EBUSY;
        }
        self.release_ref();
        loop {
            let refs = self.nrefs.load(Ordering::SeqCst);
            if refs == 0 {
                return 0;
            }
            waitchan::wait(&self.nrefs, refs, None, WaitFlags::empty());
        }
    }
}
