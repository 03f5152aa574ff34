//! Two 32-bit limbs packed into one atomic 64-bit word.
//!
//! Condition variables, semaphores, barriers and read-write locks keep a
//! (counter, waiters) pair in a [`PairedCounter`] so both halves can be read
//! and compare-and-swapped together. Single-limb additions go through a CAS
//! loop that wraps inside the limb and never carries into its neighbour.

use std::sync::atomic::{AtomicU64, Ordering};

/// Selects one half of a [`PairedCounter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limb {
    Lo,
    Hi,
}

#[inline]
const fn pack(lo: u32, hi: u32) -> u64 {
    (lo as u64) | ((hi as u64) << 32)
}

#[inline]
const fn unpack(v: u64) -> (u32, u32) {
    (v as u32, (v >> 32) as u32)
}

/// A `(lo, hi)` pair updated atomically as a unit.
#[repr(C, align(8))]
#[derive(Debug, Default)]
pub struct PairedCounter {
    qv: AtomicU64,
}

impl PairedCounter {
    #[must_use]
    pub const fn new(lo: u32, hi: u32) -> Self {
        Self {
            qv: AtomicU64::new(pack(lo, hi)),
        }
    }

    #[inline]
    pub fn load(&self) -> (u32, u32) {
        unpack(self.qv.load(Ordering::SeqCst))
    }

    #[inline]
    pub fn load_quad(&self) -> u64 {
        self.qv.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn lo(&self) -> u32 {
        self.load().0
    }

    #[inline]
    pub fn hi(&self) -> u32 {
        self.load().1
    }

    #[inline]
    pub fn limb(&self, limb: Limb) -> u32 {
        match limb {
            Limb::Lo => self.lo(),
            Limb::Hi => self.hi(),
        }
    }

    #[inline]
    pub fn store(&self, lo: u32, hi: u32) {
        self.qv.store(pack(lo, hi), Ordering::SeqCst);
    }

    /// Replaces `current` with `new`. On failure returns the observed pair.
    #[inline]
    pub fn compare_exchange(&self, current: (u32, u32), new: (u32, u32)) -> Result<(), (u32, u32)> {
        self.qv
            .compare_exchange(
                pack(current.0, current.1),
                pack(new.0, new.1),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map(|_| ())
            .map_err(unpack)
    }

    /// Applies `f` to the pair in a CAS loop until it returns `None` or the
    /// swap succeeds. Returns the pair observed before the successful swap,
    /// or `Err` with the pair that made `f` decline.
    pub fn fetch_update(
        &self,
        mut f: impl FnMut((u32, u32)) -> Option<(u32, u32)>,
    ) -> Result<(u32, u32), (u32, u32)> {
        let mut cur = self.load();
        loop {
            let Some(next) = f(cur) else {
                return Err(cur);
            };
            match self.compare_exchange(cur, next) {
                Ok(()) => return Ok(cur),
                Err(seen) => cur = seen,
            }
        }
    }

    /// Adds `delta` to one limb, wrapping inside that limb. Returns the pair
    /// as it was before the addition.
    pub fn add(&self, limb: Limb, delta: i32) -> (u32, u32) {
        let step = |v: u32| v.wrapping_add_signed(delta);
        let prev = self.fetch_update(|(lo, hi)| {
            Some(match limb {
                Limb::Lo => (step(lo), hi),
                Limb::Hi => (lo, step(hi)),
            })
        });
        match prev {
            Ok(p) | Err(p) => p,
        }
    }

    #[inline]
    pub fn add_lo(&self, delta: i32) -> (u32, u32) {
        self.add(Limb::Lo, delta)
    }

    #[inline]
    pub fn add_hi(&self, delta: i32) -> (u32, u32) {
        self.add(Limb::Hi, delta)
    }

    /// Address of the whole word.
    #[inline]
    pub fn addr(&self) -> usize {
        &self.qv as *const AtomicU64 as usize
    }

    /// Address of one limb as laid out in memory.
    #[inline]
    pub fn limb_addr(&self, limb: Limb) -> usize {
        let low_first = cfg!(target_endian = "little");
        let offset = match (limb, low_first) {
            (Limb::Lo, true) | (Limb::Hi, false) => 0,
            (Limb::Lo, false) | (Limb::Hi, true) => 4,
        };
        self.addr() + offset
    }
}
