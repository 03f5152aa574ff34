//! Counting semaphores.
//!
//! State is a [`PairedCounter`] of (value, waiters). A blocked waiter
//! takes a unit and drops its waiter registration in one CAS, so post only
//! has to wake someone when the waiter limb is nonzero.

use std::time::Duration;

use super::cancel;
use super::cleanup;
use crate::errno;
use crate::sync::paired::{Limb, PairedCounter};
use crate::sync::waitchan::{self, WaitFlags, WaitKey, WaitStatus};
use crate::time::{CLOCK_REALTIME, Timespec};

pub const SEM_VALUE_MAX: u32 = 0x7FFF_FFFF;

#[derive(Debug)]
pub struct Semaphore {
    vw: PairedCounter,
    shared: bool,
}

fn unregister(sem: &Semaphore) {
    sem.vw.add_hi(-1);
}

impl Semaphore {
    /// `EINVAL` when `value` exceeds [`SEM_VALUE_MAX`].
    pub fn new(value: u32, shared: bool) -> Result<Self, i32> {
        if value > SEM_VALUE_MAX {
            return Err(errno::EINVAL);
        }
        Ok(Self {
            vw: PairedCounter::new(value, 0),
            shared,
        })
    }

    fn wait_flags(&self) -> WaitFlags {
        if self.shared {
            WaitFlags::SHARED
        } else {
            WaitFlags::empty()
        }
    }

    pub fn post(&self) -> i32 {
        let posted = self.vw.fetch_update(|(value, waiters)| {
            (value < SEM_VALUE_MAX).then_some((value + 1, waiters))
        });
        match posted {
            Err(_) => errno::EOVERFLOW,
            Ok((_, waiters)) => {
                if waiters > 0 {
                    waitchan::wake(WaitKey::of_limb(&self.vw, Limb::Lo), self.wait_flags());
                }
                0
            }
        }
    }

    fn try_take(&self) -> bool {
        self.vw
            .fetch_update(|(value, waiters)| (value > 0).then_some((value - 1, waiters)))
            .is_ok()
    }

    /// `EAGAIN` when no unit is available.
    pub fn trywait(&self) -> i32 {
        if self.try_take() { 0 } else { errno::EAGAIN }
    }

    /// Blocks until a unit is available. A cancellation point.
    pub fn wait(&self) -> i32 {
        self.wait_until(None)
    }

    /// [`Self::wait`] with an absolute deadline on `CLOCK_REALTIME`.
    pub fn timedwait(&self, abstime: &Timespec) -> i32 {
        self.wait_until(Some((abstime, CLOCK_REALTIME)))
    }

    pub fn clockwait(&self, clock_id: i32, abstime: &Timespec) -> i32 {
        if !crate::time::valid_clock_id(clock_id) {
            return errno::EINVAL;
        }
        self.wait_until(Some((abstime, clock_id)))
    }

    fn wait_until(&self, deadline: Option<(&Timespec, i32)>) -> i32 {
        if self.try_take() {
            return 0;
        }
        self.vw.add_hi(1);
        let rc = cleanup::with_cleanup(self, unregister, || self.wait_registered(deadline));
        if rc != 0 {
            unregister(self);
        }
        rc
    }

    /// Waits as a registered waiter. On success the registration has been
    /// consumed together with the unit.
    fn wait_registered(&self, deadline: Option<(&Timespec, i32)>) -> i32 {
        let flags = self.wait_flags();
        loop {
            let taken = self.vw.fetch_update(|(value, waiters)| {
                (value > 0).then(|| (value - 1, waiters.wrapping_sub(1)))
            });
            if taken.is_ok() {
                return 0;
            }
            let timeout: Option<Duration> = match deadline {
                Some((abstime, clock_id)) => match abstime.remaining(clock_id) {
                    Ok(left) => Some(left),
                    Err(e) => return e,
                },
                None => None,
            };
            let prev = cancel::cancelpoint_begin();
            let status = waitchan::wait_limb(&self.vw, Limb::Lo, 0, timeout, flags);
            cancel::cancelpoint_end(prev);
            match status {
                WaitStatus::Woken => {}
                WaitStatus::Interrupted => return errno::EINTR,
                WaitStatus::TimedOut => {
                    if self.vw.lo() == 0 {
                        return errno::ETIMEDOUT;
                    }
                }
            }
        }
    }

    #[must_use]
    pub fn getvalue(&self) -> u32 {
        self.vw.lo()
    }

    #[must_use]
    pub fn waiters(&self) -> u32 {
        self.vw.hi()
    }

    /// `EBUSY` while threads are blocked on it.
    pub fn destroy(&self) -> i32 {
        if self.vw.hi() != 0 {
            return errno::EBUSY;
        }
        0
    }
}
