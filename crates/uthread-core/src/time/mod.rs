//! Absolute deadlines.
//!
//! Timed operations take an absolute [`Timespec`] measured against a clock
//! (`CLOCK_REALTIME` unless a condition variable selected
//! `CLOCK_MONOTONIC`). The deadline is converted into a relative
//! [`Duration`] right before each blocking attempt, never cached across
//! retries.

use std::time::Duration;

use crate::errno;

/// Represents a timespec value (seconds + nanoseconds).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timespec {
    /// Seconds.
    pub tv_sec: i64,
    /// Nanoseconds (0 to 999_999_999).
    pub tv_nsec: i64,
}

/// Clock identifiers accepted for deadlines.
pub const CLOCK_REALTIME: i32 = 0;
pub const CLOCK_MONOTONIC: i32 = 1;

const NSEC_PER_SEC: i64 = 1_000_000_000;

/// Returns `true` if `clock_id` can be used for deadlines.
#[must_use]
pub const fn valid_clock_id(clock_id: i32) -> bool {
    matches!(clock_id, CLOCK_REALTIME | CLOCK_MONOTONIC)
}

/// Validate a timespec nanosecond field: must be in [0, 999_999_999].
#[must_use]
pub const fn valid_timespec_nsec(tv_nsec: i64) -> bool {
    tv_nsec >= 0 && tv_nsec < NSEC_PER_SEC
}

impl Timespec {
    #[must_use]
    pub const fn new(tv_sec: i64, tv_nsec: i64) -> Self {
        Self { tv_sec, tv_nsec }
    }

    /// Reads `clock_id` (unknown ids read `CLOCK_REALTIME`).
    #[must_use]
    pub fn now(clock_id: i32) -> Self {
        let clk = if clock_id == CLOCK_MONOTONIC {
            libc::CLOCK_MONOTONIC
        } else {
            libc::CLOCK_REALTIME
        };
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: `ts` is a valid, writable timespec and `clk` a supported clock.
        unsafe { libc::clock_gettime(clk, &mut ts) };
        Self {
            tv_sec: ts.tv_sec as i64,
            tv_nsec: ts.tv_nsec as i64,
        }
    }

    /// A deadline `after` from now on `clock_id`.
    #[must_use]
    pub fn after(clock_id: i32, after: Duration) -> Self {
        Self::now(clock_id).saturating_add(after)
    }

    #[must_use]
    pub fn saturating_add(self, d: Duration) -> Self {
        let secs = i64::try_from(d.as_secs()).unwrap_or(i64::MAX);
        let mut tv_sec = self.tv_sec.saturating_add(secs);
        let mut tv_nsec = self.tv_nsec + i64::from(d.subsec_nanos());
        if tv_nsec >= NSEC_PER_SEC {
            tv_nsec -= NSEC_PER_SEC;
            tv_sec = tv_sec.saturating_add(1);
        }
        Self { tv_sec, tv_nsec }
    }

    /// Time left until `self`, measured on `clock_id`.
    ///
    /// `EINVAL` for a malformed nanosecond field, `ETIMEDOUT` once the
    /// deadline has passed (including negative seconds).
    pub fn remaining(&self, clock_id: i32) -> Result<Duration, i32> {
        if !valid_timespec_nsec(self.tv_nsec) {
            return Err(errno::EINVAL);
        }
        if self.tv_sec < 0 {
            return Err(errno::ETIMEDOUT);
        }
        let now = Self::now(clock_id);
        let mut sec = self.tv_sec - now.tv_sec;
        let mut nsec = self.tv_nsec - now.tv_nsec;
        if nsec < 0 {
            sec -= 1;
            nsec += NSEC_PER_SEC;
        }
        if sec < 0 || (sec == 0 && nsec == 0) {
            return Err(errno::ETIMEDOUT);
        }
        Ok(Duration::new(sec as u64, nsec as u32))
    }
}

impl From<libc::timespec> for Timespec {
    fn from(ts: libc::timespec) -> Self {
        Self {
            tv_sec: ts.tv_sec as i64,
            tv_nsec: ts.tv_nsec as i64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn clock_ids() {
        assert!(valid_clock_id(CLOCK_REALTIME));
        assert!(valid_clock_id(CLOCK_MONOTONIC));
        assert!(!valid_clock_id(2));
        assert!(!valid_clock_id(-1));
    }

    #[test]
    fn malformed_nsec_is_einval_even_in_the_past() {
        assert_eq!(
            Timespec::new(0, 1_000_000_000).remaining(CLOCK_REALTIME),
            Err(errno::EINVAL)
        );
        assert_eq!(Timespec::new(0, -1).remaining(CLOCK_MONOTONIC), Err(errno::EINVAL));
    }

    #[test]
    fn past_deadlines_time_out() {
        assert_eq!(Timespec::new(-5, 0).remaining(CLOCK_REALTIME), Err(errno::ETIMEDOUT));
        assert_eq!(Timespec::new(1, 0).remaining(CLOCK_REALTIME), Err(errno::ETIMEDOUT));
        let now = Timespec::now(CLOCK_MONOTONIC);
        assert_eq!(now.remaining(CLOCK_MONOTONIC), Err(errno::ETIMEDOUT));
    }

    #[test]
    fn future_deadline_leaves_positive_duration() {
        let deadline = Timespec::after(CLOCK_MONOTONIC, Duration::from_secs(5));
        let left = deadline.remaining(CLOCK_MONOTONIC).unwrap();
        assert!(left > Duration::from_secs(4));
        assert!(left <= Duration::from_secs(5));
    }

    #[test]
    fn monotonic_never_goes_backwards() {
        let a = Timespec::now(CLOCK_MONOTONIC);
        let b = Timespec::now(CLOCK_MONOTONIC);
        assert!(b >= a);
    }

    proptest! {
        #[test]
        fn prop_saturating_add_keeps_nsec_normalized(
            sec in 0i64..1_000_000,
            nsec in 0i64..1_000_000_000,
            add_ms in 0u64..10_000_000
        ) {
            let ts = Timespec::new(sec, nsec).saturating_add(Duration::from_millis(add_ms));
            prop_assert!(valid_timespec_nsec(ts.tv_nsec));
            let before = sec as i128 * 1_000_000_000 + nsec as i128;
            let after = ts.tv_sec as i128 * 1_000_000_000 + ts.tv_nsec as i128;
            prop_assert_eq!(after - before, add_ms as i128 * 1_000_000);
        }
    }
}
