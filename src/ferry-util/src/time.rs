//! Monotonic time values with microsecond resolution.
use std::fmt;
use std::ops::{Add, Sub};
use std::time::Duration;

use lazy_static::lazy_static;
use minstant::Instant;

const USEC_PER_SEC: u64 = 1_000_000;

lazy_static! {
    // Every `Time` is an offset from this anchor.
    static ref EPOCH: Instant = Instant::now();
}

/// A (seconds, microseconds) pair read from a monotonic source.
///
/// `usec` is always below one million. Subtraction saturates to zero, so callers that care
/// about the sign must compare first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Time {
    sec: u64,
    usec: u32,
}

impl Time {
    pub const ZERO: Time = Time { sec: 0, usec: 0 };

    #[inline]
    pub fn new(sec: u64, usec: u32) -> Self {
        let carry = usec as u64 / USEC_PER_SEC;
        Time {
            sec: sec + carry,
            usec: (usec as u64 % USEC_PER_SEC) as u32,
        }
    }

    /// Current monotonic time.
    #[inline]
    pub fn now() -> Self {
        Time::from(EPOCH.elapsed())
    }

    #[inline]
    pub fn sec(&self) -> u64 {
        self.sec
    }

    #[inline]
    pub fn usec(&self) -> u32 {
        self.usec
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.sec == 0 && self.usec == 0
    }

    #[inline]
    pub fn less(&self, other: &Time) -> bool {
        self < other
    }

    pub fn add(&self, other: &Time) -> Time {
        let mut sec = self.sec.saturating_add(other.sec);
        let mut usec = self.usec + other.usec;
        if usec as u64 >= USEC_PER_SEC {
            usec -= USEC_PER_SEC as u32;
            sec = sec.saturating_add(1);
        }
        Time { sec, usec }
    }

    /// `self - other`, or zero when `other` is the larger value.
    pub fn sub(&self, other: &Time) -> Time {
        if self <= other {
            return Time::ZERO;
        }
        if self.usec >= other.usec {
            Time {
                sec: self.sec - other.sec,
                usec: self.usec - other.usec,
            }
        } else {
            Time {
                sec: self.sec - other.sec - 1,
                usec: self.usec + USEC_PER_SEC as u32 - other.usec,
            }
        }
    }

    #[inline]
    pub fn to_seconds(&self) -> f64 {
        self.sec as f64 + self.usec as f64 * 0.000001
    }

    /// Truncates to microsecond resolution. Negative and non-finite inputs yield zero.
    pub fn from_seconds(d: f64) -> Time {
        if !d.is_finite() || d <= 0.0 {
            return Time::ZERO;
        }
        let sec = d.trunc();
        let usec = ((d - sec) * USEC_PER_SEC as f64) as u64;
        Time::new(sec as u64, usec.min(USEC_PER_SEC - 1) as u32)
    }

    #[inline]
    pub fn from_millis(ms: u64) -> Time {
        Time {
            sec: ms / 1000,
            usec: ((ms % 1000) * 1000) as u32,
        }
    }

    #[inline]
    pub fn as_duration(&self) -> Duration {
        Duration::new(self.sec, self.usec * 1000)
    }
}

impl From<Duration> for Time {
    #[inline]
    fn from(d: Duration) -> Self {
        Time {
            sec: d.as_secs(),
            usec: d.subsec_micros(),
        }
    }
}

impl From<Time> for Duration {
    #[inline]
    fn from(t: Time) -> Self {
        t.as_duration()
    }
}

impl Add for Time {
    type Output = Time;
    #[inline]
    fn add(self, rhs: Time) -> Time {
        Time::add(&self, &rhs)
    }
}

impl Sub for Time {
    type Output = Time;
    #[inline]
    fn sub(self, rhs: Time) -> Time {
        Time::sub(&self, &rhs)
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}s", self.sec, self.usec)
    }
}

/// Block the calling thread for at least `rqt`.
///
/// Returns the part of the request that was not slept, which is zero unless the sleep was cut
/// short. Callers treat an early return as non-fatal.
pub fn sleep(rqt: Time) -> Time {
    let deadline = Time::now() + rqt;
    std::thread::sleep(rqt.as_duration());
    deadline - Time::now()
}

/// Local wall-clock stamp for human-facing output, e.g. `Mon, 19 Oct 2026 13:11:02 +00:00`.
///
/// This is the only place that reads the wall clock; it is never used for deadlines.
pub fn stamp() -> String {
    chrono::Local::now().format("%a, %d %b %Y %T %Z").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_monotonic() {
        let mut prev = Time::now();
        for _ in 0..10_000 {
            let t = Time::now();
            assert!(prev.less(&t) || prev == t, "{} went back to {}", prev, t);
            prev = t;
        }
    }

    #[test]
    fn add_carries_microseconds() {
        let a = Time::new(1, 600_000);
        let b = Time::new(2, 400_000);
        assert_eq!(a + b, Time::new(4, 0));
        assert_eq!(Time::new(0, 999_999) + Time::new(0, 1), Time::new(1, 0));
    }

    #[test]
    fn sub_borrows_and_saturates() {
        assert_eq!(Time::new(3, 100) - Time::new(1, 200), Time::new(1, 999_900));
        assert_eq!(Time::new(1, 0) - Time::new(2, 0), Time::ZERO);
        assert_eq!(Time::new(1, 5) - Time::new(1, 5), Time::ZERO);
    }

    #[test]
    fn seconds_conversion_truncates() {
        let t = Time::from_seconds(2.5000019);
        assert_eq!(t.sec(), 2);
        assert_eq!(t.usec(), 500_001);
        assert_eq!(Time::from_seconds(-3.0), Time::ZERO);
        assert!((Time::new(7, 250_000).to_seconds() - 7.25).abs() < 1e-9);
    }

    #[test]
    fn millis_convert() {
        assert_eq!(Time::from_millis(1500), Time::new(1, 500_000));
        assert_eq!(Time::from_millis(999).as_duration(), std::time::Duration::from_millis(999));
    }

    #[test]
    fn sleep_waits_at_least_requested() {
        let start = Time::now();
        let rem = sleep(Time::from_millis(5));
        assert!(rem.is_zero());
        assert!(!(Time::now() - start).less(&Time::from_millis(5)));
    }

    #[test]
    fn stamp_is_nonempty() {
        assert!(!stamp().is_empty());
    }
}
