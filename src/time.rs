//! Monotonic time for the scheduler.
//!
//! All estimator arithmetic happens in signed nanoseconds ("ticks"), since idle times go
//! negative when a class sends faster than its rate.

use std::time::Duration;

use quanta::Instant;

/// Source of monotonic timestamps.
///
/// Implemented for [`quanta::Clock`]; tests use [`quanta::Clock::mock`] to step time by hand.
pub trait TimeSource: Send {
    fn now(&self) -> Instant;
}

impl TimeSource for quanta::Clock {
    fn now(&self) -> Instant {
        quanta::Clock::now(self)
    }
}

/// Signed nanoseconds from `earlier` to `later`.
pub fn tdiff(later: Instant, earlier: Instant) -> i64 {
    if later >= earlier {
        nanos(later.saturating_duration_since(earlier))
    } else {
        -nanos(earlier.saturating_duration_since(later))
    }
}

/// `t` shifted by a non-negative number of nanoseconds. Negative offsets are treated as zero.
pub fn after(t: Instant, ticks: i64) -> Instant {
    t + Duration::from_nanos(ticks.max(0) as u64)
}

pub fn nanos(d: Duration) -> i64 {
    d.as_nanos().min(i64::MAX as u128) as i64
}

#[cfg(test)]
mod t {
    use std::time::Duration;

    use super::{after, tdiff, TimeSource};

    #[test]
    fn signed_diff() {
        let (clk, mock) = quanta::Clock::mock();
        let a = TimeSource::now(&clk);
        mock.increment(Duration::from_micros(3));
        let b = TimeSource::now(&clk);

        assert_eq!(tdiff(b, a), 3_000);
        assert_eq!(tdiff(a, b), -3_000);
        assert_eq!(after(a, 3_000), b);
        assert_eq!(after(a, -10), a);
    }
}
