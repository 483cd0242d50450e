use quanta::Instant;

use crate::time::after;

/// Deferred re-invocation of `dequeue`.
///
/// Armed when every backlogged class is throttled. Whoever drives the scheduler should call
/// `dequeue` again once [`Watchdog::fired`].
#[derive(Clone, Debug, Default)]
pub struct Watchdog {
    expires_at: Option<Instant>,
    arms: u64,
}

impl Watchdog {
    /// Arm to fire `delay` nanoseconds after `now`. Delays below one tick are rounded up.
    pub fn arm(&mut self, now: Instant, delay: i64) {
        self.expires_at = Some(after(now, delay.max(1)));
        self.arms += 1;
    }

    pub fn disarm(&mut self) {
        self.expires_at = None;
    }

    pub fn is_armed(&self) -> bool {
        self.expires_at.is_some()
    }

    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    pub fn fired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(t) if now >= t)
    }

    /// How many times the watchdog has been armed.
    pub fn arms(&self) -> u64 {
        self.arms
    }
}
