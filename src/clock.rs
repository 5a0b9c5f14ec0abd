//! Wall-clock abstraction.
//!
//! Commit stamps, lag and grace periods all read time through [`Clock`] so
//! that tests can drive them deterministically with a [`ManualClock`].

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;

/// Source of wall-clock time.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;
}

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// The system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<RwLock<DateTime<Utc>>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(RwLock::new(start)),
        }
    }

    /// Create a clock frozen at the current system time.
    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    /// Move the clock forward.
    pub fn advance(&self, by: std::time::Duration) {
        let delta = ChronoDuration::from_std(by).unwrap_or(ChronoDuration::zero());
        let mut now = self.now.write();
        *now += delta;
    }

    /// Jump to an absolute time. Going backwards is ignored.
    pub fn set(&self, to: DateTime<Utc>) {
        let mut now = self.now.write();
        if to > *now {
            *now = to;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}

/// Elapsed time between two instants as a std duration, zero if negative.
pub fn elapsed_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> std::time::Duration {
    (later - earlier).to_std().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::starting_now();
        let start = clock.now();
        clock.advance(Duration::from_secs(5));
        assert_eq!(elapsed_between(start, clock.now()), Duration::from_secs(5));
    }

    #[test]
    fn test_manual_clock_never_goes_back() {
        let clock = ManualClock::starting_now();
        let start = clock.now();
        clock.set(start - ChronoDuration::seconds(10));
        assert_eq!(clock.now(), start);
    }

    #[test]
    fn test_elapsed_between_negative_is_zero() {
        let now = Utc::now();
        let earlier = now - ChronoDuration::seconds(1);
        assert_eq!(elapsed_between(now, earlier), Duration::ZERO);
    }
}
