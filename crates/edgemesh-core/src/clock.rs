//! Injectable wall-clock reader.
//!
//! The scheduler never calls `Utc::now()` directly; every timestamp
//! comparison goes through a `Clock` so tests can control time precisely
//! (lease expiry, retry delays, freshness thresholds all depend on it).

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};

/// Source of the current wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Default clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that always returns a fixed instant, for deterministic tests.
#[derive(Debug, Clone)]
pub struct FixedClock {
    at: DateTime<Utc>,
}

impl FixedClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self { at }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.at
    }
}

/// A clock that can be advanced explicitly between assertions, for tests
/// that need to simulate the passage of time (lease expiry, reaper sweeps)
/// without real sleeps.
#[derive(Debug, Clone)]
pub struct StepClock {
    millis_since_epoch: Arc<AtomicI64>,
}

impl StepClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            millis_since_epoch: Arc::new(AtomicI64::new(start.timestamp_millis())),
        }
    }

    /// Advance the clock by `ms` milliseconds and return the new instant.
    pub fn advance_ms(&self, ms: i64) -> DateTime<Utc> {
        let updated = self.millis_since_epoch.fetch_add(ms, Ordering::SeqCst) + ms;
        DateTime::from_timestamp_millis(updated).expect("valid timestamp")
    }
}

impl Clock for StepClock {
    fn now(&self) -> DateTime<Utc> {
        let ms = self.millis_since_epoch.load(Ordering::SeqCst);
        DateTime::from_timestamp_millis(ms).expect("valid timestamp")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_clock_never_moves() {
        let at = Utc::now();
        let clock = FixedClock::new(at);
        assert_eq!(clock.now(), at);
        assert_eq!(clock.now(), at);
    }

    #[test]
    fn step_clock_advances_monotonically() {
        let start = Utc::now();
        let clock = StepClock::new(start);
        let first = clock.now();
        let second = clock.advance_ms(500);
        assert!(second > first);
        assert_eq!((second - first).num_milliseconds(), 500);
    }
}
