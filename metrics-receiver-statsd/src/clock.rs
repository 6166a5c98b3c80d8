//! Wall-clock sources.
//!
//! Aggregated series are stamped with unix timestamps in nanoseconds. The aggregator asks an
//! injected [`Clock`] for "now" rather than reading the system time directly, so that tests can
//! control time with a [`MockClock`].
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

/// A source of wall-clock time.
pub trait Clock: Send + 'static {
    /// Returns the current time as nanoseconds since the unix epoch.
    fn now(&self) -> u64;
}

/// The system wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}

/// A manually driven clock.
///
/// Clones share the same underlying time, so a test can keep one handle and give another to the
/// aggregator.
#[derive(Clone, Debug, Default)]
pub struct MockClock {
    nanos: Arc<AtomicU64>,
}

impl MockClock {
    /// Creates a new `MockClock` starting at the given unix time in nanoseconds.
    pub fn new(start: u64) -> Self {
        Self { nanos: Arc::new(AtomicU64::new(start)) }
    }

    /// Moves the clock forward by `amount`.
    pub fn increment(&self, amount: Duration) {
        let nanos = u64::try_from(amount.as_nanos()).unwrap_or(u64::MAX);
        self.nanos.fetch_add(nanos, Ordering::AcqRel);
    }

    /// Sets the clock to the given unix time in nanoseconds.
    pub fn set(&self, nanos: u64) {
        self.nanos.store(nanos, Ordering::Release);
    }
}

impl Clock for MockClock {
    fn now(&self) -> u64 {
        self.nanos.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{Clock, MockClock, SystemClock};

    #[test]
    fn mock_clock_is_shared_between_clones() {
        let clock = MockClock::new(1_000);
        let handle = clock.clone();

        handle.increment(Duration::from_nanos(500));
        assert_eq!(clock.now(), 1_500);

        handle.set(42);
        assert_eq!(clock.now(), 42);
    }

    #[test]
    fn system_clock_is_past_epoch() {
        // 2020-01-01T00:00:00Z
        assert!(SystemClock.now() > 1_577_836_800_000_000_000);
    }
}
