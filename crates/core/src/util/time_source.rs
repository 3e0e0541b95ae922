use std::time::Instant;

#[cfg(any(test, feature = "testing"))]
use std::{sync::Arc, time::Duration};

#[cfg(any(test, feature = "testing"))]
use parking_lot::Mutex;

/// Source of monotonic time for timers and transaction deadlines.
///
/// Everything time-dependent in a node reads the clock through this trait so
/// tests can drive expiry deterministically with [`MockTimeSource`].
pub trait TimeSource {
    fn now(&self) -> Instant;
}

/// A simple time source that returns the current time using `Instant::now()`.
#[derive(Clone, Copy, Debug, Default)]
pub struct InstantTimeSrc(());

impl InstantTimeSrc {
    pub fn new() -> Self {
        InstantTimeSrc(())
    }
}

impl TimeSource for InstantTimeSrc {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually advanced clock.
///
/// Clones share the same instant, so a test can keep one handle and move
/// time forward while the timer service holds another.
#[cfg(any(test, feature = "testing"))]
#[derive(Clone, Debug)]
pub struct MockTimeSource {
    current_instant: Arc<Mutex<Instant>>,
}

#[cfg(any(test, feature = "testing"))]
impl MockTimeSource {
    pub fn new(start_instant: Instant) -> Self {
        MockTimeSource {
            current_instant: Arc::new(Mutex::new(start_instant)),
        }
    }

    pub fn advance_time(&self, duration: Duration) {
        *self.current_instant.lock() += duration;
    }
}

#[cfg(any(test, feature = "testing"))]
impl TimeSource for MockTimeSource {
    fn now(&self) -> Instant {
        *self.current_instant.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_clones_share_time() {
        let start = Instant::now();
        let clock = MockTimeSource::new(start);
        let other = clock.clone();
        clock.advance_time(Duration::from_millis(25));
        assert_eq!(other.now(), start + Duration::from_millis(25));
    }

    #[test]
    fn instant_source_is_monotonic() {
        let clock = InstantTimeSrc::new();
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first);
    }
}
