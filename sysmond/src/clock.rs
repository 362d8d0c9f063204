//! Monotonic time sources for refresh cadence.
//!
//! Readings are offsets from an arbitrary origin fixed at construction. Only
//! differences between two readings of the same clock are meaningful.

use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;
use tokio::time::Instant;

pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;
}

/// Real monotonic clock. Backed by tokio's `Instant` so paused test runtimes
/// advance it together with their timers.
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Clock that only moves when told to.
#[derive(Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }

    pub fn set(&self, to: Duration) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// True when no previous mark exists or more than `interval` has passed since it.
pub(crate) fn elapsed_exceeds(now: Duration, last: Option<Duration>, interval: Duration) -> bool {
    match last {
        None => true,
        Some(last) => now.saturating_sub(last) > interval,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_only_on_request() {
        let clock = ManualClock::new();
        assert_eq!(clock.now(), Duration::ZERO);
        clock.advance(Duration::from_secs(3));
        clock.advance(Duration::from_millis(500));
        assert_eq!(clock.now(), Duration::from_millis(3500));
        clock.set(Duration::from_secs(1));
        assert_eq!(clock.now(), Duration::from_secs(1));
    }

    #[test]
    fn elapsed_is_strictly_greater() {
        let interval = Duration::from_secs(1);
        assert!(elapsed_exceeds(Duration::ZERO, None, interval));
        assert!(!elapsed_exceeds(Duration::from_secs(1), Some(Duration::ZERO), interval));
        assert!(elapsed_exceeds(
            Duration::from_millis(1001),
            Some(Duration::ZERO),
            interval
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn monotonic_clock_follows_paused_runtime() {
        let clock = MonotonicClock::new();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(clock.now() >= Duration::from_secs(5));
    }
}
