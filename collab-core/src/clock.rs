//! Wall-clock timestamps in milliseconds since the Unix epoch.
//!
//! Timers use `tokio::time`; only *comparisons* between a client's creation
//! time and a scheduled deletion go through a [`Clock`], so tests can pin the
//! wall clock while the runtime clock is paused.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

pub trait Clock: Send + Sync + 'static {
    fn now_millis(&self) -> Timestamp;
}

/// Reads `SystemTime::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> Timestamp {
        let millis = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Timestamp::try_from(millis).unwrap_or(Timestamp::MAX)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: u64) -> Timestamp {
        self.now.fetch_add(millis, Ordering::SeqCst) + millis
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_after_2020() {
        // 2020-01-01T00:00:00Z
        assert!(SystemClock.now_millis() > 1_577_836_800_000);
    }

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_millis(), 1_000);
        assert_eq!(clock.advance(500), 1_500);
        clock.set(10);
        assert_eq!(clock.now_millis(), 10);
    }
}
