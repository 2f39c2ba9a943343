//! Wall-clock abstraction
//!
//! Protocol timestamps (handshake freshness, replay windows, session
//! rotation) all go through [`Clock`] so tests can fabricate skewed or
//! frozen time instead of sleeping.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of unix-epoch seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

/// Real wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

/// Shared clock handle with the system clock as the default.
pub fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

/// Manually advanced clock for tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: parking_lot::Mutex<u64>,
}

impl ManualClock {
    pub fn new(now: u64) -> Self {
        ManualClock {
            now: parking_lot::Mutex::new(now),
        }
    }

    pub fn set(&self, now: u64) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, secs: u64) {
        *self.now.lock() += secs;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_progresses() {
        assert!(SystemClock.now() > 1_600_000_000);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(100);
        assert_eq!(clock.now(), 100);
        clock.advance(31);
        assert_eq!(clock.now(), 131);
        clock.set(7);
        assert_eq!(clock.now(), 7);
    }
}
