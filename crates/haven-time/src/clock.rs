//! Clock implementations for Haven

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use haven_core::Timestamp;

/// Wall-clock capability
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Operating-system wall clock
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        SystemClock
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Timestamp::from_millis(millis)
    }
}

/// Manually driven clock
/// INVARIANT: only moves when told to; clones share the same time
#[derive(Clone, Debug)]
pub struct ManualClock {
    value: Arc<Mutex<Timestamp>>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        ManualClock {
            value: Arc::new(Mutex::new(start)),
        }
    }

    /// Advance by a duration, returns the new time
    pub fn advance(&self, dt: Duration) -> Timestamp {
        let mut value = self.value.lock();
        *value = *value + dt;
        *value
    }

    /// Jump to a specific time (may move backwards, for skew tests)
    pub fn set(&self, t: Timestamp) {
        *self.value.lock() = t;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        ManualClock::new(Timestamp::from_secs(1_700_000_000))
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.value.lock()
    }
}
