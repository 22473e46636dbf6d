use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use pr_telemetry_domain::{now_utc, DateTimeUtc};

/// Source of server time; stamps `ts_server_s` and lease deadlines.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTimeUtc;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTimeUtc {
        now_utc()
    }
}

/// Manually driven clock for deterministic runs.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTimeUtc>,
}

impl FixedClock {
    #[must_use]
    pub fn new(now: DateTimeUtc) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTimeUtc) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTimeUtc {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
