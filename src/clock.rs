//! Injectable time source.
//!
//! Every component that stamps rows or computes period keys takes an
//! `Arc<dyn Clock>` so tests can advance time deterministically.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Wall-clock abstraction.
pub trait Clock: Send + Sync {
    /// Current wall time.
    fn now(&self) -> DateTime<Utc>;

    /// Current wall time as an RFC 3339 string (the storage format).
    fn now_string(&self) -> String {
        self.now().to_rfc3339()
    }
}

/// Production clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Test clock with a manually advanced wall time.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, delta: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += chrono::Duration::from_std(delta).expect("advance out of range");
    }

    /// Set the clock to an absolute time.
    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap() = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}
