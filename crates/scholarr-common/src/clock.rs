//! Process-wide clock abstraction.
//!
//! Wall time (`now`) is used for persisted timestamps and cooldown windows;
//! monotonic time (`monotonic`) is used for pacing gaps and deadlines. Code
//! under test swaps in [`ManualClock`] so cooldown and backoff arithmetic can
//! be driven without sleeping.

use std::sync::Arc;
use std::sync::Mutex;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::time::Instant;

pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Monotonic instant for deadlines and inter-request gaps.
    fn monotonic(&self) -> Instant;
}

pub type SharedClock = Arc<dyn Clock>;

/// Production clock backed by the system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> Instant {
        Instant::now()
    }
}

/// Test clock with manually advanced wall time.
///
/// `monotonic` still defers to tokio's instant so tests can combine it with
/// `tokio::test(start_paused = true)`.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, delta: ChronoDuration) {
        let mut now = self.now.lock().unwrap();
        *now += delta;
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap() = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    fn monotonic(&self) -> Instant {
        Instant::now()
    }
}
