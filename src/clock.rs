//! Time sources
//!
//! Protocol state machines never read the clock themselves: they receive
//! `now` from the driver, which takes it from a [`Clock`]. Tests swap in a
//! [`ManualClock`] and step time explicitly.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Source of monotonic and wall-clock time
pub trait Clock: Send + Sync {
    /// Monotonic time used for every deadline
    fn now(&self) -> Instant;

    /// Milliseconds since the Unix epoch, used for timestamps sent to peers
    fn unix_millis(&self) -> i64;
}

/// The real clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn unix_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// A clock that only moves when told to
#[derive(Debug, Clone)]
pub struct ManualClock {
    inner: Arc<Mutex<ManualTime>>,
}

#[derive(Debug)]
struct ManualTime {
    now: Instant,
    unix_millis: i64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManualTime {
                now: Instant::now(),
                unix_millis: 1_700_000_000_000,
            })),
        }
    }

    /// Move both time sources forward
    pub fn advance(&self, by: Duration) {
        let mut time = self.inner.lock();
        time.now += by;
        time.unix_millis += by.as_millis() as i64;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.inner.lock().now
    }

    fn unix_millis(&self) -> i64 {
        self.inner.lock().unix_millis
    }
}
