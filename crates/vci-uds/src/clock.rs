//! Time source capability
//!
//! Transactions never read the system clock directly. They receive a
//! [`Clock`] so that tests can drive timeouts deterministically with a
//! [`ManualClock`].

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Monotonic time source with a blocking sleep
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    fn sleep(&self, duration: Duration);
}

/// Real time, backed by [`Instant`] and [`std::thread::sleep`]
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Virtual time that only moves when told to
///
/// `sleep` advances the clock instead of blocking, so a transaction that
/// waits for 5 seconds of silence completes immediately in a test.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, duration: Duration) {
        *self.offset.lock() += duration;
    }

    /// Virtual time elapsed since construction
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
        std::thread::yield_now();
    }
}
