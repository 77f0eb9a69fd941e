//! Pluggable clock used by every storage backend and gateway.
//!
//! The platform's expiry semantics depend on "now", so the clock is an
//! explicit constructor parameter rather than a process-wide source. The
//! live simulator uses [`SystemClock`]; tests inject a [`FakeClock`] and
//! advance it manually to make TTL and alarm behavior deterministic.
//!
//! # Examples
//!
//! ```rust
//! use kumo::clock::{Clock, FakeClock};
//! use std::sync::Arc;
//!
//! let clock = Arc::new(FakeClock::new(1_000_000));
//! clock.advance(2_000);
//! assert_eq!(clock.now_millis(), 1_002_000);
//! ```

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use std::time::{SystemTime, UNIX_EPOCH};

/// Monotonic time source returning unix milliseconds.
pub trait Clock: Send + Sync + 'static {
    /// Current time in unix milliseconds.
    fn now_millis(&self) -> u64;

    /// Current time in unix seconds, truncated.
    fn now_secs(&self) -> u64 {
        self.now_millis() / 1000
    }
}

/// Shared handle to a clock implementation.
pub type SharedClock = Arc<dyn Clock>;

/// Wall-clock time source used by the live simulator.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Manually advanced time source for tests.
#[derive(Debug, Default)]
pub struct FakeClock {
    millis: AtomicU64,
}

impl FakeClock {
    /// Creates a fake clock starting at the given unix-millisecond instant.
    pub fn new(start_millis: u64) -> Self {
        Self {
            millis: AtomicU64::new(start_millis),
        }
    }

    /// Moves the clock forward by `millis`.
    pub fn advance(&self, millis: u64) {
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }

    /// Sets the clock to an absolute unix-millisecond instant.
    pub fn set(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

/// Returns the default live clock.
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}
