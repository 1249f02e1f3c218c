//! Injectable clock so time-dependent components are deterministic in tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Wall-clock and monotonic time source.
///
/// Return timers, ban expiry and reservations all read time through this
/// trait; production wiring passes [`SystemClock`], tests pass [`FakeClock`]
/// and advance it explicitly.
pub trait Clock: Send + Sync {
    /// Wall-clock time, epoch milliseconds. Used for event timestamps.
    fn now_millis(&self) -> u64;

    /// Monotonic nanoseconds from an arbitrary origin. Used for expiries.
    fn monotonic_nanos(&self) -> u64;
}

/// The real clock.
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    fn monotonic_nanos(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

/// A manually advanced clock for tests. The monotonic reading is derived
/// from the wall-clock value so a single `advance` moves both.
pub struct FakeClock {
    millis: AtomicU64,
}

impl FakeClock {
    pub fn new(start_millis: u64) -> Self {
        Self {
            millis: AtomicU64::new(start_millis),
        }
    }

    pub fn advance(&self, millis: u64) {
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }

    pub fn set(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }

    fn monotonic_nanos(&self) -> u64 {
        self.now_millis() * 1_000_000
    }
}
