//! Write-Timestamp Clock
//!
//! Line-protocol points carry a nanosecond timestamp assigned when the point
//! is formatted. All of those reads go through `WriteClock` so tests can pin
//! the exact timestamps that reach the sink.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of write timestamps (nanoseconds since the UNIX epoch)
pub trait WriteClock: Send + Sync + Clone + 'static {
    fn now_nanos(&self) -> i64;
}

/// Wall-clock time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl WriteClock for SystemClock {
    fn now_nanos(&self) -> i64 {
        // A clock set before 1970 writes at the epoch rather than failing the batch
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0)
    }
}

/// Simulated clock for deterministic testing
///
/// Time only advances when explicitly told to via `advance()` or `set()`.
/// Clones share the same time.
#[derive(Debug, Clone)]
pub struct SimulatedClock {
    time_ns: Arc<AtomicI64>,
}

impl Default for SimulatedClock {
    fn default() -> Self {
        Self::new(0)
    }
}

impl SimulatedClock {
    pub fn new(start_ns: i64) -> Self {
        SimulatedClock {
            time_ns: Arc::new(AtomicI64::new(start_ns)),
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.time_ns
            .fetch_add(duration.as_nanos() as i64, Ordering::SeqCst);
    }

    pub fn set(&self, time_ns: i64) {
        self.time_ns.store(time_ns, Ordering::SeqCst);
    }
}

impl WriteClock for SimulatedClock {
    fn now_nanos(&self) -> i64 {
        self.time_ns.load(Ordering::SeqCst)
    }
}
