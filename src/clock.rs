// Millisecond monotonic clock used for tick gating and run diagnostics

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic millisecond clock
///
/// The counter may roll over, so elapsed time is always computed with
/// wrapping subtraction.
pub trait Clock {
    fn now_ms(&self) -> u64;

    fn elapsed_ms(&self, t0: u64) -> u64 {
        self.now_ms().wrapping_sub(t0)
    }
}

/// Clock backed by `tokio::time::Instant`, so paused test runtimes drive it too
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    origin: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Hand-driven clock for tests and simulation
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::Relaxed);
    }

    /// Advance with wraparound, like a hardware tick counter
    pub fn advance(&self, ms: u64) {
        let now = self.now.load(Ordering::Relaxed);
        self.now.store(now.wrapping_add(ms), Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }
}
