//! Time sources for the engine's scheduler tick.
//!
//! The engine never reads the wall clock directly. Hosts inject a [`Clock`]:
//! [`SystemClock`] in the real application, [`ManualClock`] wherever time has
//! to be advanced deterministically.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Monotonic time source in seconds.
pub trait Clock: Send + Sync {
    /// Seconds since an arbitrary fixed origin.
    fn now(&self) -> f64;

    /// Lets `duration` pass. Real clocks sleep; virtual clocks advance.
    fn wait(&self, duration: Duration);
}

/// Monotonic wall clock.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn wait(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Virtual clock advanced by hand. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    micros: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves time forward.
    pub fn advance(&self, duration: Duration) {
        self.micros
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Moves time forward by fractional seconds.
    pub fn advance_secs(&self, seconds: f64) {
        self.advance(Duration::from_secs_f64(seconds.max(0.0)));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        self.micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }

    fn wait(&self, duration: Duration) {
        self.advance(duration);
    }
}
