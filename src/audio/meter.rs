//! VU metering.
//!
//! The audio thread writes the most recent samples of each signal path into
//! an [`AnalysisTap`]; the control thread snapshots the tap on every tick and
//! turns the window into a 0..1 level with a [`LevelMeter`].

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

/// Default analysis window in samples.
pub const DEFAULT_WINDOW: usize = 128;

/// Default gain applied to the RMS before clamping.
pub const DEFAULT_GAIN: f32 = 2.0;

/// Root mean square of a window (0 for an empty window).
pub fn rms(window: &[f32]) -> f32 {
    if window.is_empty() {
        return 0.0;
    }
    let sum: f64 = window.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / window.len() as f64).sqrt() as f32
}

/// Scaled and clamped RMS level of a window.
pub fn window_level(window: &[f32], gain: f32) -> f32 {
    (rms(window) * gain).clamp(0.0, 1.0)
}

/// Converts a window into a smoothed 0..1 level.
///
/// Rises instantly and falls back by `smoothing` per update, which keeps
/// the needle readable at tick rates of a few tens of milliseconds.
#[derive(Debug, Clone)]
pub struct LevelMeter {
    gain: f32,
    smoothing: f32,
    level: f32,
}

impl LevelMeter {
    /// # Arguments
    ///
    /// * `gain` - Factor applied to the RMS before clamping
    /// * `smoothing` - Fraction of the previous level retained on decay (0..1)
    pub fn new(gain: f32, smoothing: f32) -> Self {
        Self {
            gain,
            smoothing: smoothing.clamp(0.0, 0.99),
            level: 0.0,
        }
    }

    /// Feeds a window and returns the new level.
    pub fn update(&mut self, window: &[f32]) -> f32 {
        let raw = window_level(window, self.gain);
        self.level = raw.max(self.level * self.smoothing);
        self.level
    }

    pub fn level(&self) -> f32 {
        self.level
    }

    pub fn reset(&mut self) {
        self.level = 0.0;
    }
}

impl Default for LevelMeter {
    fn default() -> Self {
        Self::new(DEFAULT_GAIN, 0.3)
    }
}

/// Fixed ring of the most recent samples, stored as `f32` bits.
#[derive(Debug)]
struct TapRing {
    samples: Box<[AtomicU32]>,
    /// Total samples ever written; the next write goes to `written % len`.
    written: AtomicUsize,
    /// Value of `written` at the last `clear`.
    cleared: AtomicUsize,
}

/// Shared sample window between a signal path and the meter.
///
/// Lock-free: the writer stores samples with relaxed atomics and publishes
/// the write position with release ordering, so the audio thread never
/// waits on the control thread. Expects one writer at a time; a snapshot
/// racing a write may mix samples from two blocks, which is harmless for
/// metering.
#[derive(Debug, Clone)]
pub struct AnalysisTap {
    ring: Arc<TapRing>,
}

impl AnalysisTap {
    pub fn new(size: usize) -> Self {
        Self {
            ring: Arc::new(TapRing {
                samples: (0..size.max(1)).map(|_| AtomicU32::new(0)).collect(),
                written: AtomicUsize::new(0),
                cleared: AtomicUsize::new(0),
            }),
        }
    }

    /// Writes a block of samples (audio thread).
    pub fn write(&self, samples: &[f32]) {
        let ring = &self.ring;
        let len = ring.samples.len();
        let mut pos = ring.written.load(Ordering::Relaxed);
        for &s in samples {
            ring.samples[pos % len].store(s.to_bits(), Ordering::Relaxed);
            pos = pos.wrapping_add(1);
        }
        ring.written.store(pos, Ordering::Release);
    }

    /// Copies the current window, oldest sample first (control thread).
    pub fn snapshot(&self, out: &mut Vec<f32>) {
        out.clear();
        let ring = &self.ring;
        let len = ring.samples.len();
        let cleared = ring.cleared.load(Ordering::Acquire);
        let end = ring.written.load(Ordering::Acquire);
        let filled = end.wrapping_sub(cleared).min(len);
        let start = end.wrapping_sub(filled);
        out.extend((0..filled).map(|i| {
            f32::from_bits(ring.samples[start.wrapping_add(i) % len].load(Ordering::Relaxed))
        }));
    }

    /// Forgets all buffered samples.
    pub fn clear(&self) {
        let written = self.ring.written.load(Ordering::Acquire);
        self.ring.cleared.store(written, Ordering::Release);
    }
}

impl Default for AnalysisTap {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}
