//! Decoded mono audio held in memory.
//!
//! All track audio lives in RAM as 32-bit float samples. Buffers are cheap to
//! clone: the sample data is shared behind an `Arc` and never mutated in
//! place, so a clone handed to the audio thread is an independent copy as far
//! as any observer can tell.

use std::sync::Arc;

/// Default sample rate for new material (44.1 kHz).
pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

/// An immutable block of mono samples at a fixed sample rate.
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    samples: Arc<[f32]>,
    sample_rate: u32,
}

impl AudioBuffer {
    /// Creates a buffer from raw samples.
    ///
    /// A zero sample rate is replaced by [`DEFAULT_SAMPLE_RATE`] so that
    /// `duration()` is always well defined.
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate: if sample_rate == 0 {
                DEFAULT_SAMPLE_RATE
            } else {
                sample_rate
            },
        }
    }

    /// Creates a buffer of `len` zero samples.
    pub fn silence(len: usize, sample_rate: u32) -> Self {
        Self::new(vec![0.0; len], sample_rate)
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Number of sample frames.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Duration in seconds: `len / sample_rate`.
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Converts a time in seconds into a frame index, rounding down.
    pub fn frames_for(&self, seconds: f64) -> usize {
        (seconds.max(0.0) * self.sample_rate as f64).floor() as usize
    }

    /// Returns a sample-reversed copy.
    pub fn reversed(&self) -> Self {
        let samples: Vec<f32> = self.samples.iter().rev().copied().collect();
        Self::new(samples, self.sample_rate)
    }

    /// Returns the frames from `start` onward (empty if past the end).
    pub fn skip_frames(&self, start: usize) -> Self {
        let start = start.min(self.samples.len());
        Self::new(self.samples[start..].to_vec(), self.sample_rate)
    }

    /// Returns the first `len` frames (the whole buffer if shorter).
    pub fn take_frames(&self, len: usize) -> Self {
        let len = len.min(self.samples.len());
        Self::new(self.samples[..len].to_vec(), self.sample_rate)
    }

    /// Resamples with nearest-neighbour index mapping.
    ///
    /// Output frame `i` takes source frame `floor(i * src_rate / dst_rate)`.
    /// Used when merging takes so that retained material is copied verbatim
    /// when the rates already match.
    pub fn resample_nearest(&self, target_rate: u32) -> Self {
        if target_rate == 0 || target_rate == self.sample_rate {
            return self.clone();
        }
        let ratio = self.sample_rate as f64 / target_rate as f64;
        let out_len = (self.samples.len() as f64 / ratio).floor() as usize;
        let samples = (0..out_len)
            .map(|i| {
                let src = (i as f64 * ratio).floor() as usize;
                self.samples.get(src).copied().unwrap_or(0.0)
            })
            .collect();
        Self::new(samples, target_rate)
    }

    /// Reads the buffer at a fractional frame position with linear
    /// interpolation. Positions outside the buffer read as silence.
    #[inline]
    pub fn sample_at(&self, position: f64) -> f32 {
        if position < 0.0 {
            return 0.0;
        }
        let index = position.floor() as usize;
        let Some(&a) = self.samples.get(index) else {
            return 0.0;
        };
        let b = self.samples.get(index + 1).copied().unwrap_or(a);
        let frac = (position - index as f64) as f32;
        a + (b - a) * frac
    }

    /// Resamples with linear interpolation to `target_rate`.
    pub fn resample_linear(&self, target_rate: u32) -> Self {
        if target_rate == 0 || target_rate == self.sample_rate {
            return self.clone();
        }
        let ratio = self.sample_rate as f64 / target_rate as f64;
        let out_len = (self.duration() * target_rate as f64).floor() as usize;
        let samples = (0..out_len)
            .map(|i| self.sample_at(i as f64 * ratio))
            .collect();
        Self::new(samples, target_rate)
    }

    /// Returns true if both buffers share the same sample storage.
    pub fn shares_storage(&self, other: &AudioBuffer) -> bool {
        Arc::ptr_eq(&self.samples, &other.samples)
    }
}

impl PartialEq for AudioBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.sample_rate == other.sample_rate && self.samples[..] == other.samples[..]
    }
}
