//! Playback signal graph.
//!
//! One [`Voice`] per sounding track: source → gain → pan → analysis tap → mix.
//! The graph is built on the control thread and then moved to the audio
//! thread, which calls [`PlaybackGraph::render`]. Volume and pan are read
//! from lock-free [`TrackControl`] atomics on every block, so mixer changes
//! apply to a running graph without a rebuild.

use super::meter::AnalysisTap;
use crate::tape::{AudioBuffer, TrackId, TrackSlots, TRACK_COUNT};
use std::f32::consts::FRAC_PI_4;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Frames rendered per block.
pub const BLOCK_FRAMES: usize = 256;

/// An `f32` stored in an atomic, shared between threads.
#[derive(Debug, Clone)]
pub struct SharedParam(Arc<AtomicU32>);

impl SharedParam {
    pub fn new(value: f32) -> Self {
        Self(Arc::new(AtomicU32::new(value.to_bits())))
    }

    #[inline]
    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

/// Live mixer controls and meter tap for one track slot.
#[derive(Debug, Clone)]
pub struct TrackControl {
    pub gain: SharedParam,
    pub pan: SharedParam,
    pub tap: AnalysisTap,
}

impl TrackControl {
    pub fn new(window: usize) -> Self {
        Self {
            gain: SharedParam::new(1.0),
            pan: SharedParam::new(0.0),
            tap: AnalysisTap::new(window),
        }
    }
}

/// Equal-power pan law: returns (left, right) gains for pan in -1..1.
#[inline]
pub fn pan_gains(pan: f32) -> (f32, f32) {
    let angle = (pan.clamp(-1.0, 1.0) + 1.0) * FRAC_PI_4;
    (angle.cos(), angle.sin())
}

/// Offset in seconds at which a track starts reading its buffer.
///
/// With the latency fix enabled the track is shifted by the configured
/// latency: `max(0, position - latency_ms / 1000)`. A negative latency value
/// therefore advances the track.
pub fn effective_start_offset(position: f64, latency_ms: f64, latency_fix: bool) -> f64 {
    if latency_fix {
        (position - latency_ms / 1000.0).max(0.0)
    } else {
        position.max(0.0)
    }
}

/// A single track's signal path.
pub struct Voice {
    track: TrackId,
    buffer: AudioBuffer,
    /// Read position in source frames (fractional).
    cursor: f64,
    /// Source frames advanced per output frame.
    step: f64,
    /// Fixed factor on top of the live gain (cue attenuation).
    gain_scale: f32,
    control: TrackControl,
}

impl Voice {
    /// # Arguments
    ///
    /// * `track` - Track slot the voice belongs to
    /// * `buffer` - Audio to play
    /// * `start_offset` - Start position in seconds into `buffer`; a negative
    ///   offset plays that much silence before the buffer starts
    /// * `rate` - Playback speed multiplier (1.0 = normal)
    /// * `output_rate` - Device sample rate
    pub fn new(
        track: TrackId,
        buffer: AudioBuffer,
        start_offset: f64,
        rate: f64,
        output_rate: u32,
        control: TrackControl,
    ) -> Self {
        let cursor = start_offset * buffer.sample_rate() as f64;
        let step = rate.abs() * buffer.sample_rate() as f64 / output_rate.max(1) as f64;
        Self {
            track,
            buffer,
            cursor,
            step,
            gain_scale: 1.0,
            control,
        }
    }

    /// Applies a fixed attenuation on top of the track volume.
    pub fn with_gain_scale(mut self, scale: f32) -> Self {
        self.gain_scale = scale;
        self
    }

    pub fn track(&self) -> TrackId {
        self.track
    }

    /// Current read position in seconds.
    pub fn position(&self) -> f64 {
        self.cursor / self.buffer.sample_rate() as f64
    }

    pub fn is_finished(&self) -> bool {
        self.cursor >= self.buffer.len() as f64
    }

    /// Adds this voice into an interleaved stereo block.
    fn render_into(&mut self, out: &mut [f32], tap_scratch: &mut Vec<f32>) {
        let gain = self.control.gain.get() * self.gain_scale;
        let (left, right) = pan_gains(self.control.pan.get());
        tap_scratch.clear();

        for frame in out.chunks_exact_mut(2) {
            if self.is_finished() {
                break;
            }
            let sample = self.buffer.sample_at(self.cursor) * gain;
            let l = sample * left;
            let r = sample * right;
            frame[0] += l;
            frame[1] += r;
            tap_scratch.push((l * l + r * r).sqrt());
            self.cursor += self.step;
        }

        self.control.tap.write(tap_scratch);
    }
}

/// A set of voices summed into a stereo output.
pub struct PlaybackGraph {
    voices: Vec<Voice>,
    output_rate: u32,
    tap_scratch: Vec<f32>,
}

impl PlaybackGraph {
    pub fn new(output_rate: u32) -> Self {
        Self {
            voices: Vec::new(),
            output_rate,
            tap_scratch: Vec::with_capacity(BLOCK_FRAMES),
        }
    }

    pub fn add_voice(&mut self, voice: Voice) {
        self.voices.push(voice);
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    pub fn voices(&self) -> &[Voice] {
        &self.voices
    }

    /// Tracks that contribute to this graph, in slot order.
    pub fn track_ids(&self) -> Vec<TrackId> {
        self.voices.iter().map(Voice::track).collect()
    }

    pub fn is_silent(&self) -> bool {
        self.voices.is_empty()
    }

    /// True once every voice has run past the end of its buffer.
    pub fn is_finished(&self) -> bool {
        self.voices.iter().all(Voice::is_finished)
    }

    /// Renders interleaved stereo frames into `out`, overwriting it.
    pub fn render(&mut self, out: &mut [f32]) {
        out.fill(0.0);
        for block in out.chunks_mut(BLOCK_FRAMES * 2) {
            for voice in &mut self.voices {
                voice.render_into(block, &mut self.tap_scratch);
            }
        }
    }
}

/// Builds the normal-speed playback graph at `position`.
///
/// Armed tracks and tracks without audio are excluded. Tracks with the
/// latency fix enabled start at [`effective_start_offset`]; tracks whose
/// start offset is already past their end get no voice.
pub fn build_playback_graph(
    tracks: &TrackSlots,
    controls: &[TrackControl; TRACK_COUNT],
    position: f64,
    latency_ms: f64,
    output_rate: u32,
) -> PlaybackGraph {
    let mut graph = PlaybackGraph::new(output_rate);

    for track in tracks.iter() {
        let id = track.id();
        if track.armed {
            tracing::debug!("Track {}: skipping playback (armed for recording)", id);
            continue;
        }
        let Some(buffer) = track.audio() else {
            continue;
        };

        let offset = effective_start_offset(position, latency_ms, track.latency_fix);
        if offset >= buffer.duration() {
            tracing::debug!("Track {}: start offset {:.3}s past end", id, offset);
            continue;
        }

        tracing::debug!(
            "Track {}: starting at offset {:.3}s{}",
            id,
            offset,
            if track.latency_fix {
                format!(" (latency fix: {}ms)", latency_ms)
            } else {
                String::new()
            }
        );

        graph.add_voice(Voice::new(
            id,
            buffer.clone(),
            offset,
            1.0,
            output_rate,
            controls[id.index()].clone(),
        ));
    }

    graph
}
