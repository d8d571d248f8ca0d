//! Recording pipeline: capture sessions and the punch-in merge.
//!
//! A [`RecordingSession`] describes one capture pass over the armed
//! tracks; the frames themselves accumulate in the engine's
//! [`CaptureBuffer`]. When it finishes, the take is trimmed for latency (per track) and
//! merged into each target track with overwrite semantics: material before
//! the punch-in point is kept, everything after it is replaced by the take.

use super::backend::CaptureBuffer;
use crate::tape::{AudioBuffer, TrackId, TrackSlots};
use rayon::prelude::*;

/// An in-progress recording pass.
#[derive(Debug)]
pub struct RecordingSession {
    targets: Vec<TrackId>,
    punch_in: f64,
    input_rate: u32,
}

impl RecordingSession {
    /// Starts capturing into `capture` for the `targets` tracks.
    ///
    /// # Arguments
    ///
    /// * `targets` - Armed tracks receiving the take
    /// * `punch_in` - Tape position in seconds where the take starts
    /// * `capture` - Accumulator fed by the input device
    /// * `input_rate` - Input device sample rate
    pub fn begin(
        targets: Vec<TrackId>,
        punch_in: f64,
        capture: &mut CaptureBuffer,
        input_rate: u32,
    ) -> Self {
        capture.start();
        tracing::info!(
            "Recording started at {:.3}s on tracks {:?}",
            punch_in,
            targets.iter().map(|t| t.number()).collect::<Vec<_>>()
        );
        Self {
            targets,
            punch_in: punch_in.max(0.0),
            input_rate,
        }
    }

    pub fn targets(&self) -> &[TrackId] {
        &self.targets
    }

    pub fn punch_in(&self) -> f64 {
        self.punch_in
    }

    /// Drains the remaining input, stops capturing and returns the take.
    pub fn finish(self, capture: &mut CaptureBuffer) -> FinishedTake {
        let take = capture.stop();
        tracing::info!(
            "Recording stopped: {} frames (device frames {}..{})",
            take.samples.len(),
            take.start_frame,
            take.end_frame
        );
        FinishedTake {
            targets: self.targets,
            punch_in: self.punch_in,
            audio: AudioBuffer::new(take.samples, self.input_rate),
        }
    }
}

/// A stopped take waiting to be merged.
#[derive(Debug, Clone)]
pub struct FinishedTake {
    pub targets: Vec<TrackId>,
    pub punch_in: f64,
    pub audio: AudioBuffer,
}

/// Removes `|latency_ms|` milliseconds from the start of a take.
///
/// The captured signal runs ahead of the monitoring path by the measured
/// round-trip delay.
pub fn trim_latency(take: &AudioBuffer, latency_ms: f64) -> AudioBuffer {
    let frames = ((latency_ms.abs() / 1000.0) * take.sample_rate() as f64).round() as usize;
    take.skip_frames(frames)
}

/// Merges a take into existing track audio at `punch_in` seconds.
///
/// If the track has audio and the punch-in is after 0, the result is
/// `existing[0..punch_in) ++ take`; otherwise it is the take alone. Buffers
/// of differing rates are brought to the higher rate by nearest-neighbour
/// index mapping. A punch-in past the end of the existing audio pads the gap
/// with silence so the take lands at its tape position.
pub fn punch_in(existing: Option<&AudioBuffer>, take: &AudioBuffer, punch_in: f64) -> AudioBuffer {
    let existing = match existing {
        Some(existing) if punch_in > 0.0 && !existing.is_empty() => existing,
        _ => return take.clone(),
    };

    let rate = existing.sample_rate().max(take.sample_rate());
    let existing = existing.resample_nearest(rate);
    let take = take.resample_nearest(rate);

    let punch_frame = (punch_in * rate as f64).floor() as usize;
    let kept = punch_frame.min(existing.len());

    let mut merged = Vec::with_capacity(punch_frame + take.len());
    merged.extend_from_slice(&existing.samples()[..kept]);
    merged.resize(punch_frame, 0.0);
    merged.extend_from_slice(take.samples());

    tracing::debug!(
        "Punch-in merge: kept {} frames, padded {}, added {} at {} Hz",
        kept,
        punch_frame - kept,
        take.len(),
        rate
    );

    AudioBuffer::new(merged, rate)
}

/// Computes the new audio of every target track.
///
/// Each target gets its own copy of the single mono take, trimmed for
/// latency when that track has the latency fix enabled. Targets whose take
/// is empty after trimming are left out (their audio is unchanged).
pub fn merge_take(
    tracks: &TrackSlots,
    take: &FinishedTake,
    latency_ms: f64,
) -> Vec<(TrackId, AudioBuffer)> {
    if take.audio.is_empty() {
        tracing::warn!("No recorded frames to merge");
        return Vec::new();
    }

    take.targets
        .par_iter()
        .filter_map(|&id| {
            let track = tracks.get(id);
            let audio = if track.latency_fix {
                trim_latency(&take.audio, latency_ms)
            } else {
                take.audio.clone()
            };
            if audio.is_empty() {
                tracing::warn!("Track {}: take shorter than latency trim, unchanged", id);
                return None;
            }
            let merged = punch_in(track.audio(), &audio, take.punch_in);
            tracing::info!(
                "Track {}: {:.3}s after merge (punch-in at {:.3}s)",
                id,
                merged.duration(),
                take.punch_in
            );
            Some((id, merged))
        })
        .collect()
}
