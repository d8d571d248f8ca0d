//! Round-trip latency calibration.
//!
//! Plays a short windowed sine burst through the output, captures the input
//! for a fixed listening period, and locates the burst in the capture by
//! normalized cross-correlation. The delay between emitting and hearing the
//! burst is the round-trip latency.

use super::backend::{input_channel, AudioBackend, CaptureBuffer, INPUT_RING_FRAMES};
use super::graph::{PlaybackGraph, TrackControl, Voice};
use crate::clock::Clock;
use crate::config::CalibrationConfig;
use crate::error::{EngineError, EngineResult};
use crate::tape::{AudioBuffer, TrackId};
use rayon::prelude::*;
use std::f32::consts::PI;
use std::time::Duration;

/// Silence played before the burst so the input stream is settled.
pub const LEAD_IN_MS: u32 = 100;

/// Peak amplitude of the probe burst.
const PROBE_AMPLITUDE: f32 = 0.8;

/// A Hann-windowed sine burst.
///
/// # Arguments
///
/// * `frequency` - Tone frequency in Hz
/// * `duration_ms` - Burst length
/// * `sample_rate` - Rate to generate at
pub fn probe_tone(frequency: f32, duration_ms: u32, sample_rate: u32) -> Vec<f32> {
    let len = (duration_ms as u64 * sample_rate as u64 / 1000).max(2) as usize;
    (0..len)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            let window = 0.5 - 0.5 * (2.0 * PI * i as f32 / (len - 1) as f32).cos();
            PROBE_AMPLITUDE * window * (2.0 * PI * frequency * t).sin()
        })
        .collect()
}

/// The full probe signal: lead-in silence followed by the burst.
pub fn probe_signal(config: &CalibrationConfig, sample_rate: u32) -> AudioBuffer {
    let lead_in = (LEAD_IN_MS as u64 * sample_rate as u64 / 1000) as usize;
    let mut samples = vec![0.0; lead_in];
    samples.extend(probe_tone(
        config.probe_frequency_hz,
        config.probe_ms,
        sample_rate,
    ));
    AudioBuffer::new(samples, sample_rate)
}

/// Normalized correlation of `template` against `signal` at `lag`.
fn correlation_at(signal: &[f32], template: &[f32], template_energy: f64, lag: usize) -> f64 {
    let window = &signal[lag..lag + template.len()];
    let mut dot = 0.0f64;
    let mut energy = 0.0f64;
    for (&s, &t) in window.iter().zip(template) {
        dot += s as f64 * t as f64;
        energy += s as f64 * s as f64;
    }
    if energy <= f64::EPSILON {
        return 0.0;
    }
    dot / (energy * template_energy).sqrt()
}

/// Finds the frame where `template` best matches `signal`.
///
/// Returns `None` when the best normalized correlation stays below
/// `threshold` (nothing resembling the probe was captured).
pub fn detect_onset(signal: &[f32], template: &[f32], threshold: f32) -> Option<usize> {
    if template.is_empty() || signal.len() < template.len() {
        return None;
    }
    let template_energy: f64 = template.iter().map(|&t| t as f64 * t as f64).sum();
    if template_energy <= f64::EPSILON {
        return None;
    }

    let (lag, score) = (0..=signal.len() - template.len())
        .into_par_iter()
        .map(|lag| (lag, correlation_at(signal, template, template_energy, lag)))
        .reduce(
            || (0, f64::MIN),
            |a, b| if b.1 > a.1 || (b.1 == a.1 && b.0 < a.0) { b } else { a },
        );

    tracing::debug!("Probe correlation peak {:.3} at frame {}", score, lag);
    (score >= threshold as f64).then_some(lag)
}

/// Measures round-trip latency in milliseconds.
///
/// Opens its own input stream, so the caller must not be capturing.
///
/// # Errors
///
/// Returns `EngineError::DeviceAccess` if a device cannot be opened and
/// `EngineError::Calibration` if the probe is not heard.
pub fn measure_round_trip(
    backend: &mut dyn AudioBackend,
    clock: &dyn Clock,
    config: &CalibrationConfig,
) -> EngineResult<f64> {
    let output_rate = backend.output_sample_rate();
    let probe = probe_signal(config, output_rate);
    let mut graph = PlaybackGraph::new(output_rate);
    graph.add_voice(Voice::new(
        TrackId::ALL[0],
        probe,
        0.0,
        1.0,
        output_rate,
        TrackControl::new(1),
    ));

    let (sink, receiver) = input_channel(INPUT_RING_FRAMES);
    let input = backend.open_input(sink)?;
    let input_rate = input.sample_rate();
    let mut capture = CaptureBuffer::new(1);
    capture.attach(receiver);

    capture.start();
    if let Err(e) = backend.start_output(graph) {
        capture.stop();
        return Err(e);
    }
    clock.wait(Duration::from_millis(config.listen_ms as u64));
    backend.stop_output();
    let take = capture.stop();
    drop(input);

    tracing::info!(
        "Calibration captured {} frames at {} Hz",
        take.samples.len(),
        input_rate
    );

    let template = probe_tone(config.probe_frequency_hz, config.probe_ms, input_rate);
    let onset = detect_onset(&take.samples, &template, config.detection_threshold)
        .ok_or_else(|| EngineError::Calibration("probe tone not detected in input".into()))?;

    let delay_ms = (onset as f64 / input_rate as f64) * 1000.0 - LEAD_IN_MS as f64;
    if delay_ms < 0.0 {
        return Err(EngineError::Calibration(format!(
            "probe detected {:.1}ms before it was played",
            -delay_ms
        )));
    }

    tracing::info!("Measured round-trip latency: {:.1}ms", delay_ms);
    Ok(delay_ms)
}
