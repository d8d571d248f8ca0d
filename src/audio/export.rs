//! Mixdown export.
//!
//! Sums every track into one interleaved stereo buffer, normalizes the peak
//! and encodes the result as a 16-bit PCM container.

use super::codec::encode_interleaved;
use crate::error::{EngineError, EngineResult};
use crate::tape::{AudioBuffer, TrackSlots, DEFAULT_SAMPLE_RATE};
use anyhow::{Context, Result};
use rayon::prelude::*;
use std::fs;
use std::path::Path;

/// A rendered stereo mix.
#[derive(Debug, Clone, PartialEq)]
pub struct StereoMix {
    /// Interleaved left/right samples.
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl StereoMix {
    pub fn frames(&self) -> usize {
        self.samples.len() / 2
    }

    /// Largest absolute sample value.
    pub fn peak(&self) -> f32 {
        self.samples.iter().fold(0.0f32, |peak, s| peak.max(s.abs()))
    }
}

/// Sums `(buffer, volume)` sources into a stereo mix.
///
/// The mix runs at the highest source rate (at least 44.1 kHz) for the
/// length of the longest source. Each mono source is resampled linearly and
/// added to both channels at its volume. If the summed peak exceeds 1.0 the
/// whole mix is scaled by `1 / peak`.
///
/// # Errors
///
/// Returns `EngineError::NoAudioToExport` if every source is empty.
pub fn render_mix(sources: &[(AudioBuffer, f32)]) -> EngineResult<StereoMix> {
    let sources: Vec<&(AudioBuffer, f32)> =
        sources.iter().filter(|(audio, _)| !audio.is_empty()).collect();
    if sources.is_empty() {
        return Err(EngineError::NoAudioToExport);
    }

    let sample_rate = sources
        .iter()
        .map(|(audio, _)| audio.sample_rate())
        .fold(DEFAULT_SAMPLE_RATE, u32::max);
    let max_duration = sources
        .iter()
        .map(|(audio, _)| audio.duration())
        .fold(0.0, f64::max);
    let frames = (max_duration * sample_rate as f64).floor() as usize;

    let resampled: Vec<(AudioBuffer, f32)> = sources
        .par_iter()
        .map(|(audio, volume)| (audio.resample_linear(sample_rate), *volume))
        .collect();

    let mut samples = vec![0.0f32; frames * 2];
    for (audio, volume) in &resampled {
        for (frame, &s) in samples.chunks_exact_mut(2).zip(audio.samples()) {
            let v = s * volume;
            frame[0] += v;
            frame[1] += v;
        }
    }

    let mut mix = StereoMix {
        samples,
        sample_rate,
    };
    let peak = mix.peak();
    if peak > 1.0 {
        let scale = 1.0 / peak;
        mix.samples.iter_mut().for_each(|s| *s *= scale);
        tracing::info!("Mix peak {:.3} normalized by {:.3}", peak, scale);
    }

    tracing::info!(
        "Rendered mix: {} tracks, {} frames at {} Hz",
        resampled.len(),
        mix.frames(),
        sample_rate
    );
    Ok(mix)
}

/// Mixes the tape's tracks and encodes the result.
///
/// # Errors
///
/// Returns `EngineError::NoAudioToExport` if every track is empty, or an
/// encoding error.
pub fn export_mix(tracks: &TrackSlots) -> EngineResult<Vec<u8>> {
    let sources: Vec<(AudioBuffer, f32)> = tracks
        .iter()
        .filter_map(|t| t.audio().map(|a| (a.clone(), t.volume())))
        .collect();
    let mix = render_mix(&sources)?;
    Ok(encode_interleaved(&mix.samples, 2, mix.sample_rate)?)
}

/// Mixes the tape's tracks into a WAV file.
///
/// # Arguments
///
/// * `tracks` - Tape to mix
/// * `output_path` - Path for the output WAV file
///
/// # Errors
///
/// Returns error if there is nothing to export or the file cannot be written
pub fn export_to_wav<P: AsRef<Path>>(tracks: &TrackSlots, output_path: P) -> Result<()> {
    let bytes = export_mix(tracks).context("Failed to render mixdown")?;
    fs::write(output_path.as_ref(), bytes).with_context(|| {
        format!(
            "Failed to write output WAV file: {}",
            output_path.as_ref().display()
        )
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::decode_wav;
    use crate::tape::TrackId;

    #[test]
    fn test_empty_tape_has_nothing_to_export() {
        assert!(matches!(
            export_mix(&TrackSlots::new()),
            Err(EngineError::NoAudioToExport)
        ));
        assert!(matches!(render_mix(&[]), Err(EngineError::NoAudioToExport)));
    }

    #[test]
    fn test_full_scale_track_stays_within_range() {
        let mut tracks = TrackSlots::new();
        tracks
            .get_mut(TrackId::new(1).unwrap())
            .set_audio(Some(AudioBuffer::new(vec![1.0; 44100], 44100)));
        let sources = vec![(tracks.get(TrackId::new(1).unwrap()).audio().unwrap().clone(), 1.0)];
        let mix = render_mix(&sources).unwrap();
        assert_eq!(mix.frames(), 44100);
        assert!(mix.peak() <= 1.0);

        let bytes = export_mix(&tracks).unwrap();
        let decoded = decode_wav(&bytes).unwrap();
        assert_eq!(decoded.len(), 44100);
        assert!(decoded.samples().iter().all(|s| s.abs() <= 1.0));
    }

    #[test]
    fn test_peak_normalization_scales_whole_mix() {
        let loud = AudioBuffer::new(vec![0.8; 100], 44100);
        let quiet = AudioBuffer::new(vec![0.4; 200], 44100);
        let mix = render_mix(&[(loud.clone(), 1.0), (loud, 1.0), (quiet, 1.0)]).unwrap();

        assert_eq!(mix.frames(), 200);
        assert!((mix.peak() - 1.0).abs() < 1e-6);
        // Ratio between summed regions is preserved.
        assert!((mix.samples[0] / mix.samples[300] - 5.0).abs() < 1e-4);
        assert_eq!(mix.samples[0], mix.samples[1]);
    }

    #[test]
    fn test_volume_and_rate() {
        let a = AudioBuffer::new(vec![0.5; 48000], 48000);
        let b = AudioBuffer::new(vec![0.5; 11025], 22050);
        let mix = render_mix(&[(a, 0.5), (b, 1.0)]).unwrap();
        assert_eq!(mix.sample_rate, 48000);
        assert_eq!(mix.frames(), 48000);
        assert!((mix.samples[0] - 0.75).abs() < 1e-6);
        assert!((mix.samples[2 * 30000] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_export_to_file() {
        let mut tracks = TrackSlots::new();
        tracks
            .get_mut(TrackId::new(2).unwrap())
            .set_audio(Some(AudioBuffer::new(vec![0.25; 4410], 44100)));
        let path = std::env::temp_dir().join(format!("fourtrack-mix-{}.wav", uuid::Uuid::new_v4()));
        export_to_wav(&tracks, &path).unwrap();
        let bytes = fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 44 + 4410 * 4);
        let _ = fs::remove_file(path);
    }
}
