//! PCM container codec.
//!
//! Track audio is persisted and exchanged as a canonical RIFF/WAVE container:
//! a 44-byte header followed by 16-bit little-endian PCM. Decoding accepts any
//! integer or float WAV that hound can parse and keeps channel 0.
//!
//! Quantization uses a symmetric 1/32768 scale, so decoding a container and
//! encoding the result again reproduces the original bytes exactly.

use crate::error::CodecError;
use crate::tape::AudioBuffer;
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::io::Cursor;

/// Size of the canonical header in bytes.
pub const HEADER_LEN: usize = 44;

/// Bits per sample of the canonical container.
pub const BITS_PER_SAMPLE: u16 = 16;

/// Converts a float sample to 16-bit PCM, clamping to full scale.
#[inline]
pub fn sample_to_i16(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    (sample * 32768.0).round().clamp(-32768.0, 32767.0) as i16
}

/// Converts a 16-bit PCM sample to float in [-1, 1).
#[inline]
pub fn i16_to_sample(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

/// Encodes a mono buffer as a canonical 16-bit PCM container.
pub fn encode_wav(buffer: &AudioBuffer) -> Result<Vec<u8>, CodecError> {
    encode_interleaved(buffer.samples(), 1, buffer.sample_rate())
}

/// Encodes interleaved float samples as a 16-bit PCM container.
///
/// # Arguments
///
/// * `samples` - Interleaved samples (`channels` values per frame)
/// * `channels` - Channel count (1 or 2 keep the 44-byte header)
/// * `sample_rate` - Declared sample rate
pub fn encode_interleaved(
    samples: &[f32],
    channels: u16,
    sample_rate: u32,
) -> Result<Vec<u8>, CodecError> {
    if channels == 0 || channels > 2 {
        return Err(CodecError::Unsupported(format!("{} channels", channels)));
    }

    let spec = WavSpec {
        channels,
        sample_rate,
        bits_per_sample: BITS_PER_SAMPLE,
        sample_format: SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::with_capacity(HEADER_LEN + samples.len() * 2));
    {
        let mut writer = WavWriter::new(&mut cursor, spec)?;
        for &sample in samples {
            writer.write_sample(sample_to_i16(sample))?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

/// Decodes a container into a mono buffer (channel 0).
pub fn decode_wav(bytes: &[u8]) -> Result<AudioBuffer, CodecError> {
    if bytes.is_empty() {
        return Err(CodecError::Empty);
    }

    let mut reader = WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Int => {
            if spec.bits_per_sample == 0 || spec.bits_per_sample > 32 {
                return Err(CodecError::Unsupported(format!(
                    "{}-bit integer samples",
                    spec.bits_per_sample
                )));
            }
            let scale = 1.0 / (1u64 << (spec.bits_per_sample - 1)) as f64;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| (v as f64 * scale) as f32))
                .collect::<Result<_, _>>()?
        }
        SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
    };

    let mono = if channels == 1 {
        interleaved
    } else {
        interleaved.iter().step_by(channels).copied().collect()
    };

    Ok(AudioBuffer::new(mono, spec.sample_rate))
}
