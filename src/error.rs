//! Error types for the tape engine.

use crate::tape::TrackId;
use thiserror::Error;

/// Errors produced by the PCM codec.
#[derive(Error, Debug)]
pub enum CodecError {
    /// The container was empty.
    #[error("empty audio container")]
    Empty,

    /// The container could not be parsed or written.
    #[error("malformed audio container: {0}")]
    Malformed(#[from] hound::Error),

    /// The container parsed but uses a layout the engine does not read.
    #[error("unsupported audio layout: {0}")]
    Unsupported(String),
}

/// Errors surfaced by engine operations.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Microphone or output device unavailable or denied.
    #[error("audio device unavailable: {0}")]
    DeviceAccess(String),

    /// Recording was requested with no track armed.
    #[error("no armed tracks: arm a track before recording")]
    NoArmedTracks,

    /// Export was requested but every track is empty.
    #[error("no audio to export")]
    NoAudioToExport,

    /// A stored track buffer could not be decoded.
    #[error("track {track} could not be decoded: {source}")]
    Decode {
        track: TrackId,
        #[source]
        source: CodecError,
    },

    /// Encoding audio into a container failed.
    #[error("audio encoding failed: {0}")]
    Encode(#[from] CodecError),

    /// Merging a finished take into the tracks failed.
    #[error("recording could not be finalized: {0}")]
    RecordingFinalize(String),

    /// A track number outside 1..=4.
    #[error("invalid track number {0}")]
    InvalidTrack(u8),

    /// The operation is not legal in the current transport mode.
    #[error("engine busy: {0}")]
    Busy(&'static str),

    /// Latency calibration did not detect the probe tone.
    #[error("latency calibration failed: {0}")]
    Calibration(String),
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
