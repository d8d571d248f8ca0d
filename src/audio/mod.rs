//! Audio engine for a four-track tape recorder.
//!
//! This module drives synchronized multitrack playback via rodio and
//! microphone capture via cpal. It supports:
//! - Play, pause, seek and a resettable tape counter
//! - Punch-in recording onto armed tracks with latency compensation
//! - Forward and reverse cue scrubbing
//! - Per-track level metering
//! - Round-trip latency calibration
//! - Stereo mixdown export

pub mod backend;
pub mod codec;
pub mod cue;
pub mod device;
pub mod engine;
pub mod export;
pub mod graph;
pub mod latency;
pub mod meter;
pub mod recorder;
pub mod transport;

pub use backend::{AudioBackend, InputStream};
pub use cue::CueDirection;
pub use device::RodioBackend;
pub use engine::{ActiveMode, AudioEngine};
pub use export::export_to_wav;
pub use transport::TransportState;
