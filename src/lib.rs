//! fourtrack - A four-track tape recorder engine.
//!
//! This library provides the recording engine: synchronized playback,
//! punch-in recording, cue scrubbing, metering and mixdown.

pub mod audio;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod tape;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use audio::{export_to_wav, AudioEngine, RodioBackend, TransportState};
pub use clock::{Clock, SystemClock};
pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use events::EngineEvent;
pub use tape::{AudioBuffer, DirectoryStore, ProjectData, ProjectStore, TrackDescriptor, TrackId};
