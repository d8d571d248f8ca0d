//! Tape model: decoded audio buffers, the four track slots and stored
//! projects.

mod buffer;
mod project;
mod track;

pub use buffer::{AudioBuffer, DEFAULT_SAMPLE_RATE};
pub use project::{now_millis, DirectoryStore, ProjectData, ProjectStore, CASSETTE_COLORS};
pub use track::{Track, TrackDescriptor, TrackId, TrackSlots, TRACK_COUNT};
