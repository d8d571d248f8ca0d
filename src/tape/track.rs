//! Tape track representation.
//!
//! A tape has exactly four fixed track slots. Each track optionally holds
//! decoded audio plus its mixing settings (volume, pan), its arm state and
//! whether playback applies the latency offset.

use super::buffer::{AudioBuffer, DEFAULT_SAMPLE_RATE};
use serde::{Deserialize, Serialize};

/// Number of tracks on the tape.
pub const TRACK_COUNT: usize = 4;

/// Identifier for one of the four track slots (1..=4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct TrackId(u8);

impl TrackId {
    /// All track ids in slot order.
    pub const ALL: [TrackId; TRACK_COUNT] = [TrackId(1), TrackId(2), TrackId(3), TrackId(4)];

    /// Returns the track id for a 1-based track number, or None if out of range.
    pub fn new(number: u8) -> Option<Self> {
        (1..=TRACK_COUNT as u8).contains(&number).then_some(Self(number))
    }

    /// Returns the track id for a 0-based slot index.
    pub fn from_index(index: usize) -> Option<Self> {
        u8::try_from(index + 1).ok().and_then(Self::new)
    }

    /// 1-based track number.
    pub fn number(self) -> u8 {
        self.0
    }

    /// 0-based slot index.
    pub fn index(self) -> usize {
        (self.0 - 1) as usize
    }
}

impl TryFrom<u8> for TrackId {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| format!("track id {} out of range 1..=4", value))
    }
}

impl From<TrackId> for u8 {
    fn from(id: TrackId) -> u8 {
        id.0
    }
}

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single track slot on the tape.
///
/// Duration and sample rate are derived from the stored buffer, so the
/// relation `duration == len / sample_rate` cannot drift.
#[derive(Debug, Clone)]
pub struct Track {
    /// Slot identifier (immutable).
    id: TrackId,

    /// Display name.
    pub name: String,

    /// Decoded audio, exclusively owned by the engine.
    audio: Option<AudioBuffer>,

    /// Linear volume 0..1.
    volume: f32,

    /// Pan position -1 (left) .. 1 (right).
    pan: f32,

    /// Whether the track is the destination of the next recording.
    pub armed: bool,

    /// Whether playback applies the global latency offset to this track.
    pub latency_fix: bool,
}

impl Track {
    /// Creates an empty track at full volume, centre pan.
    pub fn new(id: TrackId) -> Self {
        Self {
            id,
            name: String::new(),
            audio: None,
            volume: 1.0,
            pan: 0.0,
            armed: false,
            latency_fix: false,
        }
    }

    pub fn id(&self) -> TrackId {
        self.id
    }

    pub fn audio(&self) -> Option<&AudioBuffer> {
        self.audio.as_ref()
    }

    /// Replaces the stored audio. Empty buffers are stored as "no audio".
    pub fn set_audio(&mut self, audio: Option<AudioBuffer>) {
        self.audio = audio.filter(|buffer| !buffer.is_empty());
    }

    /// Whether the track holds any samples.
    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }

    /// Duration in seconds (0 without audio).
    pub fn duration(&self) -> f64 {
        self.audio.as_ref().map_or(0.0, AudioBuffer::duration)
    }

    /// Sample rate of the stored audio, or the default rate without audio.
    pub fn sample_rate(&self) -> u32 {
        self.audio
            .as_ref()
            .map_or(DEFAULT_SAMPLE_RATE, AudioBuffer::sample_rate)
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    /// Sets the volume, clamped to 0..1.
    pub fn set_volume(&mut self, volume: f32) {
        self.volume = if volume.is_nan() { 0.0 } else { volume.clamp(0.0, 1.0) };
    }

    pub fn pan(&self) -> f32 {
        self.pan
    }

    /// Sets the pan, clamped to -1..1.
    pub fn set_pan(&mut self, pan: f32) {
        self.pan = if pan.is_nan() { 0.0 } else { pan.clamp(-1.0, 1.0) };
    }
}

/// The four track slots of a tape, indexed by [`TrackId`].
#[derive(Debug, Clone)]
pub struct TrackSlots {
    tracks: [Track; TRACK_COUNT],
}

impl TrackSlots {
    /// Four empty tracks.
    pub fn new() -> Self {
        Self {
            tracks: TrackId::ALL.map(Track::new),
        }
    }

    pub fn get(&self, id: TrackId) -> &Track {
        &self.tracks[id.index()]
    }

    pub fn get_mut(&mut self, id: TrackId) -> &mut Track {
        &mut self.tracks[id.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Track> {
        self.tracks.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Track> {
        self.tracks.iter_mut()
    }

    /// Ids of all armed tracks in slot order.
    pub fn armed(&self) -> Vec<TrackId> {
        self.tracks
            .iter()
            .filter(|t| t.armed)
            .map(Track::id)
            .collect()
    }

    /// Longest track duration in seconds (0 if the tape is blank).
    pub fn max_duration(&self) -> f64 {
        self.tracks
            .iter()
            .map(Track::duration)
            .fold(0.0, f64::max)
    }
}

impl Default for TrackSlots {
    fn default() -> Self {
        Self::new()
    }
}

/// Host-facing serialized copy of a track.
///
/// The audio travels as a canonical PCM container; the host never sees the
/// engine's decoded buffers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackDescriptor {
    pub id: TrackId,

    #[serde(default)]
    pub name: String,

    /// Duration in seconds as declared by the producer of this descriptor.
    #[serde(default)]
    pub duration: f64,

    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Canonical PCM container bytes, if the track has audio.
    #[serde(skip)]
    pub audio: Option<Vec<u8>>,
}

fn default_sample_rate() -> u32 {
    DEFAULT_SAMPLE_RATE
}

impl TrackDescriptor {
    /// An empty descriptor for a track slot.
    pub fn empty(id: TrackId) -> Self {
        Self {
            id,
            name: String::new(),
            duration: 0.0,
            sample_rate: DEFAULT_SAMPLE_RATE,
            audio: None,
        }
    }

    /// Four empty descriptors, one per slot.
    pub fn blank_tape() -> Vec<Self> {
        TrackId::ALL.into_iter().map(Self::empty).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_id_range() {
        assert!(TrackId::new(0).is_none());
        assert!(TrackId::new(5).is_none());
        let id = TrackId::new(3).unwrap();
        assert_eq!(id.index(), 2);
        assert_eq!(TrackId::from_index(2), Some(id));
        assert_eq!(TrackId::from_index(4), None);
    }

    #[test]
    fn test_track_creation() {
        let track = Track::new(TrackId::new(1).unwrap());
        assert_eq!(track.volume(), 1.0);
        assert_eq!(track.pan(), 0.0);
        assert!(!track.armed);
        assert!(!track.latency_fix);
        assert_eq!(track.duration(), 0.0);
    }

    #[test]
    fn test_duration_follows_buffer() {
        let mut track = Track::new(TrackId::new(2).unwrap());
        track.set_audio(Some(AudioBuffer::silence(48000, 48000)));
        assert!((track.duration() - 1.0).abs() < 1e-12);
        assert_eq!(track.sample_rate(), 48000);

        track.set_audio(Some(AudioBuffer::silence(0, 48000)));
        assert!(!track.has_audio());
        assert_eq!(track.duration(), 0.0);
    }

    #[test]
    fn test_volume_and_pan_clamped() {
        let mut track = Track::new(TrackId::new(1).unwrap());
        track.set_volume(1.7);
        assert_eq!(track.volume(), 1.0);
        track.set_volume(-0.2);
        assert_eq!(track.volume(), 0.0);
        track.set_pan(-3.0);
        assert_eq!(track.pan(), -1.0);
        track.set_pan(0.25);
        assert_eq!(track.pan(), 0.25);
    }

    #[test]
    fn test_slots_armed_and_max_duration() {
        let mut slots = TrackSlots::new();
        slots.get_mut(TrackId::new(3).unwrap()).armed = true;
        slots.get_mut(TrackId::new(1).unwrap()).armed = true;
        assert_eq!(
            slots.armed(),
            vec![TrackId::new(1).unwrap(), TrackId::new(3).unwrap()]
        );

        slots
            .get_mut(TrackId::new(4).unwrap())
            .set_audio(Some(AudioBuffer::silence(88200, 44100)));
        assert!((slots.max_duration() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_descriptor_metadata_serialization() {
        let mut descriptor = TrackDescriptor::empty(TrackId::new(2).unwrap());
        descriptor.name = "Bass".to_string();
        descriptor.audio = Some(vec![1, 2, 3]);

        let json = serde_json::to_string(&descriptor).unwrap();
        let loaded: TrackDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.id.number(), 2);
        assert_eq!(loaded.name, "Bass");
        // Audio travels separately from metadata.
        assert!(loaded.audio.is_none());
    }

    #[test]
    fn test_descriptor_rejects_bad_id() {
        let result: Result<TrackDescriptor, _> = serde_json::from_str(r#"{"id": 9}"#);
        assert!(result.is_err());
    }
}
