//! Cue/scrub playback.
//!
//! Cueing previews already-recorded audio at a fixed multiple of normal
//! speed, forward or backward, like holding FF/REW on a tape deck with the
//! heads engaged. It builds its own graph and never plays armed tracks.

use super::graph::{PlaybackGraph, TrackControl, Voice};
use crate::tape::{AudioBuffer, TrackId, TrackSlots, TRACK_COUNT};

/// Cue direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CueDirection {
    Forward,
    Reverse,
}

impl CueDirection {
    fn sign(self) -> f64 {
        match self {
            CueDirection::Forward => 1.0,
            CueDirection::Reverse => -1.0,
        }
    }
}

/// An active cue.
#[derive(Debug, Clone, PartialEq)]
pub struct CueSession {
    direction: CueDirection,
    rate: f64,
    start_position: f64,
    started_at: f64,
}

impl CueSession {
    /// # Arguments
    ///
    /// * `direction` - Forward or reverse
    /// * `rate` - Speed magnitude (sign is taken from `direction`)
    /// * `start_position` - Tape position when the cue began
    /// * `started_at` - Clock time when the cue began
    pub fn new(direction: CueDirection, rate: f64, start_position: f64, started_at: f64) -> Self {
        Self {
            direction,
            rate: rate.abs(),
            start_position: start_position.max(0.0),
            started_at,
        }
    }

    pub fn direction(&self) -> CueDirection {
        self.direction
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn start_position(&self) -> f64 {
        self.start_position
    }

    /// Tape position at clock time `now`; never below 0.
    pub fn position_at(&self, now: f64) -> f64 {
        let elapsed = (now - self.started_at).max(0.0);
        (self.start_position + self.direction.sign() * elapsed * self.rate).max(0.0)
    }

    /// Whether a reverse cue has run back to the start of the tape.
    pub fn reached_start(&self, now: f64) -> bool {
        self.direction == CueDirection::Reverse && self.position_at(now) <= 0.0
    }
}

/// Reversed copies of track buffers, kept until the source buffer changes.
#[derive(Debug, Default)]
pub struct ReverseCache {
    slots: [Option<(AudioBuffer, AudioBuffer)>; TRACK_COUNT],
}

impl ReverseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the reversed copy of `source`, computing it on a miss.
    pub fn get(&mut self, id: TrackId, source: &AudioBuffer) -> AudioBuffer {
        let slot = &mut self.slots[id.index()];
        if let Some((cached_source, reversed)) = slot {
            if cached_source.shares_storage(source) {
                return reversed.clone();
            }
        }
        tracing::debug!("Track {}: building reversed buffer ({} frames)", id, source.len());
        let reversed = source.reversed();
        *slot = Some((source.clone(), reversed.clone()));
        reversed
    }

    /// Whether a reversed copy of `source` is cached.
    pub fn contains(&self, id: TrackId, source: &AudioBuffer) -> bool {
        matches!(&self.slots[id.index()], Some((cached, _)) if cached.shares_storage(source))
    }

    pub fn invalidate(&mut self, id: TrackId) {
        self.slots[id.index()] = None;
    }

    pub fn clear(&mut self) {
        self.slots = Default::default();
    }
}

/// Read offset into the (possibly reversed) buffer for a cue starting at
/// `position` on a track of `duration` seconds.
///
/// In reverse the buffer is read back to front, so tape position `p` maps to
/// `duration - p`. Starting beyond the end gives a negative offset: the voice
/// stays silent until the playhead comes back over recorded audio.
pub fn cue_start_offset(direction: CueDirection, position: f64, duration: f64) -> f64 {
    match direction {
        CueDirection::Forward => position.max(0.0),
        CueDirection::Reverse => duration - position.max(0.0),
    }
}

/// Builds the cue graph for every non-armed track with audio.
///
/// # Arguments
///
/// * `tracks` - Track slots
/// * `controls` - Live per-track gain/pan/tap
/// * `cache` - Reversed-buffer cache (used in reverse only)
/// * `session` - The cue being started
/// * `gain_scale` - Attenuation applied on top of track volume
/// * `output_rate` - Device sample rate
pub fn build_cue_graph(
    tracks: &TrackSlots,
    controls: &[TrackControl; TRACK_COUNT],
    cache: &mut ReverseCache,
    session: &CueSession,
    gain_scale: f32,
    output_rate: u32,
) -> PlaybackGraph {
    let mut graph = PlaybackGraph::new(output_rate);
    let position = session.start_position();

    for track in tracks.iter() {
        let id = track.id();
        if track.armed {
            continue;
        }
        let Some(buffer) = track.audio() else {
            continue;
        };

        let offset = cue_start_offset(session.direction(), position, buffer.duration());
        if offset >= buffer.duration() {
            continue;
        }
        let source = match session.direction() {
            CueDirection::Forward => buffer.clone(),
            CueDirection::Reverse => cache.get(id, buffer),
        };

        graph.add_voice(
            Voice::new(id, source, offset, session.rate(), output_rate, controls[id.index()].clone())
                .with_gain_scale(gain_scale),
        );
    }

    tracing::debug!(
        "Cue graph {:?} x{} from {:.3}s: tracks {:?}",
        session.direction(),
        session.rate(),
        position,
        graph.track_ids().iter().map(|t| t.number()).collect::<Vec<_>>()
    );

    graph
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controls() -> [TrackControl; TRACK_COUNT] {
        std::array::from_fn(|_| TrackControl::new(32))
    }

    #[test]
    fn test_reverse_position_clamps_at_zero() {
        let session = CueSession::new(CueDirection::Reverse, 4.0, 10.0, 100.0);
        assert!((session.position_at(101.0) - 6.0).abs() < 1e-12);
        assert_eq!(session.position_at(102.5), 0.0);
        assert_eq!(session.position_at(500.0), 0.0);
        assert!(session.reached_start(102.5));
        assert!(!session.reached_start(101.0));
    }

    #[test]
    fn test_forward_position_advances() {
        let session = CueSession::new(CueDirection::Forward, 4.0, 1.0, 0.0);
        assert!((session.position_at(0.5) - 3.0).abs() < 1e-12);
        assert!(!session.reached_start(10.0));
    }

    #[test]
    fn test_reverse_offset_past_end_is_lead_in() {
        assert_eq!(cue_start_offset(CueDirection::Reverse, 10.0, 5.0), -5.0);
        assert_eq!(cue_start_offset(CueDirection::Reverse, 2.0, 5.0), 3.0);
        assert_eq!(cue_start_offset(CueDirection::Forward, 2.0, 5.0), 2.0);
    }

    #[test]
    fn test_cache_reuses_until_source_changes() {
        let mut cache = ReverseCache::new();
        let id = TrackId::new(2).unwrap();
        let source = AudioBuffer::new(vec![1.0, 2.0, 3.0], 8000);

        let first = cache.get(id, &source);
        assert_eq!(first.samples(), &[3.0, 2.0, 1.0]);
        assert!(cache.contains(id, &source));
        assert!(cache.get(id, &source).shares_storage(&first));

        let replaced = AudioBuffer::new(vec![1.0, 2.0, 3.0], 8000);
        assert!(!cache.contains(id, &replaced));

        cache.invalidate(id);
        assert!(!cache.contains(id, &source));
    }

    #[test]
    fn test_cue_graph_excludes_armed_and_attenuates() {
        let mut tracks = TrackSlots::new();
        for track in tracks.iter_mut() {
            track.set_audio(Some(AudioBuffer::new(vec![1.0; 8000], 8000)));
        }
        tracks.get_mut(TrackId::new(4).unwrap()).armed = true;

        let controls = controls();
        let session = CueSession::new(CueDirection::Forward, 4.0, 0.0, 0.0);
        let mut graph =
            build_cue_graph(&tracks, &controls, &mut ReverseCache::new(), &session, 0.5, 8000);
        assert_eq!(graph.voices().len(), 3);
        assert!(graph.track_ids().iter().all(|id| id.number() != 4));

        controls[0].pan.set(-1.0);
        let mut out = vec![0.0; 2];
        graph.render(&mut out);
        // Track 1 hard left at half gain; tracks 2 and 3 centred at half gain.
        let centre = 0.5 * std::f32::consts::FRAC_1_SQRT_2;
        assert!((out[0] - (0.5 + 2.0 * centre)).abs() < 1e-5);
    }

    #[test]
    fn test_reverse_graph_starts_silent_past_end() {
        let mut tracks = TrackSlots::new();
        tracks
            .get_mut(TrackId::new(1).unwrap())
            .set_audio(Some(AudioBuffer::new(vec![0.5; 5 * 100], 100)));
        let session = CueSession::new(CueDirection::Reverse, 4.0, 10.0, 0.0);
        let mut cache = ReverseCache::new();
        let mut graph = build_cue_graph(&tracks, &controls(), &mut cache, &session, 0.5, 100);

        assert_eq!(graph.voices().len(), 1);
        assert!(graph.voices()[0].position() < 0.0);
        let mut out = vec![0.0; 20];
        graph.render(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));
    }
}
