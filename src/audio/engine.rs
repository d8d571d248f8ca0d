//! The tape engine.
//!
//! [`AudioEngine`] owns the four tracks, the transport and whichever mode is
//! active (playback, recording or cueing). Commands run on the control
//! thread; the audio thread only ever sees a finished [`PlaybackGraph`] and
//! the input sink. Position and meter readings are sampled in [`AudioEngine::tick`]
//! and published on the event bus.

use super::backend::{input_channel, AudioBackend, CaptureBuffer, InputStream, INPUT_RING_FRAMES};
use super::codec::{decode_wav, encode_wav};
use super::cue::{build_cue_graph, CueDirection, CueSession, ReverseCache};
use super::export;
use super::graph::{build_playback_graph, TrackControl};
use super::latency::measure_round_trip;
use super::meter::LevelMeter;
use super::recorder::{merge_take, RecordingSession};
use super::transport::{Counter, Transport, TransportState};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus};
use crate::tape::{Track, TrackDescriptor, TrackId, TrackSlots, TRACK_COUNT};
use crossbeam::channel::Receiver;
use std::path::Path;
use std::sync::Arc;

/// Seconds moved by a rewind/fast-forward nudge.
pub const WIND_STEP: f64 = 0.5;

/// Seconds moved by a fine step.
pub const FINE_STEP: f64 = 0.1;

/// What the engine is currently doing. Recording and cueing carry their
/// session, so at most one of each can exist.
#[derive(Debug)]
pub enum ActiveMode {
    /// Stopped or paused; nothing is connected to the output.
    Idle,
    Playing,
    Recording(RecordingSession),
    Cueing(CueSession),
}

impl ActiveMode {
    fn name(&self) -> &'static str {
        match self {
            ActiveMode::Idle => "idle",
            ActiveMode::Playing => "playing",
            ActiveMode::Recording(_) => "recording",
            ActiveMode::Cueing(_) => "cueing",
        }
    }
}

/// The 4-track tape engine.
pub struct AudioEngine {
    config: EngineConfig,
    tracks: TrackSlots,
    transport: Transport,
    counter: Counter,
    /// Global latency value in milliseconds.
    latency_ms: f64,
    mode: ActiveMode,
    /// Live gain/pan/tap per track, shared with running graphs.
    controls: [TrackControl; TRACK_COUNT],
    meters: [LevelMeter; TRACK_COUNT],
    input_meter: LevelMeter,
    levels: [f32; TRACK_COUNT],
    /// Whether the last published levels were live readings.
    levels_live: bool,
    /// Open input stream (recording or monitoring armed tracks).
    input: Option<Box<dyn InputStream>>,
    /// Drains the input ring; holds the take and the input meter window.
    capture: CaptureBuffer,
    reverse_cache: ReverseCache,
    backend: Box<dyn AudioBackend>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    scratch: Vec<f32>,
}

impl AudioEngine {
    /// Creates an engine with four empty tracks.
    ///
    /// Devices are not opened until a command needs them.
    ///
    /// # Arguments
    ///
    /// * `config` - Engine settings (validated here)
    /// * `backend` - Audio device access
    /// * `clock` - Time source for the transport and cue
    pub fn new(config: EngineConfig, mut backend: Box<dyn AudioBackend>, clock: Arc<dyn Clock>) -> Self {
        let config = config.validate();
        backend.select_input_device(config.input_device.clone());
        backend.select_output_device(config.output_device.clone());

        let window = config.meter_window;
        let meter = LevelMeter::new(config.meter_gain, config.meter_smoothing);

        tracing::info!(
            "Engine ready: output {} Hz, latency {}ms",
            backend.output_sample_rate(),
            config.latency_ms
        );

        Self {
            latency_ms: config.latency_ms,
            tracks: TrackSlots::new(),
            transport: Transport::new(),
            counter: Counter::default(),
            mode: ActiveMode::Idle,
            controls: std::array::from_fn(|_| TrackControl::new(window)),
            meters: std::array::from_fn(|_| meter.clone()),
            input_meter: meter,
            levels: [0.0; TRACK_COUNT],
            levels_live: false,
            input: None,
            capture: CaptureBuffer::new(window),
            reverse_cache: ReverseCache::new(),
            backend,
            clock,
            events: EventBus::default(),
            scratch: Vec::with_capacity(window),
            config,
        }
    }

    /// Receiver for engine events.
    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> TransportState {
        self.transport.state()
    }

    pub fn mode(&self) -> &ActiveMode {
        &self.mode
    }

    pub fn is_cueing(&self) -> bool {
        matches!(self.mode, ActiveMode::Cueing(_))
    }

    /// Current playhead position in seconds.
    pub fn position(&self) -> f64 {
        let now = self.clock.now();
        match &self.mode {
            ActiveMode::Cueing(session) => session.position_at(now),
            _ => self.transport.position_at(now),
        }
    }

    /// Last published meter levels.
    pub fn levels(&self) -> [f32; TRACK_COUNT] {
        self.levels
    }

    pub fn track(&self, id: TrackId) -> &Track {
        self.tracks.get(id)
    }

    pub fn armed_tracks(&self) -> Vec<TrackId> {
        self.tracks.armed()
    }

    pub fn latency_value(&self) -> f64 {
        self.latency_ms
    }

    // ------------------------------------------------------------------
    // Transport
    // ------------------------------------------------------------------

    /// Play/pause toggle.
    ///
    /// Stopped or Paused starts playback from the current position; Playing
    /// pauses. Ignored while recording; an active cue is stopped first.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::DeviceAccess` if the output cannot be opened;
    /// the transport state is left unchanged.
    pub fn play(&mut self) -> EngineResult<()> {
        match self.mode {
            ActiveMode::Recording(_) => {
                tracing::debug!("play ignored while recording");
                return Ok(());
            }
            ActiveMode::Playing => {
                let now = self.clock.now();
                self.disconnect_output();
                self.transport.pause(now);
                self.mode = ActiveMode::Idle;
                tracing::info!("Paused at {:.3}s", self.transport.position());
                self.publish_position();
                self.publish_state();
                return Ok(());
            }
            ActiveMode::Cueing(_) => self.stop_cue(),
            ActiveMode::Idle => {}
        }

        self.start_playback_graph()?;
        self.transport.run(TransportState::Playing, self.clock.now());
        self.mode = ActiveMode::Playing;
        tracing::info!("Playing from {:.3}s", self.transport.position());
        self.publish_state();
        Ok(())
    }

    /// Stops every mode and enters Stopped at the current position.
    ///
    /// While recording, the take is merged into the armed tracks before this
    /// returns.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::RecordingFinalize` if the take could not be
    /// stored. The transport is Stopped either way.
    pub fn stop(&mut self) -> EngineResult<()> {
        let now = self.clock.now();
        let result = match std::mem::replace(&mut self.mode, ActiveMode::Idle) {
            ActiveMode::Recording(session) => {
                self.disconnect_output();
                self.transport.stop(now);
                let result = self.finalize_recording(session, self.config.auto_disarm_after_recording);
                self.release_input_if_unused();
                result
            }
            ActiveMode::Cueing(session) => {
                self.disconnect_output();
                self.transport.set_position(session.position_at(now));
                self.transport.stop(now);
                Ok(())
            }
            ActiveMode::Playing | ActiveMode::Idle => {
                self.disconnect_output();
                self.transport.stop(now);
                Ok(())
            }
        };

        tracing::info!("Stopped at {:.3}s", self.transport.position());
        self.publish_position();
        self.publish_state();
        result
    }

    /// Record toggle.
    ///
    /// From Stopped, Paused or Playing, starts recording onto the armed
    /// tracks at the current position while the other tracks play back.
    /// While recording, finalizes the take and stops.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::NoArmedTracks` when nothing is armed and
    /// `EngineError::DeviceAccess` when a device cannot be opened. In both
    /// cases no state changes.
    pub fn record(&mut self) -> EngineResult<()> {
        if matches!(self.mode, ActiveMode::Recording(_)) {
            return self.stop();
        }

        let targets = self.tracks.armed();
        if targets.is_empty() {
            tracing::warn!("Record requested with no armed tracks");
            return Err(EngineError::NoArmedTracks);
        }

        let input_rate = self.acquire_input()?;

        if self.is_cueing() {
            self.stop_cue();
        }

        let now = self.clock.now();
        if matches!(self.mode, ActiveMode::Playing) {
            // The running graph already excludes armed tracks.
            self.transport.sync(now);
        } else if let Err(e) = self.start_playback_graph() {
            self.release_input_if_unused();
            return Err(e);
        }

        let session = RecordingSession::begin(
            targets,
            self.transport.position(),
            &mut self.capture,
            input_rate,
        );
        self.transport.run(TransportState::Recording, now);
        self.mode = ActiveMode::Recording(session);
        self.publish_state();
        Ok(())
    }

    /// Moves the playhead (clamped at 0).
    ///
    /// A running graph is rebuilt at the new position before this returns.
    /// While recording, the take so far is merged first and capture resumes
    /// at the new punch-in point.
    ///
    /// # Errors
    ///
    /// Returns a device error if the rebuilt graph cannot start (the
    /// transport then stops), or a finalize error from the merge.
    pub fn seek(&mut self, position: f64) -> EngineResult<()> {
        let now = self.clock.now();
        let result = match std::mem::replace(&mut self.mode, ActiveMode::Idle) {
            ActiveMode::Idle => {
                self.transport.seek(position, now);
                Ok(())
            }
            ActiveMode::Playing => {
                self.disconnect_output();
                self.transport.seek(position, now);
                self.resume_running(ActiveMode::Playing, now)
            }
            ActiveMode::Recording(session) => {
                self.disconnect_output();
                let merged = self.finalize_recording(session, false);
                let position = self.transport.seek(position, now);
                let input_rate = self.input.as_ref().map(|input| input.sample_rate());
                let restarted = match input_rate {
                    Some(rate) => {
                        let session = RecordingSession::begin(
                            self.tracks.armed(),
                            position,
                            &mut self.capture,
                            rate,
                        );
                        self.resume_running(ActiveMode::Recording(session), now)
                    }
                    None => Err(EngineError::DeviceAccess("input closed during recording".into())),
                };
                merged.and(restarted)
            }
            ActiveMode::Cueing(session) => {
                self.disconnect_output();
                let position = self.transport.seek(position, now);
                let session = CueSession::new(session.direction(), session.rate(), position, now);
                self.start_cue_graph(&session).map(|()| self.mode = ActiveMode::Cueing(session))
            }
        };

        if result.is_err() && matches!(self.mode, ActiveMode::Idle) && self.transport.state().is_running() {
            self.transport.stop(now);
            self.release_input_if_unused();
            self.publish_state();
        }
        tracing::debug!("Seek to {:.3}s ({})", self.transport.position(), self.mode.name());
        self.publish_position();
        result
    }

    /// Rebuilds the playback graph at the transport position and re-enters
    /// `mode`.
    fn resume_running(&mut self, mode: ActiveMode, now: f64) -> EngineResult<()> {
        self.start_playback_graph()?;
        let state = match mode {
            ActiveMode::Recording(_) => TransportState::Recording,
            _ => TransportState::Playing,
        };
        self.transport.run(state, now);
        self.mode = mode;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Counter and nudges
    // ------------------------------------------------------------------

    /// Makes the current position read as 0 on the counter.
    pub fn reset_counter(&mut self) {
        self.counter.reset(self.position());
        tracing::debug!("Counter reset at {:.3}s", self.counter.reference());
    }

    /// Counter reading (position relative to the counter reference).
    pub fn counter(&self) -> f64 {
        self.counter.reading(self.position())
    }

    /// Seeks to the counter's zero point.
    pub fn jump_to_counter(&mut self) -> EngineResult<()> {
        self.seek(self.counter.reference())
    }

    pub fn rewind_step(&mut self) -> EngineResult<()> {
        self.seek(self.position() - WIND_STEP)
    }

    pub fn fast_forward_step(&mut self) -> EngineResult<()> {
        self.seek(self.position() + WIND_STEP)
    }

    pub fn step_back(&mut self) -> EngineResult<()> {
        self.seek(self.position() - FINE_STEP)
    }

    pub fn step_forward(&mut self) -> EngineResult<()> {
        self.seek(self.position() + FINE_STEP)
    }

    // ------------------------------------------------------------------
    // Cue
    // ------------------------------------------------------------------

    /// Starts a forward cue from the current position.
    pub fn start_cue_forward(&mut self) -> EngineResult<()> {
        self.start_cue(CueDirection::Forward)
    }

    /// Starts a reverse cue from the current position.
    pub fn start_cue_reverse(&mut self) -> EngineResult<()> {
        self.start_cue(CueDirection::Reverse)
    }

    fn start_cue(&mut self, direction: CueDirection) -> EngineResult<()> {
        let now = self.clock.now();
        let finalized = match std::mem::replace(&mut self.mode, ActiveMode::Idle) {
            ActiveMode::Recording(session) => {
                self.disconnect_output();
                self.transport.stop(now);
                let result = self.finalize_recording(session, self.config.auto_disarm_after_recording);
                self.release_input_if_unused();
                result
            }
            ActiveMode::Cueing(previous) => {
                self.disconnect_output();
                self.transport.set_position(previous.position_at(now));
                Ok(())
            }
            ActiveMode::Playing | ActiveMode::Idle => {
                self.disconnect_output();
                Ok(())
            }
        };
        self.transport.stop(now);

        let session = CueSession::new(direction, self.config.cue_rate, self.transport.position(), now);
        let started = self.start_cue_graph(&session);
        if started.is_ok() {
            tracing::info!(
                "Cue {:?} x{} from {:.3}s",
                direction,
                session.rate(),
                session.start_position()
            );
            self.mode = ActiveMode::Cueing(session);
        }
        self.publish_state();
        finalized.and(started)
    }

    fn start_cue_graph(&mut self, session: &CueSession) -> EngineResult<()> {
        let graph = build_cue_graph(
            &self.tracks,
            &self.controls,
            &mut self.reverse_cache,
            session,
            self.config.cue_gain,
            self.backend.output_sample_rate(),
        );
        self.backend.start_output(graph)
    }

    /// Ends the cue. The transport is left Stopped at the position reached.
    pub fn stop_cue(&mut self) {
        if !self.is_cueing() {
            return;
        }
        let now = self.clock.now();
        if let ActiveMode::Cueing(session) = std::mem::replace(&mut self.mode, ActiveMode::Idle) {
            self.disconnect_output();
            self.transport.set_position(session.position_at(now));
            self.transport.stop(now);
            tracing::info!("Cue stopped at {:.3}s", self.transport.position());
        }
        self.publish_position();
        self.publish_state();
    }

    // ------------------------------------------------------------------
    // Tracks
    // ------------------------------------------------------------------

    /// Arms or disarms a track.
    ///
    /// Arming opens the input for metering; disarming the last track closes
    /// it. A running playback graph is rebuilt so the track's playback
    /// follows its arm state.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Busy` while recording.
    pub fn toggle_arm(&mut self, id: TrackId) -> EngineResult<()> {
        if matches!(self.mode, ActiveMode::Recording(_)) {
            return Err(EngineError::Busy("cannot change armed tracks while recording"));
        }

        let track = self.tracks.get_mut(id);
        track.armed = !track.armed;
        let armed = track.armed;
        tracing::info!("Track {} {}", id, if armed { "armed" } else { "disarmed" });

        if armed {
            if let Err(e) = self.acquire_input() {
                tracing::warn!("Input monitoring unavailable: {}", e);
                self.events.publish(EngineEvent::Error(e.to_string()));
            }
        } else {
            self.release_input_if_unused();
        }

        if let Err(e) = self.rebuild_active_graph() {
            tracing::error!("Failed to rebuild graph after arming: {}", e);
            self.events.publish(EngineEvent::Error(e.to_string()));
        }

        self.events.publish(EngineEvent::Armed(self.tracks.armed()));
        Ok(())
    }

    /// Sets a track's volume (clamped to 0..1); applies to running graphs.
    pub fn set_volume(&mut self, id: TrackId, volume: f32) {
        let track = self.tracks.get_mut(id);
        track.set_volume(volume);
        self.controls[id.index()].gain.set(track.volume());
    }

    /// Sets a track's pan (clamped to -1..1); applies to running graphs.
    pub fn set_pan(&mut self, id: TrackId, pan: f32) {
        let track = self.tracks.get_mut(id);
        track.set_pan(pan);
        self.controls[id.index()].pan.set(track.pan());
    }

    /// Enables the latency offset for a track. Takes effect at the next
    /// graph build.
    pub fn set_latency_fix(&mut self, id: TrackId, enabled: bool) {
        self.tracks.get_mut(id).latency_fix = enabled;
        tracing::info!(
            "Track {} latency fix: {} ({}ms)",
            id,
            if enabled { "on" } else { "off" },
            if enabled { self.latency_ms } else { 0.0 }
        );
    }

    /// Sets the global latency value in milliseconds.
    pub fn set_latency_value(&mut self, latency_ms: f64) {
        if !latency_ms.is_finite() {
            tracing::warn!("Ignoring non-finite latency value");
            return;
        }
        self.latency_ms = latency_ms;
        self.events.publish(EngineEvent::Latency(latency_ms));
    }

    pub fn set_track_name(&mut self, id: TrackId, name: impl Into<String>) {
        self.tracks.get_mut(id).name = name.into();
        self.publish_tracks();
    }

    /// Replaces the tape contents.
    ///
    /// Slots without a descriptor are emptied. A descriptor whose audio
    /// cannot be decoded leaves its track without audio; the others still
    /// load. Cached reversed buffers are dropped and an active graph is
    /// rebuilt so it plays the new material.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Busy` while recording.
    pub fn set_tracks(&mut self, descriptors: Vec<TrackDescriptor>) -> EngineResult<()> {
        if matches!(self.mode, ActiveMode::Recording(_)) {
            return Err(EngineError::Busy("cannot replace tracks while recording"));
        }

        for track in self.tracks.iter_mut() {
            track.set_audio(None);
            track.name.clear();
        }

        for descriptor in descriptors {
            let id = descriptor.id;
            let track = self.tracks.get_mut(id);
            track.name = descriptor.name;
            let Some(bytes) = descriptor.audio else {
                continue;
            };
            match decode_wav(&bytes) {
                Ok(audio) => {
                    tracing::debug!(
                        "Track {}: loaded {:.3}s at {} Hz",
                        id,
                        audio.duration(),
                        audio.sample_rate()
                    );
                    track.set_audio(Some(audio));
                }
                Err(source) => {
                    let err = EngineError::Decode { track: id, source };
                    tracing::warn!("{}; treating track as empty", err);
                    self.events.publish(EngineEvent::Error(err.to_string()));
                }
            }
        }
        self.reverse_cache.clear();

        if let Err(e) = self.rebuild_active_graph() {
            tracing::error!("Failed to rebuild graph after track change: {}", e);
            self.events.publish(EngineEvent::Error(e.to_string()));
        }

        self.publish_tracks();
        Ok(())
    }

    /// Rebuilds a running playback or cue graph from the current tracks at
    /// the position reached, so arm and content changes take effect
    /// immediately. On failure the transport is left Stopped.
    fn rebuild_active_graph(&mut self) -> EngineResult<()> {
        let now = self.clock.now();
        let rebuilt = match std::mem::replace(&mut self.mode, ActiveMode::Idle) {
            ActiveMode::Playing => {
                self.transport.sync(now);
                self.resume_running(ActiveMode::Playing, now)
            }
            ActiveMode::Cueing(session) => {
                let position = session.position_at(now);
                self.transport.set_position(position);
                let session = CueSession::new(session.direction(), session.rate(), position, now);
                self.start_cue_graph(&session).map(|()| self.mode = ActiveMode::Cueing(session))
            }
            other => {
                self.mode = other;
                return Ok(());
            }
        };
        if rebuilt.is_err() {
            self.disconnect_output();
            self.transport.stop(now);
            self.publish_state();
        }
        rebuilt
    }

    /// Serialized copies of all four tracks.
    ///
    /// # Errors
    ///
    /// Returns an encoding error if a buffer cannot be containerized.
    pub fn tracks(&self) -> EngineResult<Vec<TrackDescriptor>> {
        self.tracks
            .iter()
            .map(|track| -> EngineResult<TrackDescriptor> {
                Ok(TrackDescriptor {
                    id: track.id(),
                    name: track.name.clone(),
                    duration: track.duration(),
                    sample_rate: track.sample_rate(),
                    audio: track.audio().map(encode_wav).transpose()?,
                })
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Export and calibration
    // ------------------------------------------------------------------

    /// Mixes all tracks into a stereo PCM container.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::NoAudioToExport` if the tape is blank.
    pub fn export_mix(&self) -> EngineResult<Vec<u8>> {
        export::export_mix(&self.tracks)
    }

    /// Writes the mixdown to a WAV file.
    pub fn export_to_wav<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        export::export_to_wav(&self.tracks, path)
    }

    /// Measures round-trip latency and stores the compensation value
    /// (the negated measurement).
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Busy` unless Stopped, otherwise any device or
    /// detection failure. The stored value is unchanged on error.
    pub fn calibrate_latency(&mut self) -> EngineResult<f64> {
        if !matches!(self.mode, ActiveMode::Idle) || self.transport.state() != TransportState::Stopped {
            return Err(EngineError::Busy("latency calibration requires the transport to be stopped"));
        }

        // The calibrator opens its own input.
        self.input = None;
        self.capture.detach();
        let result = measure_round_trip(
            self.backend.as_mut(),
            self.clock.as_ref(),
            &self.config.calibration,
        );
        self.clear_taps();

        if !self.tracks.armed().is_empty() {
            if let Err(e) = self.acquire_input() {
                tracing::warn!("Input monitoring unavailable after calibration: {}", e);
            }
        }

        let measured = result?;
        self.set_latency_value(-measured);
        Ok(self.latency_ms)
    }

    // ------------------------------------------------------------------
    // Devices
    // ------------------------------------------------------------------

    pub fn input_devices(&self) -> Vec<String> {
        self.backend.input_devices()
    }

    pub fn output_devices(&self) -> Vec<String> {
        self.backend.output_devices()
    }

    /// Selects the input device for the next stream opened.
    pub fn select_input_device(&mut self, name: Option<String>) {
        tracing::info!("Input device: {}", name.as_deref().unwrap_or("default"));
        self.backend.select_input_device(name.clone());
        self.config.input_device = name;
    }

    /// Selects the output device for the next graph started.
    pub fn select_output_device(&mut self, name: Option<String>) {
        tracing::info!("Output device: {}", name.as_deref().unwrap_or("default"));
        self.backend.select_output_device(name.clone());
        self.config.output_device = name;
    }

    // ------------------------------------------------------------------
    // Scheduler tick
    // ------------------------------------------------------------------

    /// Advances the engine by one scheduler tick.
    ///
    /// Updates the playhead from the clock, auto-stops playback at the end
    /// of the longest track, ends a reverse cue at 0, samples the meters and
    /// publishes Position/Levels events.
    pub fn tick(&mut self) {
        let now = self.clock.now();
        self.capture.pump();

        match &self.mode {
            ActiveMode::Playing | ActiveMode::Recording(_) => {
                let position = self.transport.sync(now);
                let end = self.tracks.max_duration();
                if matches!(self.mode, ActiveMode::Playing) && end > 0.0 && position >= end {
                    tracing::info!("Reached end of tape at {:.3}s", position);
                    self.disconnect_output();
                    self.transport.stop(now);
                    self.mode = ActiveMode::Idle;
                    self.publish_state();
                }
                self.publish_position();
            }
            ActiveMode::Cueing(session) => {
                let reached_start = session.reached_start(now);
                self.transport.set_position(session.position_at(now));
                if reached_start {
                    self.stop_cue();
                } else {
                    self.publish_position();
                }
            }
            ActiveMode::Idle => {}
        }

        self.update_levels();
    }

    fn update_levels(&mut self) {
        let armed = self.tracks.armed();
        let active = !matches!(self.mode, ActiveMode::Idle) || !armed.is_empty();

        if !active {
            if self.levels_live {
                self.levels = [0.0; TRACK_COUNT];
                self.meters.iter_mut().for_each(LevelMeter::reset);
                self.input_meter.reset();
                self.levels_live = false;
                self.events.publish(EngineEvent::Levels(self.levels));
            }
            return;
        }

        let input_level = if self.input.is_some() {
            self.capture.tap().snapshot(&mut self.scratch);
            self.input_meter.update(&self.scratch)
        } else {
            0.0
        };

        for id in TrackId::ALL {
            let i = id.index();
            self.controls[i].tap.snapshot(&mut self.scratch);
            let playback = self.meters[i].update(&self.scratch);
            self.levels[i] = if armed.contains(&id) {
                playback.max(input_level)
            } else {
                playback
            };
        }

        self.levels_live = true;
        self.events.publish(EngineEvent::Levels(self.levels));
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn start_playback_graph(&mut self) -> EngineResult<()> {
        let graph = build_playback_graph(
            &self.tracks,
            &self.controls,
            self.transport.position(),
            self.latency_ms,
            self.backend.output_sample_rate(),
        );
        self.backend.start_output(graph)
    }

    /// Stops the output and forgets stale meter samples.
    fn disconnect_output(&mut self) {
        self.backend.stop_output();
        self.clear_taps();
    }

    fn clear_taps(&self) {
        for control in &self.controls {
            control.tap.clear();
        }
    }

    /// Opens the input if needed and returns its sample rate.
    fn acquire_input(&mut self) -> EngineResult<u32> {
        if let Some(input) = &self.input {
            return Ok(input.sample_rate());
        }
        let (sink, receiver) = input_channel(INPUT_RING_FRAMES);
        let input = self.backend.open_input(sink)?;
        let rate = input.sample_rate();
        tracing::debug!("Input opened at {} Hz", rate);
        self.input = Some(input);
        self.capture.attach(receiver);
        Ok(rate)
    }

    /// Closes the input once nothing records or monitors.
    fn release_input_if_unused(&mut self) {
        let recording = matches!(self.mode, ActiveMode::Recording(_));
        if self.input.is_some() && !recording && self.tracks.armed().is_empty() {
            self.input = None;
            self.capture.detach();
            tracing::debug!("Input closed");
        }
    }

    /// Merges a finished session into its tracks.
    fn finalize_recording(&mut self, session: RecordingSession, disarm: bool) -> EngineResult<()> {
        let take = session.finish(&mut self.capture);
        let merged = merge_take(&self.tracks, &take, self.latency_ms);
        let changed = !merged.is_empty();

        for (id, audio) in merged {
            self.tracks.get_mut(id).set_audio(Some(audio));
            self.reverse_cache.invalidate(id);
        }

        if disarm {
            for &id in &take.targets {
                self.tracks.get_mut(id).armed = false;
            }
            self.events.publish(EngineEvent::Armed(self.tracks.armed()));
        }

        if !changed {
            return Ok(());
        }
        match self.tracks() {
            Ok(descriptors) => {
                self.events.publish(EngineEvent::Tracks(descriptors));
                Ok(())
            }
            Err(e) => {
                let err = EngineError::RecordingFinalize(e.to_string());
                tracing::error!("{}", err);
                self.events.publish(EngineEvent::Error(err.to_string()));
                Err(err)
            }
        }
    }

    fn publish_state(&self) {
        self.events.publish(EngineEvent::State(self.transport.state()));
    }

    fn publish_position(&self) {
        self.events.publish(EngineEvent::Position(self.transport.position()));
    }

    fn publish_tracks(&self) {
        match self.tracks() {
            Ok(descriptors) => self.events.publish(EngineEvent::Tracks(descriptors)),
            Err(e) => tracing::error!("Failed to serialize tracks: {}", e),
        }
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        if !matches!(self.mode, ActiveMode::Idle) {
            if let Err(e) = self.stop() {
                tracing::error!("Error while shutting down: {}", e);
            }
        }
        self.backend.stop_output();
        self.input = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::tape::AudioBuffer;
    use crate::testing::FakeBackend;

    const RATE: u32 = 8000;

    fn setup() -> (AudioEngine, FakeBackend, ManualClock) {
        let backend = FakeBackend::new(RATE, RATE);
        let clock = ManualClock::new();
        let config = EngineConfig {
            output_sample_rate: RATE,
            ..EngineConfig::default()
        };
        let engine = AudioEngine::new(config, Box::new(backend.clone()), Arc::new(clock.clone()));
        (engine, backend, clock)
    }

    fn id(n: u8) -> TrackId {
        TrackId::new(n).unwrap()
    }

    fn load(engine: &mut AudioEngine, n: u8, samples: Vec<f32>) {
        engine.tracks.get_mut(id(n)).set_audio(Some(AudioBuffer::new(samples, RATE)));
    }

    fn ramp(seconds: f64) -> Vec<f32> {
        let len = (seconds * RATE as f64) as usize;
        (0..len).map(|i| (i % 1000) as f32 / 1000.0).collect()
    }

    #[test]
    fn test_play_pause_resume() {
        let (mut engine, backend, clock) = setup();
        load(&mut engine, 1, ramp(5.0));

        engine.play().unwrap();
        assert_eq!(engine.state(), TransportState::Playing);
        assert_eq!(backend.started_graphs(), vec![vec![id(1)]]);

        clock.advance_secs(1.0);
        engine.tick();
        assert!((engine.position() - 1.0).abs() < 1e-6);

        engine.play().unwrap();
        assert_eq!(engine.state(), TransportState::Paused);
        assert!(!backend.is_output_running());

        clock.advance_secs(3.0);
        assert!((engine.position() - 1.0).abs() < 1e-6);

        engine.play().unwrap();
        assert_eq!(engine.state(), TransportState::Playing);
        clock.advance_secs(0.5);
        engine.tick();
        assert!((engine.position() - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_armed_track_excluded_from_playback() {
        let (mut engine, backend, _clock) = setup();
        load(&mut engine, 1, ramp(1.0));
        load(&mut engine, 2, ramp(1.0));
        engine.toggle_arm(id(2)).unwrap();

        engine.play().unwrap();
        assert_eq!(backend.started_graphs().last().unwrap(), &vec![id(1)]);
    }

    #[test]
    fn test_arming_while_playing_rebuilds_graph() {
        let (mut engine, backend, _clock) = setup();
        load(&mut engine, 1, ramp(1.0));
        load(&mut engine, 2, ramp(1.0));
        engine.play().unwrap();
        engine.toggle_arm(id(1)).unwrap();

        assert_eq!(engine.state(), TransportState::Playing);
        assert_eq!(backend.started_graphs().last().unwrap(), &vec![id(2)]);
    }

    #[test]
    fn test_record_requires_armed_track() {
        let (mut engine, backend, _clock) = setup();
        assert!(matches!(engine.record(), Err(EngineError::NoArmedTracks)));
        assert_eq!(engine.state(), TransportState::Stopped);
        assert!(backend.started_graphs().is_empty());
    }

    #[test]
    fn test_device_failure_leaves_state_unchanged() {
        let (mut engine, backend, _clock) = setup();
        backend.fail_output(true);
        assert!(matches!(engine.play(), Err(EngineError::DeviceAccess(_))));
        assert_eq!(engine.state(), TransportState::Stopped);

        backend.fail_output(false);
        backend.fail_input(true);
        engine.toggle_arm(id(1)).unwrap();
        assert!(matches!(engine.record(), Err(EngineError::DeviceAccess(_))));
        assert_eq!(engine.state(), TransportState::Stopped);
        assert!(backend.started_graphs().is_empty());
    }

    #[test]
    fn test_stop_while_recording_appends_take() {
        let (mut engine, backend, clock) = setup();
        let rx = engine.subscribe();
        load(&mut engine, 1, ramp(3.0));
        engine.seek(3.0).unwrap();
        engine.toggle_arm(id(1)).unwrap();

        engine.record().unwrap();
        assert_eq!(engine.state(), TransportState::Recording);
        backend.feed_input(&vec![0.25; 2 * RATE as usize]);
        clock.advance_secs(2.0);
        engine.stop().unwrap();

        assert_eq!(engine.state(), TransportState::Stopped);
        assert!((engine.track(id(1)).duration() - 5.0).abs() < 1e-9);
        assert!((engine.position() - 5.0).abs() < 1e-6);
        // Auto-disarm after recording.
        assert!(engine.armed_tracks().is_empty());
        assert_eq!(backend.open_inputs(), 0);

        let events: Vec<EngineEvent> = rx.try_iter().collect();
        assert!(events.iter().any(|e| matches!(e, EngineEvent::Tracks(_))));
        assert!(matches!(
            events.iter().rev().find(|e| matches!(e, EngineEvent::State(_))),
            Some(EngineEvent::State(TransportState::Stopped))
        ));
    }

    #[test]
    fn test_punch_in_keeps_material_before_punch_point() {
        let (mut engine, backend, clock) = setup();
        let original = ramp(4.0);
        load(&mut engine, 1, original.clone());
        engine.seek(1.5).unwrap();
        engine.toggle_arm(id(1)).unwrap();

        engine.record().unwrap();
        backend.feed_input(&vec![-0.5; RATE as usize]);
        clock.advance_secs(1.0);
        engine.record().unwrap();

        let audio = engine.track(id(1)).audio().unwrap();
        assert!((audio.duration() - 2.5).abs() < 1e-9);
        assert_eq!(&audio.samples()[..12000], &original[..12000]);
        assert!(audio.samples()[12000..].iter().all(|&s| s == -0.5));
    }

    #[test]
    fn test_latency_fix_trims_recorded_take() {
        let (mut engine, backend, clock) = setup();
        engine.set_latency_fix(id(3), true);
        engine.toggle_arm(id(3)).unwrap();
        engine.record().unwrap();
        backend.feed_input(&vec![0.1; RATE as usize]);
        clock.advance_secs(1.0);
        engine.stop().unwrap();

        // Default latency value is -150ms.
        assert_eq!(engine.track(id(3)).audio().unwrap().len(), 6800);
    }

    #[test]
    fn test_multiple_armed_tracks_get_same_take() {
        let (mut engine, backend, clock) = setup();
        engine.toggle_arm(id(2)).unwrap();
        engine.toggle_arm(id(4)).unwrap();
        engine.record().unwrap();
        backend.feed_input(&vec![0.3; 4000]);
        clock.advance_secs(0.5);
        engine.stop().unwrap();

        assert_eq!(engine.track(id(2)).audio(), engine.track(id(4)).audio());
        assert!((engine.track(id(2)).duration() - 0.5).abs() < 1e-9);
        assert!(!engine.track(id(1)).has_audio());
    }

    #[test]
    fn test_seek_while_recording_merges_before_restart() {
        let (mut engine, backend, clock) = setup();
        engine.toggle_arm(id(1)).unwrap();
        engine.record().unwrap();
        backend.feed_input(&vec![0.2; RATE as usize]);
        clock.advance_secs(1.0);

        engine.seek(3.0).unwrap();
        assert_eq!(engine.state(), TransportState::Recording);
        assert!((engine.track(id(1)).duration() - 1.0).abs() < 1e-9);

        backend.feed_input(&vec![0.4; RATE as usize]);
        clock.advance_secs(1.0);
        engine.stop().unwrap();

        let audio = engine.track(id(1)).audio().unwrap();
        assert!((audio.duration() - 4.0).abs() < 1e-9);
        assert_eq!(audio.samples()[0], 0.2);
        assert_eq!(audio.samples()[2 * RATE as usize], 0.0);
        assert_eq!(audio.samples()[3 * RATE as usize], 0.4);
    }

    #[test]
    fn test_arming_is_busy_while_recording() {
        let (mut engine, _backend, _clock) = setup();
        engine.toggle_arm(id(1)).unwrap();
        engine.record().unwrap();
        assert!(matches!(engine.toggle_arm(id(2)), Err(EngineError::Busy(_))));
        engine.play().unwrap();
        assert_eq!(engine.state(), TransportState::Recording);
    }

    #[test]
    fn test_reverse_cue_stops_at_zero() {
        let (mut engine, backend, clock) = setup();
        let rx = engine.subscribe();
        load(&mut engine, 1, ramp(5.0));
        engine.seek(10.0).unwrap();

        engine.start_cue_reverse().unwrap();
        assert!(engine.is_cueing());
        assert_eq!(engine.state(), TransportState::Stopped);
        assert!(backend.is_output_running());

        clock.advance_secs(1.0);
        engine.tick();
        assert!((engine.position() - 6.0).abs() < 1e-6);

        clock.advance_secs(1.0);
        engine.tick();
        clock.advance_secs(1.0);
        engine.tick();

        assert!(!engine.is_cueing());
        assert_eq!(engine.state(), TransportState::Stopped);
        assert_eq!(engine.position(), 0.0);
        assert!(!backend.is_output_running());
        for event in rx.try_iter() {
            if let EngineEvent::Position(p) = event {
                assert!(p >= 0.0);
            }
        }
    }

    #[test]
    fn test_arming_during_cue_removes_track_from_cue() {
        let (mut engine, backend, clock) = setup();
        load(&mut engine, 1, vec![0.5; 5 * RATE as usize]);
        load(&mut engine, 2, vec![0.25; 5 * RATE as usize]);
        engine.start_cue_forward().unwrap();
        assert_eq!(backend.started_graphs().last().unwrap(), &vec![id(1), id(2)]);

        clock.advance_secs(0.5);
        engine.toggle_arm(id(1)).unwrap();

        assert!(engine.is_cueing());
        assert_eq!(engine.state(), TransportState::Stopped);
        assert_eq!(backend.started_graphs().last().unwrap(), &vec![id(2)]);
        assert!((engine.position() - 2.0).abs() < 1e-6);

        let out = backend.render_output(1);
        let expected = 0.25 * engine.config().cue_gain * std::f32::consts::FRAC_1_SQRT_2;
        assert!((out[0] - expected).abs() < 1e-5);
    }

    #[test]
    fn test_seek_while_playing_restarts_graph_at_new_position() {
        let (mut engine, backend, clock) = setup();
        let len = 5 * RATE as usize;
        load(&mut engine, 1, (0..len).map(|i| i as f32 / len as f32).collect());
        engine.play().unwrap();
        clock.advance_secs(0.5);

        engine.seek(2.0).unwrap();
        assert_eq!(engine.state(), TransportState::Playing);
        assert_eq!(backend.started_graphs().len(), 2);
        assert!((engine.position() - 2.0).abs() < 1e-9);

        // Frame 2 * RATE of the ramp is 0.4.
        let out = backend.render_output(1);
        assert!((out[0] - 0.4 * std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-5);
    }

    #[test]
    fn test_set_tracks_during_reverse_cue_rebuilds_with_new_audio() {
        let (mut engine, backend, clock) = setup();
        load(&mut engine, 1, vec![0.5; 4 * RATE as usize]);
        engine.seek(2.0).unwrap();
        engine.start_cue_reverse().unwrap();
        let old = engine.track(id(1)).audio().unwrap().clone();
        assert!(engine.reverse_cache.contains(id(1), &old));

        clock.advance_secs(0.25);
        let mut descriptors = TrackDescriptor::blank_tape();
        descriptors[0].audio =
            Some(encode_wav(&AudioBuffer::new(vec![-0.25; 4 * RATE as usize], RATE)).unwrap());
        engine.set_tracks(descriptors).unwrap();

        assert!(engine.is_cueing());
        assert!(!engine.reverse_cache.contains(id(1), &old));
        let new = engine.track(id(1)).audio().unwrap().clone();
        assert!(engine.reverse_cache.contains(id(1), &new));
        assert_eq!(backend.started_graphs().len(), 2);
        assert!((engine.position() - 1.0).abs() < 1e-6);

        let out = backend.render_output(1);
        let expected = -0.25 * engine.config().cue_gain * std::f32::consts::FRAC_1_SQRT_2;
        assert!((out[0] - expected).abs() < 1e-3);
    }

    #[test]
    fn test_cue_ends_stopped_not_playing() {
        let (mut engine, _backend, clock) = setup();
        load(&mut engine, 1, ramp(10.0));
        engine.play().unwrap();
        clock.advance_secs(1.0);

        engine.start_cue_forward().unwrap();
        assert_eq!(engine.state(), TransportState::Stopped);
        clock.advance_secs(0.5);
        engine.stop_cue();

        assert_eq!(engine.state(), TransportState::Stopped);
        assert!((engine.position() - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_reverse_cache_survives_until_new_recording() {
        let (mut engine, backend, clock) = setup();
        load(&mut engine, 1, ramp(2.0));
        engine.seek(1.0).unwrap();
        engine.start_cue_reverse().unwrap();
        engine.stop_cue();
        let source = engine.track(id(1)).audio().unwrap().clone();
        assert!(engine.reverse_cache.contains(id(1), &source));

        engine.toggle_arm(id(1)).unwrap();
        engine.record().unwrap();
        backend.feed_input(&[0.1; 800]);
        clock.advance_secs(0.1);
        engine.stop().unwrap();
        assert!(!engine.reverse_cache.contains(id(1), &source));
    }

    #[test]
    fn test_playback_auto_stops_at_longest_track() {
        let (mut engine, backend, clock) = setup();
        load(&mut engine, 1, ramp(1.0));
        load(&mut engine, 2, ramp(2.0));
        engine.play().unwrap();

        clock.advance_secs(1.5);
        engine.tick();
        assert_eq!(engine.state(), TransportState::Playing);

        clock.advance_secs(0.6);
        engine.tick();
        assert_eq!(engine.state(), TransportState::Stopped);
        assert!(!backend.is_output_running());
    }

    #[test]
    fn test_blank_tape_playback_keeps_running() {
        let (mut engine, _backend, clock) = setup();
        engine.play().unwrap();
        clock.advance_secs(10.0);
        engine.tick();
        assert_eq!(engine.state(), TransportState::Playing);
        assert!((engine.position() - 10.0).abs() < 1e-6);
    }

    #[test]
    fn test_latency_fix_shifts_graph_start() {
        let (mut engine, backend, _clock) = setup();
        load(&mut engine, 1, ramp(4.0));
        engine.seek(1.0).unwrap();
        engine.set_latency_fix(id(1), true);
        engine.play().unwrap();
        let out = backend.render_output(1);
        // 1.15s into the ramp: frame 9200 -> (9200 % 1000) / 1000.
        let expected = 0.2 * std::f32::consts::FRAC_1_SQRT_2;
        assert!((out[0] - expected).abs() < 1e-5);
    }

    #[test]
    fn test_export() {
        let (mut engine, _backend, _clock) = setup();
        assert!(matches!(engine.export_mix(), Err(EngineError::NoAudioToExport)));

        load(&mut engine, 1, vec![1.0; RATE as usize]);
        let bytes = engine.export_mix().unwrap();
        let mix = decode_wav(&bytes).unwrap();
        assert!(mix.samples().iter().all(|s| s.abs() <= 1.0));
        assert!((mix.duration() - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_set_tracks_skips_undecodable_track() {
        let (mut engine, _backend, _clock) = setup();
        let rx = engine.subscribe();
        let good = encode_wav(&AudioBuffer::new(vec![0.5; 800], RATE)).unwrap();

        let mut descriptors = TrackDescriptor::blank_tape();
        descriptors[0].name = "Drums".into();
        descriptors[0].audio = Some(good.clone());
        descriptors[1].audio = Some(b"not a container".to_vec());
        engine.set_tracks(descriptors).unwrap();

        assert!(engine.track(id(1)).has_audio());
        assert!(!engine.track(id(2)).has_audio());
        assert_eq!(engine.track(id(2)).duration(), 0.0);

        let events: Vec<EngineEvent> = rx.try_iter().collect();
        assert!(events.iter().any(|e| matches!(e, EngineEvent::Error(_))));
        assert!(events.iter().any(|e| matches!(e, EngineEvent::Tracks(_))));

        let stored = engine.tracks().unwrap();
        assert_eq!(stored[0].name, "Drums");
        assert_eq!(stored[0].audio.as_deref(), Some(good.as_slice()));
        assert!(stored[1].audio.is_none());
    }

    #[test]
    fn test_monitor_levels_and_idle_reset() {
        let (mut engine, backend, _clock) = setup();
        let rx = engine.subscribe();
        engine.toggle_arm(id(1)).unwrap();
        assert_eq!(backend.open_inputs(), 1);

        backend.feed_input(&[0.5; 256]);
        engine.tick();
        assert!((engine.levels()[0] - 1.0).abs() < 1e-6);
        assert_eq!(engine.levels()[1], 0.0);

        engine.toggle_arm(id(1)).unwrap();
        assert_eq!(backend.open_inputs(), 0);
        let _ = rx.try_iter().count();
        engine.tick();
        assert_eq!(engine.levels(), [0.0; TRACK_COUNT]);
        assert!(matches!(rx.try_recv(), Ok(EngineEvent::Levels(levels)) if levels == [0.0; TRACK_COUNT]));

        engine.tick();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_playback_levels_follow_graph() {
        let (mut engine, backend, _clock) = setup();
        load(&mut engine, 2, vec![0.25; RATE as usize]);
        engine.play().unwrap();
        backend.render_output(256);
        engine.tick();
        assert!((engine.levels()[1] - 0.5).abs() < 1e-4);
        assert_eq!(engine.levels()[0], 0.0);
    }

    #[test]
    fn test_mixer_controls_reach_graph() {
        let (mut engine, _backend, _clock) = setup();
        engine.set_volume(id(1), 2.0);
        engine.set_pan(id(1), -0.5);
        assert_eq!(engine.track(id(1)).volume(), 1.0);
        assert_eq!(engine.controls[0].gain.get(), 1.0);
        assert_eq!(engine.controls[0].pan.get(), -0.5);
    }

    #[test]
    fn test_calibration_measures_loopback() {
        let (mut engine, backend, _clock) = setup();
        backend.loopback(400); // 50ms at 8 kHz
        let latency = engine.calibrate_latency().unwrap();
        assert!((latency + 50.0).abs() < 0.5);
        assert_eq!(engine.latency_value(), latency);
        assert_eq!(backend.open_inputs(), 0);
    }

    #[test]
    fn test_calibration_requires_stopped_transport() {
        let (mut engine, _backend, _clock) = setup();
        engine.play().unwrap();
        assert!(matches!(engine.calibrate_latency(), Err(EngineError::Busy(_))));
        assert_eq!(engine.latency_value(), -150.0);
    }

    #[test]
    fn test_calibration_without_echo_fails() {
        let (mut engine, _backend, _clock) = setup();
        assert!(matches!(
            engine.calibrate_latency(),
            Err(EngineError::Calibration(_))
        ));
        assert_eq!(engine.latency_value(), -150.0);
    }

    #[test]
    fn test_counter_and_nudges() {
        let (mut engine, _backend, _clock) = setup();
        engine.seek(5.0).unwrap();
        engine.reset_counter();
        engine.seek(7.0).unwrap();
        assert!((engine.counter() - 2.0).abs() < 1e-9);

        engine.rewind_step().unwrap();
        assert!((engine.position() - 6.5).abs() < 1e-9);
        engine.step_back().unwrap();
        assert!((engine.position() - 6.4).abs() < 1e-9);
        engine.jump_to_counter().unwrap();
        assert!((engine.position() - 5.0).abs() < 1e-9);
        engine.fast_forward_step().unwrap();
        engine.step_forward().unwrap();
        assert!((engine.position() - 5.6).abs() < 1e-9);

        engine.seek(-3.0).unwrap();
        assert_eq!(engine.position(), 0.0);
        assert!((engine.counter() + 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_device_selection_passthrough() {
        let (mut engine, backend, _clock) = setup();
        assert_eq!(engine.input_devices(), vec!["Fake Input".to_string()]);
        engine.select_input_device(Some("Fake Input".into()));
        engine.select_output_device(None);
        assert_eq!(backend.selected_devices(), (Some("Fake Input".into()), None));
        assert_eq!(engine.config().input_device.as_deref(), Some("Fake Input"));
    }
}
