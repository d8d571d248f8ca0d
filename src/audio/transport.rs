//! Transport state and playhead bookkeeping.
//!
//! The transport tracks which of the four tape-deck states is active and
//! where the playhead is. While running, the position is derived from the
//! injected clock: `now - anchor`, where the anchor is the clock time at
//! which the tape would have been at 0.

use serde::{Deserialize, Serialize};

/// The four transport states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    /// Not moving; position retained.
    #[default]
    Stopped,
    /// Playing back.
    Playing,
    /// Paused at the current position.
    Paused,
    /// Recording onto the armed tracks (non-armed tracks play back).
    Recording,
}

impl TransportState {
    /// Whether the playhead advances with the clock in this state.
    pub fn is_running(self) -> bool {
        matches!(self, TransportState::Playing | TransportState::Recording)
    }
}

/// Transport state plus playhead.
#[derive(Debug, Clone, Default)]
pub struct Transport {
    state: TransportState,
    /// Position at the last sync (authoritative while not running).
    position: f64,
    /// Clock time corresponding to position 0 while running.
    anchor: f64,
}

impl Transport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    /// Last synced position in seconds.
    pub fn position(&self) -> f64 {
        self.position
    }

    /// Position at clock time `now` without mutating.
    pub fn position_at(&self, now: f64) -> f64 {
        if self.state.is_running() {
            (now - self.anchor).max(0.0)
        } else {
            self.position
        }
    }

    /// Updates the stored position from the clock and returns it.
    pub fn sync(&mut self, now: f64) -> f64 {
        self.position = self.position_at(now);
        self.position
    }

    /// Enters a running state from the current position.
    pub fn run(&mut self, state: TransportState, now: f64) {
        debug_assert!(state.is_running());
        self.anchor = now - self.position;
        self.state = state;
    }

    /// Freezes the playhead and enters Paused.
    pub fn pause(&mut self, now: f64) {
        self.sync(now);
        self.state = TransportState::Paused;
    }

    /// Freezes the playhead and enters Stopped.
    pub fn stop(&mut self, now: f64) {
        self.sync(now);
        self.state = TransportState::Stopped;
    }

    /// Moves the playhead (clamped at 0). A running transport keeps running
    /// from the new position.
    pub fn seek(&mut self, position: f64, now: f64) -> f64 {
        self.position = if position.is_finite() {
            position.max(0.0)
        } else {
            0.0
        };
        self.anchor = now - self.position;
        self.position
    }

    /// Sets the playhead without touching the state (used by cueing).
    pub fn set_position(&mut self, position: f64) {
        self.position = position.max(0.0);
    }
}

/// UI-facing counter: the position rebased on a reference point.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Counter {
    reference: f64,
}

impl Counter {
    pub fn new(reference: f64) -> Self {
        Self { reference }
    }

    pub fn reference(&self) -> f64 {
        self.reference
    }

    /// Makes `position` read as zero.
    pub fn reset(&mut self, position: f64) {
        self.reference = position;
    }

    /// Counter reading at `position` (negative before the reference).
    pub fn reading(&self, position: f64) -> f64 {
        position - self.reference
    }
}
