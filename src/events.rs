//! Engine-to-host notifications.
//!
//! The engine publishes typed [`EngineEvent`]s on a crossbeam channel; the
//! host drains its receiver at whatever cadence suits it. Every event is
//! published from the control path (inside a command or `tick()`), never
//! from the audio callback.

use crate::audio::TransportState;
use crate::tape::{TrackDescriptor, TrackId, TRACK_COUNT};
use crossbeam::channel::{self, Receiver, Sender, TrySendError};

/// Default channel capacity.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Notifications pushed to the host.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Playhead position in seconds.
    Position(f64),

    /// Transport state changed.
    State(TransportState),

    /// Track contents changed (after a merge or `set_tracks`).
    Tracks(Vec<TrackDescriptor>),

    /// Per-track meter levels, 0..1.
    Levels([f32; TRACK_COUNT]),

    /// The set of armed tracks changed.
    Armed(Vec<TrackId>),

    /// The global latency value changed (milliseconds).
    Latency(f64),

    /// A failure the host should show to the user.
    Error(String),
}

/// Bounded broadcast-style event channel.
///
/// Publishing never blocks: when the host falls behind, new events are
/// dropped rather than stalling the engine.
pub struct EventBus {
    sender: Sender<EngineEvent>,
    receiver: Receiver<EngineEvent>,
}

impl EventBus {
    /// Create a new event bus with bounded capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = channel::bounded(capacity);
        Self { sender, receiver }
    }

    /// Get a receiver for subscribing to events
    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        self.receiver.clone()
    }

    /// Publish an event, dropping it if the channel is full.
    pub fn publish(&self, event: EngineEvent) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                tracing::trace!("Event channel full, dropping {:?}", event);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_bus() {
        let bus = EventBus::new(16);
        let rx = bus.subscribe();

        bus.publish(EngineEvent::Position(1.25));
        bus.publish(EngineEvent::State(TransportState::Playing));

        assert!(matches!(rx.try_recv(), Ok(EngineEvent::Position(p)) if p == 1.25));
        assert!(matches!(
            rx.try_recv(),
            Ok(EngineEvent::State(TransportState::Playing))
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_full_bus_drops_instead_of_blocking() {
        let bus = EventBus::new(2);
        let rx = bus.subscribe();
        for i in 0..10 {
            bus.publish(EngineEvent::Position(i as f64));
        }
        assert_eq!(rx.try_iter().count(), 2);
    }
}
