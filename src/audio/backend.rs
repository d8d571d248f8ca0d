//! Audio device abstraction.
//!
//! The engine talks to hardware only through [`AudioBackend`]: it hands a
//! built [`PlaybackGraph`] to the output and receives input frames through
//! an [`InputSink`], the producing end of a lock-free ring drained on the
//! control thread by a [`CaptureBuffer`]. The rodio/cpal implementation
//! lives in [`super::device`].

use super::graph::PlaybackGraph;
use super::meter::AnalysisTap;
use crate::error::EngineResult;
use rtrb::{Consumer, Producer, RingBuffer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Output and input device access.
pub trait AudioBackend {
    /// Sample rate graphs should be rendered at.
    fn output_sample_rate(&self) -> u32;

    /// Starts rendering `graph`, replacing any running graph.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::DeviceAccess` if no output can be opened.
    fn start_output(&mut self, graph: PlaybackGraph) -> EngineResult<()>;

    /// Stops and drops the running graph. Returns once the graph is
    /// disconnected from the device.
    fn stop_output(&mut self);

    /// Opens the input device; frames are delivered to `sink` until the
    /// returned stream is dropped.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::DeviceAccess` if the input cannot be acquired.
    fn open_input(&mut self, sink: InputSink) -> EngineResult<Box<dyn InputStream>>;

    /// Names of the available input devices.
    fn input_devices(&self) -> Vec<String>;

    /// Names of the available output devices.
    fn output_devices(&self) -> Vec<String>;

    /// Selects the input device used by the next `open_input` (None = default).
    fn select_input_device(&mut self, name: Option<String>);

    /// Selects the output device used by the next `start_output` (None = default).
    fn select_output_device(&mut self, name: Option<String>);
}

/// An open input stream. Dropping it closes the device.
pub trait InputStream {
    /// Device sample rate of the delivered frames.
    fn sample_rate(&self) -> u32;
}

/// Input ring capacity in frames (about 10 s at 48 kHz).
pub const INPUT_RING_FRAMES: usize = 1 << 19;

/// A finished capture.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Take {
    /// Captured mono frames.
    pub samples: Vec<f32>,
    /// Device frame counter at the first captured frame.
    pub start_frame: u64,
    /// Device frame counter one past the last captured frame.
    pub end_frame: u64,
}

/// Creates a connected input sink (audio thread) and receiver (control
/// thread) over a single-producer single-consumer ring.
pub fn input_channel(capacity: usize) -> (InputSink, InputReceiver) {
    let (producer, consumer) = RingBuffer::<f32>::new(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    (
        InputSink {
            producer,
            dropped: Arc::clone(&dropped),
        },
        InputReceiver { consumer, dropped },
    )
}

/// Audio-thread end of the input ring. Never blocks or allocates.
pub struct InputSink {
    producer: Producer<f32>,
    /// Frames lost because the ring was full.
    dropped: Arc<AtomicU64>,
}

impl InputSink {
    /// Delivers mono frames from the device callback.
    pub fn push(&mut self, frames: impl IntoIterator<Item = f32>) {
        let mut dropped = 0u64;
        for frame in frames {
            if self.producer.push(frame).is_err() {
                dropped += 1;
            }
        }
        if dropped > 0 {
            self.dropped.fetch_add(dropped, Ordering::Relaxed);
        }
    }
}

/// Control-thread end of the input ring.
pub struct InputReceiver {
    consumer: Consumer<f32>,
    dropped: Arc<AtomicU64>,
}

impl std::fmt::Debug for InputReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputReceiver")
            .field("pending", &self.consumer.slots())
            .finish()
    }
}

#[derive(Debug)]
struct CaptureState {
    capturing: bool,
    frames: Vec<f32>,
    /// Frames received from the device since the input was attached.
    device_frames: u64,
    start_frame: u64,
    /// Live-input meter window.
    tap: AnalysisTap,
}

impl CaptureState {
    fn accept(&mut self, frames: &[f32]) {
        if frames.is_empty() {
            return;
        }
        self.device_frames += frames.len() as u64;
        if self.capturing {
            self.frames.extend_from_slice(frames);
        }
        self.tap.write(frames);
    }
}

/// Control-side frame accumulator for the recorder and the input meter.
///
/// Frames reach it only when [`CaptureBuffer::pump`] drains the input ring,
/// so start and stop are stamped in device frames at drain time. `start`
/// and `stop` drain first.
#[derive(Debug)]
pub struct CaptureBuffer {
    receiver: Option<InputReceiver>,
    state: CaptureState,
}

impl CaptureBuffer {
    /// # Arguments
    ///
    /// * `meter_window` - Size of the live-input meter window in samples
    pub fn new(meter_window: usize) -> Self {
        Self {
            receiver: None,
            state: CaptureState {
                capturing: false,
                frames: Vec::new(),
                device_frames: 0,
                start_frame: 0,
                tap: AnalysisTap::new(meter_window),
            },
        }
    }

    /// Connects the receiving end of a freshly opened input.
    pub fn attach(&mut self, receiver: InputReceiver) {
        self.pump();
        self.receiver = Some(receiver);
    }

    /// Disconnects the input, keeping any frames already drained.
    pub fn detach(&mut self) {
        self.pump();
        self.receiver = None;
        self.state.tap.clear();
    }

    pub fn is_attached(&self) -> bool {
        self.receiver.is_some()
    }

    /// Drains every frame waiting in the input ring. Returns the number of
    /// frames drained.
    pub fn pump(&mut self) -> usize {
        let Some(receiver) = self.receiver.as_mut() else {
            return 0;
        };

        let lost = receiver.dropped.swap(0, Ordering::Relaxed);
        if lost > 0 {
            tracing::warn!("Input ring overflow: {} frames lost", lost);
        }

        let pending = receiver.consumer.slots();
        if pending == 0 {
            return 0;
        }
        match receiver.consumer.read_chunk(pending) {
            Ok(chunk) => {
                let (first, second) = chunk.as_slices();
                self.state.accept(first);
                self.state.accept(second);
                chunk.commit_all();
                pending
            }
            Err(_) => 0,
        }
    }

    /// Begins accumulating; previously captured frames are discarded.
    pub fn start(&mut self) {
        self.pump();
        self.state.frames.clear();
        self.state.start_frame = self.state.device_frames;
        self.state.capturing = true;
    }

    /// Stops accumulating and returns everything captured since `start`.
    pub fn stop(&mut self) -> Take {
        self.pump();
        self.state.capturing = false;
        Take {
            samples: std::mem::take(&mut self.state.frames),
            start_frame: self.state.start_frame,
            end_frame: self.state.device_frames,
        }
    }

    pub fn is_capturing(&self) -> bool {
        self.state.capturing
    }

    /// Frames captured so far in the current take, as of the last drain.
    pub fn captured_frames(&self) -> usize {
        self.state.frames.len()
    }

    /// Live-input meter window.
    pub fn tap(&self) -> &AnalysisTap {
        &self.state.tap
    }
}
