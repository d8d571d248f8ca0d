//! In-memory audio backend for engine tests.

use crate::audio::backend::{AudioBackend, InputSink, InputStream};
use crate::audio::graph::{PlaybackGraph, BLOCK_FRAMES};
use crate::error::{EngineError, EngineResult};
use crate::tape::TrackId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
struct FakeState {
    output_rate: u32,
    input_rate: u32,
    fail_output: bool,
    fail_input: bool,
    /// Track ids of every graph handed to `start_output`, in order.
    started: Vec<Vec<TrackId>>,
    running: Option<PlaybackGraph>,
    inputs: Vec<(InputSink, Arc<AtomicBool>)>,
    /// Output-to-input loopback delay in frames.
    loopback_delay: Option<usize>,
    input_device: Option<String>,
    output_device: Option<String>,
}

/// Backend handle; clones share the same fake devices.
#[derive(Clone)]
pub struct FakeBackend {
    state: Arc<Mutex<FakeState>>,
}

struct FakeInput {
    open: Arc<AtomicBool>,
    sample_rate: u32,
}

impl InputStream for FakeInput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl Drop for FakeInput {
    fn drop(&mut self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

impl FakeBackend {
    pub fn new(output_rate: u32, input_rate: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                output_rate,
                input_rate,
                ..FakeState::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Makes `start_output` fail with a device error.
    pub fn fail_output(&self, fail: bool) {
        self.lock().fail_output = fail;
    }

    /// Makes `open_input` fail with a device error.
    pub fn fail_input(&self, fail: bool) {
        self.lock().fail_input = fail;
    }

    /// Echoes every started graph into the open inputs after `delay` frames.
    pub fn loopback(&self, delay: usize) {
        self.lock().loopback_delay = Some(delay);
    }

    pub fn started_graphs(&self) -> Vec<Vec<TrackId>> {
        self.lock().started.clone()
    }

    pub fn is_output_running(&self) -> bool {
        self.lock().running.is_some()
    }

    pub fn open_inputs(&self) -> usize {
        self.lock()
            .inputs
            .iter()
            .filter(|(_, open)| open.load(Ordering::SeqCst))
            .count()
    }

    pub fn selected_devices(&self) -> (Option<String>, Option<String>) {
        let state = self.lock();
        (state.input_device.clone(), state.output_device.clone())
    }

    /// Delivers frames to every open input.
    pub fn feed_input(&self, frames: &[f32]) {
        let mut state = self.lock();
        for (sink, open) in state.inputs.iter_mut() {
            if open.load(Ordering::SeqCst) {
                sink.push(frames.iter().copied());
            }
        }
    }

    /// Pulls interleaved stereo frames from the running graph.
    pub fn render_output(&self, frames: usize) -> Vec<f32> {
        let mut out = vec![0.0; frames * 2];
        if let Some(graph) = self.lock().running.as_mut() {
            graph.render(&mut out);
        }
        out
    }
}

impl AudioBackend for FakeBackend {
    fn output_sample_rate(&self) -> u32 {
        self.lock().output_rate
    }

    fn start_output(&mut self, mut graph: PlaybackGraph) -> EngineResult<()> {
        let mut state = self.lock();
        state.running = None;
        if state.fail_output {
            return Err(EngineError::DeviceAccess("fake output unavailable".into()));
        }
        state.started.push(graph.track_ids());

        if let Some(delay) = state.loopback_delay {
            let limit = state.output_rate as usize * 10;
            let mut echo = vec![0.0; delay];
            let mut block = vec![0.0; BLOCK_FRAMES * 2];
            while !graph.is_finished() && echo.len() < limit {
                graph.render(&mut block);
                echo.extend(block.chunks_exact(2).map(|frame| frame[0]));
            }
            echo.extend(vec![0.0; state.output_rate as usize]);
            for (sink, open) in state.inputs.iter_mut() {
                if open.load(Ordering::SeqCst) {
                    sink.push(echo.iter().copied());
                }
            }
        }

        state.running = Some(graph);
        Ok(())
    }

    fn stop_output(&mut self) {
        self.lock().running = None;
    }

    fn open_input(&mut self, sink: InputSink) -> EngineResult<Box<dyn InputStream>> {
        let mut state = self.lock();
        if state.fail_input {
            return Err(EngineError::DeviceAccess("fake input unavailable".into()));
        }
        let open = Arc::new(AtomicBool::new(true));
        state.inputs.push((sink, Arc::clone(&open)));
        Ok(Box::new(FakeInput {
            open,
            sample_rate: state.input_rate,
        }))
    }

    fn input_devices(&self) -> Vec<String> {
        vec!["Fake Input".into()]
    }

    fn output_devices(&self) -> Vec<String> {
        vec!["Fake Output".into()]
    }

    fn select_input_device(&mut self, name: Option<String>) {
        self.lock().input_device = name;
    }

    fn select_output_device(&mut self, name: Option<String>) {
        self.lock().output_device = name;
    }
}
