//! Hardware backend built on rodio (output) and cpal (input).

use super::backend::{AudioBackend, InputSink, InputStream};
use super::graph::{PlaybackGraph, BLOCK_FRAMES};
use crate::error::{EngineError, EngineResult};
use rodio::cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use rodio::cpal::{self, FromSample, Sample, SizedSample};
use rodio::{OutputStream, OutputStreamHandle, Sink, Source};
use std::time::Duration;

/// rodio source that pulls blocks from a playback graph.
///
/// Keeps producing silence after the graph has finished; the engine
/// decides when the transport stops.
struct GraphSource {
    graph: PlaybackGraph,
    buf: Vec<f32>,
    buf_pos: usize,
}

impl GraphSource {
    fn new(graph: PlaybackGraph) -> Self {
        Self {
            graph,
            buf: vec![0.0; BLOCK_FRAMES * 2],
            buf_pos: BLOCK_FRAMES * 2, // Start at end to trigger first render
        }
    }
}

impl Iterator for GraphSource {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        if self.buf_pos >= self.buf.len() {
            self.graph.render(&mut self.buf);
            self.buf_pos = 0;
        }
        let sample = self.buf[self.buf_pos];
        self.buf_pos += 1;
        Some(sample)
    }
}

impl Source for GraphSource {
    fn current_frame_len(&self) -> Option<usize> {
        None // Continuous stream
    }

    fn channels(&self) -> u16 {
        2
    }

    fn sample_rate(&self) -> u32 {
        self.graph.output_rate()
    }

    fn total_duration(&self) -> Option<Duration> {
        None
    }
}

/// Open cpal capture stream.
struct CpalInput {
    _stream: cpal::Stream,
    sample_rate: u32,
}

impl InputStream for CpalInput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Backend driving the system's default (or a named) audio devices.
pub struct RodioBackend {
    output_rate: u32,
    /// Output stream (must be kept alive while a sink plays).
    output: Option<(OutputStream, OutputStreamHandle)>,
    sink: Option<Sink>,
    input_device: Option<String>,
    output_device: Option<String>,
}

impl RodioBackend {
    /// Creates a backend. Devices are opened lazily so that a missing device
    /// surfaces as a `DeviceAccess` error on the first transport command.
    ///
    /// # Arguments
    ///
    /// * `output_rate` - Rate graphs are rendered at (rodio converts to the device rate)
    pub fn new(output_rate: u32) -> Self {
        Self {
            output_rate,
            output: None,
            sink: None,
            input_device: None,
            output_device: None,
        }
    }

    fn open_output(&self) -> EngineResult<(OutputStream, OutputStreamHandle)> {
        let result = match &self.output_device {
            Some(name) => {
                let device = cpal::default_host()
                    .output_devices()
                    .map_err(|e| EngineError::DeviceAccess(e.to_string()))?
                    .find(|d| d.name().map(|n| &n == name).unwrap_or(false))
                    .ok_or_else(|| {
                        EngineError::DeviceAccess(format!("output device not found: {}", name))
                    })?;
                OutputStream::try_from_device(&device)
            }
            None => OutputStream::try_default(),
        };
        result.map_err(|e| EngineError::DeviceAccess(format!("failed to open audio output: {}", e)))
    }

    fn find_input_device(&self) -> EngineResult<cpal::Device> {
        let host = cpal::default_host();
        match &self.input_device {
            Some(name) => host
                .input_devices()
                .map_err(|e| EngineError::DeviceAccess(e.to_string()))?
                .find(|d| d.name().map(|n| &n == name).unwrap_or(false))
                .ok_or_else(|| {
                    EngineError::DeviceAccess(format!("input device not found: {}", name))
                }),
            None => host
                .default_input_device()
                .ok_or_else(|| EngineError::DeviceAccess("no input device available".into())),
        }
    }
}

impl AudioBackend for RodioBackend {
    fn output_sample_rate(&self) -> u32 {
        self.output_rate
    }

    fn start_output(&mut self, graph: PlaybackGraph) -> EngineResult<()> {
        self.stop_output();

        let output = match self.output.take() {
            Some(output) => output,
            None => self.open_output()?,
        };
        let sink = Sink::try_new(&output.1)
            .map_err(|e| EngineError::DeviceAccess(format!("failed to start playback: {}", e)));
        self.output = Some(output);

        let sink = sink?;
        sink.append(GraphSource::new(graph));
        sink.play();
        self.sink = Some(sink);
        Ok(())
    }

    fn stop_output(&mut self) {
        if let Some(sink) = self.sink.take() {
            sink.stop();
        }
    }

    fn open_input(&mut self, sink: InputSink) -> EngineResult<Box<dyn InputStream>> {
        let device = self.find_input_device()?;
        let supported = device
            .default_input_config()
            .map_err(|e| EngineError::DeviceAccess(format!("input config: {}", e)))?;
        let sample_format = supported.sample_format();
        let config: cpal::StreamConfig = supported.into();
        let sample_rate = config.sample_rate.0;

        let stream = match sample_format {
            cpal::SampleFormat::F32 => build_input_stream::<f32>(&device, &config, sink),
            cpal::SampleFormat::I16 => build_input_stream::<i16>(&device, &config, sink),
            cpal::SampleFormat::U16 => build_input_stream::<u16>(&device, &config, sink),
            other => Err(EngineError::DeviceAccess(format!(
                "unsupported input sample format {:?}",
                other
            ))),
        }?;
        stream
            .play()
            .map_err(|e| EngineError::DeviceAccess(format!("failed to start input: {}", e)))?;

        tracing::info!(
            "Opened input {} at {} Hz",
            device.name().unwrap_or_else(|_| "<unknown>".into()),
            sample_rate
        );

        Ok(Box::new(CpalInput {
            _stream: stream,
            sample_rate,
        }))
    }

    fn input_devices(&self) -> Vec<String> {
        cpal::default_host()
            .input_devices()
            .map(|devices| devices.filter_map(|d| d.name().ok()).collect())
            .unwrap_or_default()
    }

    fn output_devices(&self) -> Vec<String> {
        cpal::default_host()
            .output_devices()
            .map(|devices| devices.filter_map(|d| d.name().ok()).collect())
            .unwrap_or_default()
    }

    fn select_input_device(&mut self, name: Option<String>) {
        self.input_device = name;
    }

    fn select_output_device(&mut self, name: Option<String>) {
        if self.output_device != name {
            self.stop_output();
            self.output = None;
        }
        self.output_device = name;
    }
}

/// Builds a capture stream that forwards channel 0 of each frame.
fn build_input_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut sink: InputSink,
) -> EngineResult<cpal::Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels.max(1) as usize;

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                sink.push(data.iter().step_by(channels).map(|&s| s.to_sample::<f32>()));
            },
            |err| tracing::error!("Audio input error: {}", err),
            None,
        )
        .map_err(|e| EngineError::DeviceAccess(format!("failed to build input stream: {}", e)))
}
