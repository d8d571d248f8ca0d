//! Engine configuration.
//!
//! Stored as JSON. Every field has a default, so a partial file (or no file
//! at all) yields a usable configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Latency calibration settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Probe tone frequency in Hz.
    pub probe_frequency_hz: f32,
    /// Probe tone length in milliseconds.
    pub probe_ms: u32,
    /// How long to capture after the probe starts.
    pub listen_ms: u32,
    /// Minimum normalized correlation accepted as a detection (0..1).
    pub detection_threshold: f32,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            probe_frequency_hz: 1000.0,
            probe_ms: 60,
            listen_ms: 1000,
            detection_threshold: 0.2,
        }
    }
}

/// Engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Rate playback graphs are rendered at.
    pub output_sample_rate: u32,

    /// Interval between scheduler ticks.
    pub tick_interval_ms: u64,

    /// Cue speed multiplier (magnitude).
    pub cue_rate: f64,

    /// Fraction of the track volume used while cueing.
    pub cue_gain: f32,

    /// Latency value in milliseconds until a calibration replaces it.
    pub latency_ms: f64,

    /// Meter analysis window in samples.
    pub meter_window: usize,

    /// Gain applied to the RMS before clamping.
    pub meter_gain: f32,

    /// Fraction of the previous level kept when the signal falls.
    pub meter_smoothing: f32,

    /// Disarm recorded tracks once the take is merged.
    pub auto_disarm_after_recording: bool,

    /// Input device name (None = system default).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_device: Option<String>,

    /// Output device name (None = system default).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_device: Option<String>,

    pub calibration: CalibrationConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            output_sample_rate: 44100,
            tick_interval_ms: 50,
            cue_rate: 4.0,
            cue_gain: 0.5,
            latency_ms: -150.0,
            meter_window: 128,
            meter_gain: 2.0,
            meter_smoothing: 0.3,
            auto_disarm_after_recording: true,
            input_device: None,
            output_device: None,
            calibration: CalibrationConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Loads a configuration from a JSON file.
    ///
    /// A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        tracing::info!("Loaded config from {}", path.display());
        Ok(config.validate())
    }

    /// Saves the configuration as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns error if serialization or file writing fails
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Replaces out-of-range values with usable ones.
    pub fn validate(mut self) -> Self {
        let defaults = Self::default();

        if self.output_sample_rate == 0 {
            tracing::warn!("output_sample_rate 0 is invalid, using {}", defaults.output_sample_rate);
            self.output_sample_rate = defaults.output_sample_rate;
        }
        if self.tick_interval_ms == 0 {
            self.tick_interval_ms = defaults.tick_interval_ms;
        }
        if !(self.cue_rate.is_finite() && self.cue_rate > 0.0) {
            tracing::warn!("cue_rate {} is invalid, using {}", self.cue_rate, defaults.cue_rate);
            self.cue_rate = defaults.cue_rate;
        }
        if !self.latency_ms.is_finite() {
            self.latency_ms = defaults.latency_ms;
        }
        self.cue_gain = if self.cue_gain.is_finite() {
            self.cue_gain.clamp(0.0, 1.0)
        } else {
            defaults.cue_gain
        };
        self.meter_window = self.meter_window.max(1);
        if !(self.meter_gain.is_finite() && self.meter_gain > 0.0) {
            self.meter_gain = defaults.meter_gain;
        }
        self.meter_smoothing = if self.meter_smoothing.is_finite() {
            self.meter_smoothing.clamp(0.0, 0.99)
        } else {
            defaults.meter_smoothing
        };

        let cal = &mut self.calibration;
        if !(cal.probe_frequency_hz.is_finite() && cal.probe_frequency_hz > 0.0) {
            cal.probe_frequency_hz = defaults.calibration.probe_frequency_hz;
        }
        cal.probe_ms = cal.probe_ms.max(1);
        cal.listen_ms = cal.listen_ms.max(cal.probe_ms);
        cal.detection_threshold = if cal.detection_threshold.is_finite() {
            cal.detection_threshold.clamp(0.0, 1.0)
        } else {
            defaults.calibration.detection_threshold
        };

        self
    }
}
