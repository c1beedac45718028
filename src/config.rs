//! Configuration System using Figment
//!
//! This module provides strongly-typed configuration loading for the
//! acquisition application. Configuration is loaded from:
//! 1. A TOML file (base configuration, `config/gage_acquire.toml` by default)
//! 2. Environment variables (prefixed with `GAGE_ACQUIRE_`, nested keys
//!    separated by `__`)
//!
//! All run parameters (trigger pattern, channel front-end settings, segment
//! windows, display filters) are resolved here once, at load time, and then
//! passed explicitly to the worker. Nothing is read from process-wide state.
//!
//! # Example
//! ```no_run
//! use gage_acquire::config::AcquireConfig;
//!
//! let config = AcquireConfig::load()?;
//! config.validate()?;
//! println!("Run: {}", config.storage.run_name);
//! # Ok::<(), gage_acquire::error::AcqError>(())
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::data::display::DisplayFilter;
use crate::driver::{AcquisitionSetup, ChannelSetup, Coupling, TriggerSetup};
use crate::error::{AcqError, AppResult};
use crate::pattern::{TriggerPattern, TriggerStep};
use crate::segment::Segment;

/// Input ranges supported by the digitizer front end, in mVpp.
pub const INPUT_RANGES_MVPP: [u32; 7] = [20_000, 10_000, 4_000, 2_000, 1_000, 400, 200];

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquireConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Board-level acquisition settings
    pub acquisition: AcquisitionConfig,
    /// Worker queue and timing settings
    #[serde(default)]
    pub worker: WorkerConfig,
    /// Artifact output settings
    pub storage: StorageConfig,
    /// Trigger pattern for one iteration
    pub triggers: Vec<TriggerStep>,
    /// Monitored channels
    pub channels: Vec<ChannelConfig>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

/// Board-level acquisition configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Sample clock in Hz
    pub sample_rate_hz: f64,
    /// External clock in Hz, if used
    #[serde(default)]
    pub external_clock_hz: Option<f64>,
    /// Record length in ms when no channel defines segments
    #[serde(default = "default_record_length_ms")]
    pub record_length_ms: f64,
    /// External trigger settings
    #[serde(default)]
    pub trigger: TriggerSetup,
}

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Capacity of the capture and command queues
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Interval between trigger timeout checks
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Allowed deviation from the expected trigger time
    #[serde(default = "default_tolerance", with = "humantime_serde")]
    pub tolerance: Duration,
    /// Write the partial iteration when a run is stopped
    #[serde(default)]
    pub flush_partial_on_abort: bool,
    /// Artifacts kept in memory for retry after a failed write
    #[serde(default = "default_max_pending")]
    pub max_pending_artifacts: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            poll_interval: default_poll_interval(),
            tolerance: default_tolerance(),
            flush_partial_on_abort: false,
            max_pending_artifacts: default_max_pending(),
        }
    }
}

/// Artifact output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for run data
    pub data_root: PathBuf,
    /// Run name, used as a directory component
    pub run_name: String,
    /// Artifact format (json or hdf5)
    #[serde(default = "default_format")]
    pub format: String,
    /// Number of the first artifact file
    #[serde(default)]
    pub first_file: u32,
}

/// Per-channel configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// One-based channel number
    pub id: u16,
    /// Display name
    #[serde(default)]
    pub name: Option<String>,
    /// Input coupling
    #[serde(default)]
    pub coupling: Coupling,
    /// Input impedance in ohms
    #[serde(default = "default_impedance")]
    pub impedance_ohms: u32,
    /// Full-scale input range in mVpp
    pub input_range_mvpp: u32,
    /// Target rate for resampling after download
    #[serde(default)]
    pub resample_hz: Option<f64>,
    /// Display filter for plot-ready series
    #[serde(default)]
    pub filter: DisplayFilter,
    /// Segments written to the artifact
    #[serde(default)]
    pub segments: Vec<Segment>,
}

impl ChannelConfig {
    /// Create a channel with default front-end settings and no segments.
    pub fn new(id: u16, input_range_mvpp: u32) -> Self {
        Self {
            id,
            name: None,
            coupling: Coupling::Dc,
            impedance_ohms: default_impedance(),
            input_range_mvpp,
            resample_hz: None,
            filter: DisplayFilter::None,
            segments: Vec::new(),
        }
    }

    /// Add a segment.
    pub fn with_segment(mut self, segment: Segment) -> Self {
        self.segments.push(segment);
        self
    }

    /// Name shown in plots.
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("Channel {}", self.id))
    }

    /// Artifact group name.
    pub fn group_name(&self) -> String {
        format!("ch{}", self.id)
    }

    /// Driver settings for this channel.
    pub fn setup(&self) -> ChannelSetup {
        ChannelSetup {
            channel: self.id,
            coupling: self.coupling,
            impedance_ohms: self.impedance_ohms,
            input_range_mvpp: self.input_range_mvpp,
        }
    }

    /// Check front-end settings and segment windows.
    pub fn validate(&self) -> AppResult<()> {
        if !INPUT_RANGES_MVPP.contains(&self.input_range_mvpp) {
            return Err(AcqError::Configuration(format!(
                "Channel {} input range {} mVpp is not supported (expected one of {:?})",
                self.id, self.input_range_mvpp, INPUT_RANGES_MVPP
            )));
        }
        if let Some(rate) = self.resample_hz {
            if !rate.is_finite() || rate <= 0.0 {
                return Err(AcqError::Configuration(format!(
                    "Channel {} resample rate {} must be positive",
                    self.id, rate
                )));
            }
        }
        self.filter.validate()?;
        let mut names = HashSet::new();
        for segment in &self.segments {
            segment.validate()?;
            if !names.insert(segment.name.as_str()) {
                return Err(AcqError::Configuration(format!(
                    "Channel {} defines segment '{}' twice",
                    self.id, segment.name
                )));
            }
        }
        Ok(())
    }
}

// Default value functions
fn default_record_length_ms() -> f64 {
    12.0
}

fn default_queue_capacity() -> usize {
    32
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_tolerance() -> Duration {
    Duration::from_secs(2)
}

fn default_max_pending() -> usize {
    16
}

fn default_format() -> String {
    "json".to_string()
}

fn default_impedance() -> u32 {
    1_000_000
}

impl AcquireConfig {
    /// Load configuration from config/gage_acquire.toml and environment variables
    ///
    /// Environment variables can override configuration with prefix GAGE_ACQUIRE_
    /// Example: GAGE_ACQUIRE_APPLICATION__LOG_LEVEL=debug
    pub fn load() -> AppResult<Self> {
        Self::load_from("config/gage_acquire.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("GAGE_ACQUIRE_").split("__"))
            .extract()?)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(AcqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if !self.acquisition.sample_rate_hz.is_finite() || self.acquisition.sample_rate_hz <= 0.0 {
            return Err(AcqError::Configuration(format!(
                "Invalid sample_rate_hz {}",
                self.acquisition.sample_rate_hz
            )));
        }

        if !crate::storage::ArtifactFormatRegistry::new().is_available(&self.storage.format) {
            return Err(AcqError::Configuration(format!(
                "Storage format '{}' is not available in this build",
                self.storage.format
            )));
        }

        if self.worker.queue_capacity == 0 {
            return Err(AcqError::Configuration(
                "worker.queue_capacity must be at least 1".into(),
            ));
        }

        self.trigger_pattern()?;
        validate_channels(&self.channels)
    }

    /// Trigger pattern shared by all iterations of a run.
    pub fn trigger_pattern(&self) -> AppResult<TriggerPattern> {
        TriggerPattern::new(self.triggers.clone())
    }

    /// Record length in ms for the configured channels.
    pub fn record_length_ms(&self) -> f64 {
        self.acquisition.record_length_ms(&self.channels)
    }

    /// Samples recorded per trigger.
    pub fn acquisition_depth(&self) -> usize {
        self.acquisition.depth(&self.channels)
    }

    /// Board settings for this configuration.
    pub fn acquisition_setup(&self) -> AcquisitionSetup {
        self.acquisition.setup(&self.channels)
    }
}

impl AcquisitionConfig {
    /// Record length in ms: the latest segment stop, or the configured length
    /// when no channel defines segments.
    pub fn record_length_ms(&self, channels: &[ChannelConfig]) -> f64 {
        channels
            .iter()
            .flat_map(|channel| channel.segments.iter().map(|s| s.stop_ms))
            .reduce(f64::max)
            .unwrap_or(self.record_length_ms)
    }

    /// Samples recorded per trigger.
    pub fn depth(&self, channels: &[ChannelConfig]) -> usize {
        (self.sample_rate_hz * self.record_length_ms(channels) / 1e3).round() as usize
    }

    /// Board settings for a run over `channels`.
    pub fn setup(&self, channels: &[ChannelConfig]) -> AcquisitionSetup {
        AcquisitionSetup {
            sample_rate_hz: self.sample_rate_hz,
            external_clock_hz: self.external_clock_hz,
            depth: self.depth(channels),
        }
    }
}

/// Check a channel list: at least one channel, unique ids, valid settings.
pub fn validate_channels(channels: &[ChannelConfig]) -> AppResult<()> {
    if channels.is_empty() {
        return Err(AcqError::Configuration("At least one channel is required".into()));
    }

    let mut ids = HashSet::new();
    for channel in channels {
        if !ids.insert(channel.id) {
            return Err(AcqError::Configuration(format!(
                "Duplicate channel ID: {}",
                channel.id
            )));
        }
        channel.validate()?;
    }
    Ok(())
}
