//! Digitizer Driver Boundary
//!
//! This module defines the interface the acquisition worker consumes from the
//! digitizer driver, together with the configuration and metadata records
//! that cross it. The driver itself (vendor SDK bindings, DMA transfers,
//! register-level behavior) lives outside this crate; [`mock::MockDigitizer`]
//! provides a simulated board for tests and the `simulate` command.
//!
//! # Design
//!
//! Like the other hardware capabilities in this codebase the trait is async
//! (`#[async_trait]`), thread-safe (`Send + Sync`, interior mutability for
//! state) and returns `anyhow::Result`. The worker converts driver errors into
//! [`AcqError::Driver`](crate::error::AcqError::Driver) at the boundary.
//!
//! End-of-acquisition notification is a plain callback. The callback runs in
//! the driver's context and must only enqueue; all sequence tracking happens
//! on the worker's single consumer task.

pub mod mock;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Input coupling of a channel or of the external trigger input.
///
/// Discriminants match the digitizer SDK so they can be stored verbatim in
/// artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Coupling {
    #[default]
    Dc = 1,
    Ac = 2,
}

impl Coupling {
    /// SDK code for this coupling.
    pub fn code(self) -> i64 {
        self as i64
    }
}

/// Trigger slope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Slope {
    #[default]
    Rising,
    Falling,
}

impl Slope {
    /// Slope code used in artifacts: 1 for rising edge, 2 for falling edge.
    pub fn code(self) -> i64 {
        match self {
            Slope::Rising => 1,
            Slope::Falling => 2,
        }
    }
}

/// Trigger source selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerSource {
    /// External trigger input.
    #[default]
    External,
    /// Trigger on an input channel.
    Channel(u16),
    /// Software trigger only.
    Disabled,
}

/// Acquisition-wide settings pushed to the board before arming.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionSetup {
    /// Sample clock in Hz.
    pub sample_rate_hz: f64,
    /// External clock in Hz, if the board is clocked externally.
    pub external_clock_hz: Option<f64>,
    /// Samples recorded per trigger.
    pub depth: usize,
}

/// Per-channel front-end settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSetup {
    /// One-based channel number.
    pub channel: u16,
    /// Input coupling.
    pub coupling: Coupling,
    /// Input impedance in ohms (50 or 1 MΩ).
    pub impedance_ohms: u32,
    /// Full-scale input range in mVpp.
    pub input_range_mvpp: u32,
}

/// External trigger settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerSetup {
    /// Trigger slope.
    #[serde(default)]
    pub slope: Slope,
    /// Trigger level as a percentage of half the trigger range.
    #[serde(default = "default_trigger_level")]
    pub level_percent: i32,
    /// Trigger input coupling.
    #[serde(default)]
    pub coupling: Coupling,
    /// Trigger input impedance in ohms.
    #[serde(default = "default_trigger_impedance")]
    pub impedance_ohms: u32,
    /// Trigger input range in mVpp.
    #[serde(default = "default_trigger_range")]
    pub range_mvpp: u32,
    /// Trigger source.
    #[serde(default)]
    pub source: TriggerSource,
}

fn default_trigger_level() -> i32 {
    30
}

fn default_trigger_impedance() -> u32 {
    1_000_000
}

fn default_trigger_range() -> u32 {
    10_000
}

impl Default for TriggerSetup {
    fn default() -> Self {
        Self {
            slope: Slope::Rising,
            level_percent: default_trigger_level(),
            coupling: Coupling::Dc,
            impedance_ohms: default_trigger_impedance(),
            range_mvpp: default_trigger_range(),
            source: TriggerSource::External,
        }
    }
}

/// Board identity as reported by the driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardInfo {
    /// Numeric board type code.
    pub board_type: u32,
    /// Human readable board name.
    pub name: String,
}

/// Acquisition metadata read back after a trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionInfo {
    /// Sample rate in Hz.
    pub sample_rate_hz: f64,
    /// ADC code span used for scaling; negative on boards with inverted codes.
    pub sample_res: i32,
    /// ADC code corresponding to zero volts.
    pub sample_offset: i32,
    /// ADC resolution in bits.
    pub sample_bits: u32,
    /// Samples recorded per channel.
    pub depth: usize,
}

/// Trigger configuration read back after a trigger.
pub type TriggerSnapshot = TriggerSetup;

/// Channel configuration read back after a trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    /// One-based channel number.
    pub channel: u16,
    /// Full-scale input range in mVpp.
    pub input_range_mvpp: u32,
    /// DC offset as reported by the board.
    pub dc_offset: i32,
    /// Input coupling.
    pub coupling: Coupling,
    /// Input impedance in ohms.
    pub impedance_ohms: u32,
}

/// Callback invoked by the driver when a triggered acquisition has finished.
pub type AcquisitionCallback = Box<dyn Fn() + Send + Sync>;

/// Interface consumed from the digitizer driver.
///
/// # Contract
/// - Configuration calls take effect on [`commit`](Digitizer::commit).
/// - [`start`](Digitizer::start) arms the board for one trigger; the board
///   must be re-armed after every end-of-acquisition event.
/// - Downloads and metadata reads refer to the most recent acquisition and
///   may block on a device transfer.
#[async_trait]
pub trait Digitizer: Send + Sync {
    /// Initialize the driver library.
    async fn initialize(&self) -> Result<()>;

    /// Open the acquisition system.
    async fn open(&self) -> Result<()>;

    /// Close the acquisition system.
    async fn close(&self) -> Result<()>;

    /// Stage acquisition-wide settings.
    async fn set_acquisition_config(&self, setup: &AcquisitionSetup) -> Result<()>;

    /// Stage one channel's front-end settings.
    async fn set_channel_config(&self, setup: &ChannelSetup) -> Result<()>;

    /// Stage trigger settings.
    async fn set_trigger_config(&self, setup: &TriggerSetup) -> Result<()>;

    /// Push staged settings to the hardware.
    async fn commit(&self) -> Result<()>;

    /// Arm the board for the next trigger.
    async fn start(&self) -> Result<()>;

    /// Abort any pending acquisition.
    async fn abort(&self) -> Result<()>;

    /// Register the end-of-acquisition callback, replacing any previous one.
    fn register_end_of_acquisition(&self, callback: AcquisitionCallback) -> Result<()>;

    /// Remove the end-of-acquisition callback.
    fn clear_end_of_acquisition(&self);

    /// Download `length` raw samples of `channel`.
    async fn download_channel(&self, channel: u16, length: usize) -> Result<Vec<i16>>;

    /// Board identity.
    async fn board_info(&self) -> Result<BoardInfo>;

    /// Metadata of the most recent acquisition.
    async fn acquisition_metadata(&self) -> Result<AcquisitionInfo>;

    /// Trigger configuration of the most recent acquisition.
    async fn trigger_metadata(&self) -> Result<TriggerSnapshot>;

    /// Channel configuration of the most recent acquisition.
    async fn channel_metadata(&self, channel: u16) -> Result<ChannelSnapshot>;
}
