//! Captures: one trigger's worth of samples.
//!
//! A [`Capture`] is created once per end-of-acquisition event by downloading
//! every monitored channel from the digitizer, together with the board,
//! acquisition and trigger metadata in effect at that moment. After download
//! the only mutation is [`pipeline::resample`], which replaces a channel's
//! samples and effective rate together.

pub mod pipeline;

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::ChannelConfig;
use crate::driver::{AcquisitionInfo, BoardInfo, ChannelSnapshot, Digitizer, TriggerSnapshot};
use crate::error::{AcqError, AppResult};

/// One channel of a capture.
#[derive(Debug, Clone)]
pub struct ChannelCapture {
    /// Run-time configuration of the channel (segments, filter, resampling).
    pub config: Arc<ChannelConfig>,
    /// Front-end settings read back from the board.
    pub snapshot: ChannelSnapshot,
    /// Raw ADC samples.
    pub samples: Vec<i16>,
    /// Effective sample rate of `samples` in Hz.
    pub sample_rate_hz: f64,
}

impl ChannelCapture {
    /// Sample period in seconds.
    pub fn sample_period(&self) -> f64 {
        1.0 / self.sample_rate_hz
    }
}

/// Raw acquisition result of one trigger across all monitored channels.
#[derive(Debug, Clone)]
pub struct Capture {
    timestamp: DateTime<Utc>,
    board: BoardInfo,
    acquisition: AcquisitionInfo,
    trigger: TriggerSnapshot,
    channels: BTreeMap<u16, ChannelCapture>,
}

impl Capture {
    /// Assemble a capture from already downloaded parts.
    pub fn new(
        timestamp: DateTime<Utc>,
        board: BoardInfo,
        acquisition: AcquisitionInfo,
        trigger: TriggerSnapshot,
        channels: impl IntoIterator<Item = ChannelCapture>,
    ) -> Self {
        Self {
            timestamp,
            board,
            acquisition,
            trigger,
            channels: channels
                .into_iter()
                .map(|channel| (channel.config.id, channel))
                .collect(),
        }
    }

    /// Download the most recent acquisition from `driver`.
    ///
    /// Every channel in `channels` is read with the acquisition depth reported
    /// by the board. Any failure aborts the whole capture: a partially
    /// downloaded capture is never returned.
    pub async fn download(
        driver: &dyn Digitizer,
        channels: &[Arc<ChannelConfig>],
        timestamp: DateTime<Utc>,
    ) -> AppResult<Self> {
        let driver_err = |e: anyhow::Error| AcqError::Driver(format!("{e:#}"));

        let board = driver.board_info().await.map_err(driver_err)?;
        let acquisition = driver.acquisition_metadata().await.map_err(driver_err)?;
        let trigger = driver.trigger_metadata().await.map_err(driver_err)?;

        let mut captured = Vec::with_capacity(channels.len());
        for config in channels {
            let snapshot = driver
                .channel_metadata(config.id)
                .await
                .map_err(driver_err)?;
            let samples = driver
                .download_channel(config.id, acquisition.depth)
                .await
                .map_err(driver_err)?;
            if samples.len() != acquisition.depth {
                return Err(AcqError::Driver(format!(
                    "Channel {} returned {} samples, expected {}",
                    config.id,
                    samples.len(),
                    acquisition.depth
                )));
            }
            captured.push(ChannelCapture {
                config: Arc::clone(config),
                snapshot,
                samples,
                sample_rate_hz: acquisition.sample_rate_hz,
            });
        }

        Ok(Self::new(timestamp, board, acquisition, trigger, captured))
    }

    /// Time the end-of-acquisition event was received.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Board identity.
    pub fn board(&self) -> &BoardInfo {
        &self.board
    }

    /// Acquisition metadata.
    pub fn acquisition(&self) -> &AcquisitionInfo {
        &self.acquisition
    }

    /// Trigger configuration.
    pub fn trigger(&self) -> &TriggerSnapshot {
        &self.trigger
    }

    /// Channel by id.
    pub fn channel(&self, id: u16) -> Option<&ChannelCapture> {
        self.channels.get(&id)
    }

    /// Channels in ascending id order.
    pub fn channels(&self) -> impl Iterator<Item = &ChannelCapture> {
        self.channels.values()
    }

    pub(crate) fn channels_mut(&mut self) -> impl Iterator<Item = &mut ChannelCapture> {
        self.channels.values_mut()
    }
}
