//! Capture pipeline: resampling and display scaling.
//!
//! Both transforms are pure functions of a [`Capture`] and run in the
//! producer task, before the capture reaches the sequence tracker.

use serde::Serialize;
use tracing::debug;

use super::Capture;
use crate::data::decimate::{to_raw, Decimator};
use crate::error::AppResult;

/// Filter order used when resampling stored samples.
const RESAMPLE_FILTER_ORDER: usize = 6;

/// Plot-ready series of one channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlotSeries {
    /// Channel id.
    pub channel: u16,
    /// Display name of the channel.
    pub name: String,
    /// Time axis in seconds from the trigger.
    pub time: Vec<f64>,
    /// Values in volts (or filter output units).
    pub values: Vec<f64>,
}

/// Reduce each channel to its configured resample rate.
///
/// Channels without a target rate, or whose target is not below the current
/// rate, are left untouched. Otherwise the decimation factor is
/// `floor(rate / target)` and the new rate is `rate / factor`, so the record
/// duration is preserved up to one sample.
pub fn resample(capture: &mut Capture, decimator: &dyn Decimator) -> AppResult<()> {
    for channel in capture.channels_mut() {
        let Some(target) = channel.config.resample_hz else {
            continue;
        };
        if target >= channel.sample_rate_hz {
            continue;
        }

        let factor = (channel.sample_rate_hz / target).floor() as usize;
        if factor <= 1 {
            continue;
        }

        let input: Vec<f64> = channel.samples.iter().map(|&v| f64::from(v)).collect();
        let filtered = decimator.decimate(&input, factor, RESAMPLE_FILTER_ORDER)?;

        debug!(
            channel = channel.config.id,
            factor,
            from = channel.samples.len(),
            to = filtered.len(),
            "Resampled channel"
        );

        channel.samples = to_raw(&filtered);
        channel.sample_rate_hz /= factor as f64;
    }
    Ok(())
}

/// Convert raw ADC codes to volts.
///
/// `volts = (sample_offset - raw) / sample_res * range_mVpp / 2000 + dc_offset`
pub fn scale_samples(
    samples: &[i16],
    sample_offset: i32,
    sample_res: i32,
    input_range_mvpp: u32,
    dc_offset: i32,
) -> Vec<f64> {
    let gain = f64::from(input_range_mvpp) / 2000.0 / f64::from(sample_res);
    let offset = f64::from(dc_offset);
    samples
        .iter()
        .map(|&raw| f64::from(sample_offset - i32::from(raw)) * gain + offset)
        .collect()
}

/// Scale every channel and apply its display filter.
pub fn prepare_plot(capture: &Capture, decimator: &dyn Decimator) -> AppResult<Vec<PlotSeries>> {
    let acquisition = capture.acquisition();
    capture
        .channels()
        .map(|channel| {
            let scaled = scale_samples(
                &channel.samples,
                acquisition.sample_offset,
                acquisition.sample_res,
                channel.snapshot.input_range_mvpp,
                channel.snapshot.dc_offset,
            );
            let time: Vec<f64> = (0..scaled.len())
                .map(|i| i as f64 / channel.sample_rate_hz)
                .collect();
            let (time, values) =
                channel
                    .config
                    .filter
                    .apply(decimator, channel.sample_rate_hz, &time, &scaled)?;
            Ok(PlotSeries {
                channel: channel.config.id,
                name: channel.config.display_name(),
                time,
                values,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::ChannelCapture;
    use crate::config::ChannelConfig;
    use crate::data::decimate::ButterworthDecimator;
    use crate::data::display::DisplayFilter;
    use crate::driver::{AcquisitionInfo, BoardInfo, ChannelSnapshot, Coupling, TriggerSetup};
    use chrono::Utc;
    use std::sync::Arc;

    fn capture_with(config: ChannelConfig, samples: Vec<i16>, rate: f64) -> Capture {
        let snapshot = ChannelSnapshot {
            channel: config.id,
            input_range_mvpp: config.input_range_mvpp,
            dc_offset: 0,
            coupling: Coupling::Dc,
            impedance_ohms: 50,
        };
        let depth = samples.len();
        Capture::new(
            Utc::now(),
            BoardInfo {
                board_type: 0x24,
                name: "test".into(),
            },
            AcquisitionInfo {
                sample_rate_hz: rate,
                sample_res: -8192,
                sample_offset: -1,
                sample_bits: 14,
                depth,
            },
            TriggerSetup::default(),
            [ChannelCapture {
                config: Arc::new(config),
                snapshot,
                samples,
                sample_rate_hz: rate,
            }],
        )
    }

    #[test]
    fn resample_preserves_record_duration() {
        let mut config = ChannelConfig::new(2, 2000);
        config.resample_hz = Some(2e6);
        let mut capture = capture_with(config, vec![100; 200_000], 200e6);

        resample(&mut capture, &ButterworthDecimator::new()).unwrap();

        let channel = capture.channel(2).unwrap();
        assert_eq!(channel.sample_rate_hz, 2e6);
        assert_eq!(channel.samples.len(), 2000);
        let before = 200_000.0 / 200e6;
        let after = channel.samples.len() as f64 / channel.sample_rate_hz;
        assert!((before - after).abs() <= 1.0 / channel.sample_rate_hz);
        assert!(channel.samples.iter().all(|&v| v == 100));
    }

    #[test]
    fn resample_uses_floor_factor() {
        let mut config = ChannelConfig::new(1, 2000);
        config.resample_hz = Some(3e6);
        let mut capture = capture_with(config, vec![0; 1000], 10e6);

        resample(&mut capture, &ButterworthDecimator::new()).unwrap();

        let channel = capture.channel(1).unwrap();
        assert_eq!(channel.sample_rate_hz, 10e6 / 3.0);
        assert_eq!(channel.samples.len(), 334);
    }

    #[test]
    fn resample_skips_higher_target() {
        let mut config = ChannelConfig::new(1, 2000);
        config.resample_hz = Some(500e6);
        let mut capture = capture_with(config, vec![7; 100], 200e6);

        resample(&mut capture, &ButterworthDecimator::new()).unwrap();

        let channel = capture.channel(1).unwrap();
        assert_eq!(channel.sample_rate_hz, 200e6);
        assert_eq!(channel.samples.len(), 100);
    }

    #[test]
    fn scaling_maps_full_scale_to_half_range() {
        // 2 Vpp range, inverted 14-bit codes: -8192 counts is +1 V.
        let volts = scale_samples(&[-1, 8191, -8193], -1, -8192, 2000, 0);
        assert_eq!(volts[0], 0.0);
        assert!((volts[1] - 1.0).abs() < 1e-12);
        assert!((volts[2] + 1.0).abs() < 1e-12);
    }

    #[test]
    fn plot_applies_display_filter() {
        let mut config = ChannelConfig::new(1, 2000);
        config.filter = DisplayFilter::Decimate {
            factor: 4,
            max_length: None,
        };
        let capture = capture_with(config, vec![-1; 400], 1e6);

        let series = prepare_plot(&capture, &ButterworthDecimator::new()).unwrap();

        assert_eq!(series.len(), 1);
        assert_eq!(series[0].name, "Channel 1");
        assert_eq!(series[0].time.len(), 100);
        assert_eq!(series[0].values.len(), 100);
        assert!((series[0].time[1] - 4e-6).abs() < 1e-15);
    }
}
