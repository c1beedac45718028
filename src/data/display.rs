//! Display filters for plot-ready series.
//!
//! Each channel can reduce its scaled waveform before it is handed to the
//! plotting layer. The filter is chosen per channel in the configuration file
//! as a tagged variant:
//!
//! ```toml
//! [channels.filter]
//! kind = "heterodyne"
//! carrier_hz = 15e6
//! bandwidth_hz = 20e3
//! max_length = 200000
//! ```
//!
//! Display filters never touch the stored samples; they only shape what is
//! plotted.

use serde::{Deserialize, Serialize};

use super::decimate::Decimator;
use crate::error::{AcqError, AppResult};

/// Order of the anti-alias filter used for display decimation.
const DISPLAY_FILTER_ORDER: usize = 2;

/// Per-channel display filter.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DisplayFilter {
    /// Plot the scaled samples unchanged.
    #[default]
    None,
    /// Decimate by a fixed factor.
    Decimate {
        /// Decimation factor.
        factor: usize,
        /// Upper bound on plotted points; raises the factor when exceeded.
        #[serde(default)]
        max_length: Option<usize>,
    },
    /// Demodulate around a carrier and plot the envelope magnitude.
    Heterodyne {
        /// Carrier frequency in Hz.
        carrier_hz: f64,
        /// Envelope bandwidth in Hz; half the carrier when unset.
        #[serde(default)]
        bandwidth_hz: Option<f64>,
        /// Upper bound on plotted points; raises the factor when exceeded.
        #[serde(default)]
        max_length: Option<usize>,
    },
}

impl DisplayFilter {
    /// Check that the filter parameters describe a usable reduction.
    pub fn validate(&self) -> AppResult<()> {
        match self {
            DisplayFilter::None => Ok(()),
            DisplayFilter::Decimate { factor, .. } => {
                if *factor == 0 {
                    return Err(AcqError::Configuration(
                        "Decimate filter factor must be at least 1".into(),
                    ));
                }
                Ok(())
            }
            DisplayFilter::Heterodyne {
                carrier_hz,
                bandwidth_hz,
                ..
            } => {
                if !carrier_hz.is_finite() || *carrier_hz <= 0.0 {
                    return Err(AcqError::Configuration(format!(
                        "Heterodyne carrier {} Hz must be positive",
                        carrier_hz
                    )));
                }
                match bandwidth_hz {
                    Some(bw) if !bw.is_finite() || *bw <= 0.0 => Err(AcqError::Configuration(
                        format!("Heterodyne bandwidth {} Hz must be positive", bw),
                    )),
                    _ => Ok(()),
                }
            }
        }
    }

    /// Apply the filter to a scaled series sampled at `sample_rate_hz`.
    ///
    /// Returns the (possibly thinned) time axis and values.
    pub fn apply(
        &self,
        decimator: &dyn Decimator,
        sample_rate_hz: f64,
        time: &[f64],
        data: &[f64],
    ) -> AppResult<(Vec<f64>, Vec<f64>)> {
        match self {
            DisplayFilter::None => Ok((time.to_vec(), data.to_vec())),
            DisplayFilter::Decimate { factor, max_length } => {
                let factor = bounded_factor(*factor, time.len(), *max_length);
                let filtered = decimator.decimate(data, factor, DISPLAY_FILTER_ORDER)?;
                Ok((thin(time, factor), filtered))
            }
            DisplayFilter::Heterodyne {
                carrier_hz,
                bandwidth_hz,
                max_length,
            } => {
                let bandwidth = bandwidth_hz.unwrap_or(carrier_hz / 2.0);
                let factor = (sample_rate_hz / bandwidth).floor().max(1.0) as usize;
                let factor = bounded_factor(factor, time.len(), *max_length);

                let omega = 2.0 * std::f64::consts::PI * carrier_hz;
                let (in_phase, quadrature): (Vec<f64>, Vec<f64>) = time
                    .iter()
                    .zip(data)
                    .map(|(t, v)| {
                        let phase = omega * t;
                        (v * phase.cos(), v * phase.sin())
                    })
                    .unzip();

                let i = decimator.decimate(&in_phase, factor, DISPLAY_FILTER_ORDER)?;
                let q = decimator.decimate(&quadrature, factor, DISPLAY_FILTER_ORDER)?;
                let magnitude = i.iter().zip(&q).map(|(i, q)| i.hypot(*q)).collect();

                Ok((thin(time, factor), magnitude))
            }
        }
    }
}

fn bounded_factor(factor: usize, len: usize, max_length: Option<usize>) -> usize {
    let factor = factor.max(1);
    match max_length {
        Some(max) if max > 0 => factor.max(len.div_ceil(max)),
        _ => factor,
    }
}

fn thin(time: &[f64], factor: usize) -> Vec<f64> {
    time.iter().copied().step_by(factor).collect()
}
