//! Anti-aliased decimation.
//!
//! Rate reduction is used twice in the acquisition path: to resample a
//! channel to a configured lower rate before its samples are stored, and to
//! thin out plot-ready series. Both go through the [`Decimator`] trait so the
//! filter implementation can be swapped without touching the pipeline.
//!
//! [`ButterworthDecimator`] applies a low-pass Butterworth filter built from
//! cascaded `biquad` second-order sections, with its cutoff at `0.8 / factor`
//! of the Nyquist frequency, then keeps every `factor`-th sample. By default
//! the filter runs forward and backward (zero phase) so pulse edges do not
//! shift in time.

use biquad::{Biquad, Coefficients, DirectForm2Transposed, ToHertz, Type};

use crate::error::{AcqError, AppResult};

/// Rate reduction with anti-alias filtering.
pub trait Decimator: Send + Sync {
    /// Filter `data` and keep every `factor`-th sample.
    ///
    /// `order` is the filter order. The output has `ceil(len / factor)`
    /// samples and its first sample is aligned with the first input sample.
    fn decimate(&self, data: &[f64], factor: usize, order: usize) -> AppResult<Vec<f64>>;
}

/// Butterworth low-pass decimator.
#[derive(Debug, Clone)]
pub struct ButterworthDecimator {
    zero_phase: bool,
}

impl Default for ButterworthDecimator {
    fn default() -> Self {
        Self { zero_phase: true }
    }
}

impl ButterworthDecimator {
    /// Zero-phase decimator (forward-backward filtering).
    pub fn new() -> Self {
        Self::default()
    }

    /// Single forward pass; cheaper, but delays the signal.
    pub fn causal() -> Self {
        Self { zero_phase: false }
    }

    fn design(factor: usize, order: usize) -> AppResult<Vec<Coefficients<f64>>> {
        // Normalized so that Nyquist is 1.0.
        let fs = 2.0_f64.hz();
        let f0 = (0.8 / factor as f64).hz();
        let sections = order.max(2).div_ceil(2);
        let n = (sections * 2) as f64;

        (0..sections)
            .map(|k| {
                let theta = std::f64::consts::PI * (2 * k + 1) as f64 / (2.0 * n);
                let q = 1.0 / (2.0 * theta.cos());
                Coefficients::<f64>::from_params(Type::LowPass, fs, f0, q).map_err(|e| {
                    AcqError::Configuration(format!(
                        "Failed to design decimation filter (factor {factor}): {e:?}"
                    ))
                })
            })
            .collect()
    }

    fn filter_pass(
        sections: &[Coefficients<f64>],
        input: impl Iterator<Item = f64>,
        prime: f64,
        prime_len: usize,
    ) -> Vec<f64> {
        let mut stages: Vec<DirectForm2Transposed<f64>> = sections
            .iter()
            .map(|coeffs| DirectForm2Transposed::<f64>::new(*coeffs))
            .collect();

        let mut run = |x: f64| stages.iter_mut().fold(x, |acc, stage| stage.run(acc));

        // Settle on the edge value so the output does not ramp up from zero.
        for _ in 0..prime_len {
            run(prime);
        }

        input.map(run).collect()
    }
}

impl Decimator for ButterworthDecimator {
    fn decimate(&self, data: &[f64], factor: usize, order: usize) -> AppResult<Vec<f64>> {
        if factor == 0 {
            return Err(AcqError::Configuration(
                "Decimation factor must be at least 1".into(),
            ));
        }
        if factor == 1 || data.is_empty() {
            return Ok(data.to_vec());
        }

        let sections = Self::design(factor, order)?;
        let prime_len = 16 * factor * sections.len();

        let forward = Self::filter_pass(&sections, data.iter().copied(), data[0], prime_len);

        let filtered = if self.zero_phase {
            let last = forward[forward.len() - 1];
            let mut backward =
                Self::filter_pass(&sections, forward.iter().rev().copied(), last, prime_len);
            backward.reverse();
            backward
        } else {
            forward
        };

        Ok(filtered.into_iter().step_by(factor).collect())
    }
}

/// Convert filtered samples back to raw ADC codes.
pub fn to_raw(samples: &[f64]) -> Vec<i16> {
    samples
        .iter()
        .map(|v| v.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_length_is_ceiling_of_input_over_factor() {
        let decimator = ButterworthDecimator::new();
        let data = vec![0.0; 1001];
        let out = decimator.decimate(&data, 10, 6).unwrap();
        assert_eq!(out.len(), 101);
    }

    #[test]
    fn constant_signal_is_preserved() {
        let decimator = ButterworthDecimator::new();
        let data = vec![1234.0; 4000];
        let out = decimator.decimate(&data, 8, 6).unwrap();
        for value in out {
            assert!((value - 1234.0).abs() < 1e-6, "got {value}");
        }
    }

    #[test]
    fn high_frequency_content_is_removed() {
        let decimator = ButterworthDecimator::new();
        // Alternating signal sits at Nyquist and must not alias into the output.
        let data: Vec<f64> = (0..4000)
            .map(|i| if i % 2 == 0 { 1000.0 } else { -1000.0 })
            .collect();
        let out = decimator.decimate(&data, 10, 6).unwrap();
        let interior = &out[50..out.len() - 50];
        let peak = interior.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
        assert!(peak < 1.0, "residual amplitude {peak}");
    }

    #[test]
    fn factor_one_is_identity() {
        let decimator = ButterworthDecimator::causal();
        let data = vec![1.0, 2.0, 3.0];
        assert_eq!(decimator.decimate(&data, 1, 6).unwrap(), data);
    }

    #[test]
    fn zero_factor_is_rejected() {
        let decimator = ButterworthDecimator::new();
        assert!(decimator.decimate(&[1.0], 0, 2).is_err());
    }

    #[test]
    fn raw_conversion_rounds_and_saturates() {
        assert_eq!(to_raw(&[1.4, -1.6, 1e9, -1e9]), vec![1, -2, i16::MAX, i16::MIN]);
    }
}
