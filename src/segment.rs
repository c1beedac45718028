//! Named time windows within a capture.
//!
//! A [`Segment`] is defined per channel in milliseconds relative to the
//! trigger. At output time it is converted into a [`SegmentWindow`] of sample
//! indices using the channel's effective sample period, which may differ from
//! the board's sample period when the channel has been resampled.

use serde::{Deserialize, Serialize};

use crate::error::{AcqError, AppResult};

/// A named window `[start_ms, stop_ms)` relative to the trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// Dataset name, prefixed with the trigger label on output.
    pub name: String,
    /// Window start in milliseconds.
    pub start_ms: f64,
    /// Window stop in milliseconds.
    pub stop_ms: f64,
}

impl Segment {
    /// Create a segment.
    pub fn new(name: impl Into<String>, start_ms: f64, stop_ms: f64) -> Self {
        Self {
            name: name.into(),
            start_ms,
            stop_ms,
        }
    }

    /// Check that the window is well formed.
    pub fn validate(&self) -> AppResult<()> {
        if self.name.is_empty() {
            return Err(AcqError::Configuration("Segment name must not be empty".into()));
        }
        if !self.start_ms.is_finite() || !self.stop_ms.is_finite() {
            return Err(AcqError::Configuration(format!(
                "Segment '{}' has a non-finite window",
                self.name
            )));
        }
        if self.start_ms < 0.0 || self.stop_ms <= self.start_ms {
            return Err(AcqError::Configuration(format!(
                "Segment '{}' window [{}, {}) ms is invalid",
                self.name, self.start_ms, self.stop_ms
            )));
        }
        Ok(())
    }

    /// Sample window for a channel with the given sample period in seconds.
    pub fn window(&self, sample_period: f64) -> SegmentWindow {
        SegmentWindow {
            start: ms_to_index(self.start_ms, sample_period),
            stop: ms_to_index(self.stop_ms, sample_period),
            sample_period,
        }
    }
}

/// Sample-index window of a segment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentWindow {
    /// First sample index (inclusive).
    pub start: usize,
    /// Last sample index (exclusive).
    pub stop: usize,
    /// Sample period in seconds.
    pub sample_period: f64,
}

impl SegmentWindow {
    /// Time of the first sample in seconds.
    pub fn x0(&self) -> f64 {
        self.start as f64 * self.sample_period
    }

    /// Spacing between samples in seconds.
    pub fn dx(&self) -> f64 {
        self.sample_period
    }

    /// Number of samples in the window.
    pub fn len(&self) -> usize {
        self.stop.saturating_sub(self.start)
    }

    /// Whether the window selects no samples.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slice `data` to this window, clipped to the available samples.
    pub fn slice<'a, T>(&self, data: &'a [T]) -> &'a [T] {
        let stop = self.stop.min(data.len());
        let start = self.start.min(stop);
        &data[start..stop]
    }
}

fn ms_to_index(time_ms: f64, sample_period: f64) -> usize {
    (time_ms / 1e3 / sample_period).round().max(0.0) as usize
}

/// Samples of one segment cut from a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentSlice<'a> {
    /// Segment definition.
    pub segment: &'a Segment,
    /// Index window the samples were cut with.
    pub window: SegmentWindow,
    /// Samples inside the window.
    pub samples: &'a [i16],
}

/// Cut every segment out of a channel's samples.
pub fn extract<'a>(
    segments: &'a [Segment],
    samples: &'a [i16],
    sample_rate_hz: f64,
) -> Vec<SegmentSlice<'a>> {
    let sample_period = 1.0 / sample_rate_hz;
    segments
        .iter()
        .map(|segment| {
            let window = segment.window(sample_period);
            SegmentSlice {
                segment,
                window,
                samples: window.slice(samples),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_rounds_to_nearest_sample() {
        // 2 MHz: 0.5 us per sample.
        let window = Segment::new("probe", 0.10, 1.2).window(1.0 / 2e6);
        assert_eq!(window.start, 200);
        assert_eq!(window.stop, 2400);
        assert_eq!(window.len(), 2200);
        assert!((window.x0() - 1e-4).abs() < 1e-15);
        assert_eq!(window.dx(), 5e-7);
    }

    #[test]
    fn slice_length_matches_rounded_bounds() {
        let rate = 3e6;
        let period = 1.0 / rate;
        let samples: Vec<i16> = (0..30_000).map(|i| (i % 1000) as i16).collect();
        let segments = vec![Segment::new("a", 0.3337, 4.1234), Segment::new("b", 1.0, 9.99)];

        for slice in extract(&segments, &samples, rate) {
            let imin = (slice.segment.start_ms / 1000.0 / period).round() as usize;
            let imax = (slice.segment.stop_ms / 1000.0 / period).round() as usize;
            assert_eq!(slice.samples.len(), imax - imin);
            assert_eq!(slice.window.x0(), imin as f64 * period);
            assert_eq!(slice.samples[0], samples[imin]);
        }
    }

    #[test]
    fn slice_is_clipped_to_record() {
        let samples = vec![1_i16; 100];
        let segment = Segment::new("late", 0.0, 1.0);
        let slices = extract(std::slice::from_ref(&segment), &samples, 1e6);
        assert_eq!(slices[0].window.stop, 1000);
        assert_eq!(slices[0].samples.len(), 100);

        let beyond = Segment::new("beyond", 0.5, 1.0);
        let slices = extract(std::slice::from_ref(&beyond), &samples, 1e6);
        assert!(slices[0].samples.is_empty());
    }

    #[test]
    fn validate_rejects_bad_windows() {
        assert!(Segment::new("ok", 0.0, 1.0).validate().is_ok());
        assert!(Segment::new("", 0.0, 1.0).validate().is_err());
        assert!(Segment::new("neg", -1.0, 1.0).validate().is_err());
        assert!(Segment::new("empty", 1.0, 1.0).validate().is_err());
        assert!(Segment::new("nan", f64::NAN, 1.0).validate().is_err());
    }
}
