//! Trigger patterns.
//!
//! A [`TriggerPattern`] is the ordered list of triggers that make up one
//! iteration of the experiment, each with the delay expected since the
//! previous trigger. The pattern is fixed for a run and shared read-only by
//! every [`Iteration`](crate::iteration::Iteration) derived from it, so it is
//! reference counted rather than cloned per iteration.

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use std::ops::Index;
use std::sync::Arc;

use crate::error::{AcqError, AppResult};

/// Longest accepted delay between two triggers (one week).
pub const MAX_TIMEOUT_SECS: f64 = 7.0 * 86_400.0;

/// One expected trigger in a pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerStep {
    /// Label used as a prefix for dataset and timestamp names. May be empty.
    pub label: String,
    /// Expected delay since the previous trigger, in seconds. Zero disables
    /// timing checks for this step.
    pub timeout_secs: f64,
}

impl TriggerStep {
    /// Create a new step.
    pub fn new(label: impl Into<String>, timeout_secs: f64) -> Self {
        Self {
            label: label.into(),
            timeout_secs,
        }
    }

    /// Whether this step accepts any capture regardless of timing.
    pub fn is_untimed(&self) -> bool {
        self.timeout_secs == 0.0
    }

    /// Expected delay as a chrono duration, rounded to the microsecond.
    pub fn timeout(&self) -> TimeDelta {
        secs_to_delta(self.timeout_secs)
    }

    /// Name of a field derived from this step's label.
    ///
    /// `("load", "timestamp")` becomes `load_timestamp`; an empty label leaves
    /// the field name unchanged.
    pub fn field_name(&self, field: &str) -> String {
        if self.label.is_empty() {
            field.to_string()
        } else {
            format!("{}_{}", self.label, field)
        }
    }
}

/// Ordered, shared sequence of expected triggers.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerPattern {
    steps: Arc<[TriggerStep]>,
}

impl TriggerPattern {
    /// Build a pattern, rejecting empty patterns and invalid timeouts.
    pub fn new(steps: Vec<TriggerStep>) -> AppResult<Self> {
        if steps.is_empty() {
            return Err(AcqError::Configuration(
                "Trigger pattern must contain at least one trigger".into(),
            ));
        }
        for (idx, step) in steps.iter().enumerate() {
            if !step.timeout_secs.is_finite() || step.timeout_secs < 0.0 {
                return Err(AcqError::Configuration(format!(
                    "Trigger {} ('{}') has invalid timeout {}",
                    idx, step.label, step.timeout_secs
                )));
            }
            if step.timeout_secs > MAX_TIMEOUT_SECS {
                return Err(AcqError::Configuration(format!(
                    "Trigger {} ('{}') timeout {} s exceeds the maximum of {} s",
                    idx, step.label, step.timeout_secs, MAX_TIMEOUT_SECS
                )));
            }
        }
        Ok(Self {
            steps: steps.into(),
        })
    }

    /// Number of triggers in one iteration.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Always false for a constructed pattern; provided for API symmetry.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Step at `index`, if any.
    pub fn get(&self, index: usize) -> Option<&TriggerStep> {
        self.steps.get(index)
    }

    /// Iterate over the steps in order.
    pub fn iter(&self) -> impl Iterator<Item = &TriggerStep> {
        self.steps.iter()
    }

    /// Whether two patterns share the same backing storage.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.steps, &other.steps)
    }
}

impl Index<usize> for TriggerPattern {
    type Output = TriggerStep;

    fn index(&self, index: usize) -> &Self::Output {
        &self.steps[index]
    }
}

/// Convert fractional seconds into a chrono duration with microsecond precision.
pub(crate) fn secs_to_delta(secs: f64) -> TimeDelta {
    TimeDelta::microseconds((secs * 1e6).round() as i64)
}

/// Convert a chrono duration into fractional seconds.
pub(crate) fn delta_to_secs(delta: TimeDelta) -> f64 {
    match delta.num_microseconds() {
        Some(us) => us as f64 / 1e6,
        None => delta.num_milliseconds() as f64 / 1e3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_pattern() {
        assert!(TriggerPattern::new(vec![]).is_err());
    }

    #[test]
    fn rejects_negative_timeout() {
        let result = TriggerPattern::new(vec![TriggerStep::new("a", -1.0)]);
        assert!(matches!(result, Err(AcqError::Configuration(_))));
    }

    #[test]
    fn rejects_timeout_beyond_maximum() {
        let result =
            TriggerPattern::new(vec![TriggerStep::new("a", 0.0), TriggerStep::new("b", 1e13)]);
        assert!(matches!(result, Err(AcqError::Configuration(_))));
        assert!(TriggerPattern::new(vec![TriggerStep::new("a", MAX_TIMEOUT_SECS)]).is_ok());
    }

    #[test]
    fn rejects_nan_timeout() {
        assert!(TriggerPattern::new(vec![TriggerStep::new("a", f64::NAN)]).is_err());
    }

    #[test]
    fn clones_share_steps() {
        let pattern =
            TriggerPattern::new(vec![TriggerStep::new("A", 0.0), TriggerStep::new("B", 5.0)])
                .unwrap();
        let copy = pattern.clone();
        assert!(pattern.ptr_eq(&copy));
        assert_eq!(copy.len(), 2);
        assert_eq!(copy[1].label, "B");
    }

    #[test]
    fn field_names_use_label_prefix() {
        assert_eq!(TriggerStep::new("load", 0.0).field_name("timestamp"), "load_timestamp");
        assert_eq!(TriggerStep::new("", 0.0).field_name("timestamp"), "timestamp");
    }

    #[test]
    fn timeout_converts_to_microseconds() {
        let step = TriggerStep::new("x", 2.5);
        assert_eq!(step.timeout(), TimeDelta::milliseconds(2500));
        assert!(!step.is_untimed());
        assert!(TriggerStep::new("y", 0.0).is_untimed());
        assert_eq!(delta_to_secs(TimeDelta::milliseconds(-1500)), -1.5);
    }
}
