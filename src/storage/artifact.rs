//! In-memory iteration artifact and the output builder.
//!
//! The artifact mirrors the on-disk container layout shared by every storage
//! backend:
//!
//! ```text
//! /                          board_type, trigger_slope, trigger_level,
//! │                          trigger_coupling, trigger_gain,
//! │                          <label>_timestamp (one per captured trigger)
//! ├── ch1/                   input_range, dc_offset, sample_res,
//! │   │                      sample_offset, input_coupling, input_impedance
//! │   ├── <label>_<segment>  i16 samples, attributes x0 and dx
//! │   └── ...
//! └── ch2/ ...
//! ```

use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::capture::Capture;
use crate::error::{AcqError, AppResult};
use crate::iteration::Iteration;
use crate::pattern::TriggerPattern;
use crate::segment;

/// Scalar attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    /// Integer attribute.
    Int(i64),
    /// Floating point attribute.
    Float(f64),
    /// String attribute.
    Text(String),
}

impl AttrValue {
    /// Integer value, if this is an integer attribute.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttrValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// String value, if this is a text attribute.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttrValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl std::fmt::Display for AttrValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttrValue::Int(v) => write!(f, "{v}"),
            AttrValue::Float(v) => write!(f, "{v}"),
            AttrValue::Text(v) => write!(f, "{v}"),
        }
    }
}

/// Samples of one segment of one trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentDataset {
    /// Time of the first sample relative to the trigger, in seconds.
    pub x0: f64,
    /// Sample spacing in seconds.
    pub dx: f64,
    /// Raw ADC samples.
    pub data: Vec<i16>,
}

/// One channel's attributes and datasets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelGroup {
    /// Front-end attributes.
    pub attributes: BTreeMap<String, AttrValue>,
    /// Datasets by name.
    pub datasets: BTreeMap<String, SegmentDataset>,
}

/// Structured output of one iteration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IterationArtifact {
    /// Run-level attributes.
    pub attributes: BTreeMap<String, AttrValue>,
    /// Channel groups by name (`ch<id>`).
    pub channels: BTreeMap<String, ChannelGroup>,
}

impl IterationArtifact {
    /// Build the artifact of a (possibly partial) iteration.
    pub fn from_iteration(iteration: &Iteration) -> AppResult<Self> {
        Self::build(iteration.pattern(), iteration.captures())
    }

    /// Build an artifact from captures keyed by trigger index.
    ///
    /// Missing trigger indices are skipped. Global attributes come from the
    /// lowest captured trigger index, normally trigger 0.
    ///
    /// # Errors
    ///
    /// [`AcqError::EmptyIteration`] without captures, and
    /// [`AcqError::Configuration`] if two triggers would produce the same
    /// dataset name.
    pub fn build(pattern: &TriggerPattern, captures: &BTreeMap<usize, Capture>) -> AppResult<Self> {
        let (_, first) = captures
            .first_key_value()
            .ok_or(AcqError::EmptyIteration)?;

        let mut artifact = Self::default();
        artifact.set_global_attributes(first);

        for (&index, capture) in captures {
            let step = pattern.get(index).ok_or_else(|| {
                AcqError::Configuration(format!(
                    "Capture for trigger {} outside a pattern of {} triggers",
                    index,
                    pattern.len()
                ))
            })?;

            let timestamp = capture
                .timestamp()
                .to_rfc3339_opts(SecondsFormat::Micros, true);
            artifact
                .attributes
                .insert(step.field_name("timestamp"), AttrValue::Text(timestamp));

            for channel in capture.channels() {
                if channel.config.segments.is_empty() {
                    continue;
                }

                let group = artifact
                    .channels
                    .entry(channel.config.group_name())
                    .or_insert_with(|| ChannelGroup {
                        attributes: channel_attributes(capture, channel.config.id),
                        datasets: BTreeMap::new(),
                    });

                let slices = segment::extract(
                    &channel.config.segments,
                    &channel.samples,
                    channel.sample_rate_hz,
                );
                for slice in slices {
                    let name = step.field_name(&slice.segment.name);
                    if group.datasets.contains_key(&name) {
                        return Err(AcqError::Configuration(format!(
                            "Dataset '{}' in {} is produced by more than one trigger",
                            name,
                            channel.config.group_name()
                        )));
                    }
                    group.datasets.insert(
                        name,
                        SegmentDataset {
                            x0: slice.window.x0(),
                            dx: slice.window.dx(),
                            data: slice.samples.to_vec(),
                        },
                    );
                }
            }
        }

        Ok(artifact)
    }

    fn set_global_attributes(&mut self, capture: &Capture) {
        let trigger = capture.trigger();
        let attrs = [
            ("board_type", i64::from(capture.board().board_type)),
            ("trigger_slope", trigger.slope.code()),
            ("trigger_level", i64::from(trigger.level_percent)),
            ("trigger_coupling", trigger.coupling.code()),
            ("trigger_gain", i64::from(trigger.range_mvpp)),
        ];
        for (name, value) in attrs {
            self.attributes.insert(name.to_string(), AttrValue::Int(value));
        }
    }

    /// Total number of datasets across channels.
    pub fn dataset_count(&self) -> usize {
        self.channels.values().map(|group| group.datasets.len()).sum()
    }
}

fn channel_attributes(capture: &Capture, channel: u16) -> BTreeMap<String, AttrValue> {
    let mut attrs = BTreeMap::new();
    let acquisition = capture.acquisition();
    attrs.insert(
        "sample_res".to_string(),
        AttrValue::Int(i64::from(acquisition.sample_res)),
    );
    attrs.insert(
        "sample_offset".to_string(),
        AttrValue::Int(i64::from(acquisition.sample_offset)),
    );
    if let Some(ch) = capture.channel(channel) {
        let snapshot = &ch.snapshot;
        attrs.insert(
            "input_range".to_string(),
            AttrValue::Int(i64::from(snapshot.input_range_mvpp)),
        );
        attrs.insert(
            "dc_offset".to_string(),
            AttrValue::Int(i64::from(snapshot.dc_offset)),
        );
        attrs.insert(
            "input_coupling".to_string(),
            AttrValue::Int(snapshot.coupling.code()),
        );
        attrs.insert(
            "input_impedance".to_string(),
            AttrValue::Int(i64::from(snapshot.impedance_ohms)),
        );
    }
    attrs
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::capture::ChannelCapture;
    use crate::config::ChannelConfig;
    use crate::driver::{AcquisitionInfo, BoardInfo, ChannelSnapshot, Coupling, Slope, TriggerSetup};
    use crate::pattern::TriggerStep;
    use crate::segment::Segment;
    use chrono::{DateTime, TimeDelta, TimeZone, Utc};
    use std::sync::Arc;

    pub(crate) fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    pub(crate) fn test_pattern() -> TriggerPattern {
        TriggerPattern::new(vec![TriggerStep::new("load", 0.0), TriggerStep::new("probe", 5.0)])
            .unwrap()
    }

    pub(crate) fn test_channels() -> Vec<Arc<ChannelConfig>> {
        vec![
            Arc::new(
                ChannelConfig::new(1, 2000)
                    .with_segment(Segment::new("early", 0.0, 0.1))
                    .with_segment(Segment::new("late", 0.25, 0.4)),
            ),
            Arc::new(ChannelConfig::new(2, 400).with_segment(Segment::new("all", 0.0, 0.5))),
            Arc::new(ChannelConfig::new(3, 1000)),
        ]
    }

    /// Capture at `secs` after [`start`] with a ramp on every channel.
    pub(crate) fn test_capture(secs: i64, channels: &[Arc<ChannelConfig>]) -> Capture {
        let depth = 500;
        Capture::new(
            start() + TimeDelta::seconds(secs),
            BoardInfo {
                board_type: 0x24,
                name: "test".into(),
            },
            AcquisitionInfo {
                sample_rate_hz: 1e6,
                sample_res: -8192,
                sample_offset: -1,
                sample_bits: 14,
                depth,
            },
            TriggerSetup {
                slope: Slope::Falling,
                level_percent: 25,
                ..TriggerSetup::default()
            },
            channels.iter().map(|config| ChannelCapture {
                config: Arc::clone(config),
                snapshot: ChannelSnapshot {
                    channel: config.id,
                    input_range_mvpp: config.input_range_mvpp,
                    dc_offset: 3,
                    coupling: Coupling::Ac,
                    impedance_ohms: 50,
                },
                samples: (0..depth)
                    .map(|i| (i as i16 + secs as i16 * 1000) * (config.id as i16))
                    .collect(),
                sample_rate_hz: 1e6,
            }),
        )
    }

    pub(crate) fn test_artifact() -> IterationArtifact {
        let channels = test_channels();
        let captures = BTreeMap::from([
            (0, test_capture(0, &channels)),
            (1, test_capture(5, &channels)),
        ]);
        IterationArtifact::build(&test_pattern(), &captures).unwrap()
    }

    #[test]
    fn global_attributes_follow_first_capture() {
        let artifact = test_artifact();
        assert_eq!(artifact.attributes["board_type"], AttrValue::Int(0x24));
        assert_eq!(artifact.attributes["trigger_slope"], AttrValue::Int(2));
        assert_eq!(artifact.attributes["trigger_level"], AttrValue::Int(25));
        assert_eq!(artifact.attributes["trigger_gain"], AttrValue::Int(10_000));
        assert_eq!(
            artifact.attributes["load_timestamp"].as_text(),
            Some("2024-03-01T12:00:00.000000Z")
        );
        assert_eq!(
            artifact.attributes["probe_timestamp"].as_text(),
            Some("2024-03-01T12:00:05.000000Z")
        );
    }

    #[test]
    fn channel_groups_hold_segments_per_trigger() {
        let artifact = test_artifact();

        // Channel 3 has no segments.
        assert_eq!(
            artifact.channels.keys().collect::<Vec<_>>(),
            ["ch1", "ch2"]
        );
        assert_eq!(artifact.dataset_count(), 6);

        let ch1 = &artifact.channels["ch1"];
        assert_eq!(ch1.attributes["input_range"], AttrValue::Int(2000));
        assert_eq!(ch1.attributes["dc_offset"], AttrValue::Int(3));
        assert_eq!(ch1.attributes["sample_res"], AttrValue::Int(-8192));
        assert_eq!(ch1.attributes["sample_offset"], AttrValue::Int(-1));
        assert_eq!(ch1.attributes["input_coupling"], AttrValue::Int(2));
        assert_eq!(ch1.attributes["input_impedance"], AttrValue::Int(50));

        let late = &ch1.datasets["probe_late"];
        assert_eq!(late.data.len(), 150);
        assert_eq!(late.data[0], 5250);
        assert!((late.x0 - 250e-6).abs() < 1e-15);
        assert_eq!(late.dx, 1e-6);
    }

    #[test]
    fn missing_triggers_give_partial_output() {
        let channels = test_channels();
        let captures = BTreeMap::from([(1, test_capture(5, &channels))]);

        let artifact = IterationArtifact::build(&test_pattern(), &captures).unwrap();

        assert!(artifact.attributes.contains_key("probe_timestamp"));
        assert!(!artifact.attributes.contains_key("load_timestamp"));
        assert!(artifact.channels["ch1"].datasets.contains_key("probe_early"));
        assert!(!artifact.channels["ch1"].datasets.contains_key("load_early"));
    }

    #[test]
    fn empty_iteration_is_an_error() {
        let result = IterationArtifact::from_iteration(&Iteration::new(test_pattern()));
        assert!(matches!(result, Err(AcqError::EmptyIteration)));
    }

    #[test]
    fn duplicate_labels_fail_the_write() {
        let pattern =
            TriggerPattern::new(vec![TriggerStep::new("", 0.0), TriggerStep::new("", 1.0)])
                .unwrap();
        let channels = test_channels();
        let captures = BTreeMap::from([
            (0, test_capture(0, &channels)),
            (1, test_capture(1, &channels)),
        ]);

        let result = IterationArtifact::build(&pattern, &captures);
        assert!(matches!(result, Err(AcqError::Configuration(_))));
    }

    #[test]
    fn resampled_channel_uses_effective_period() {
        let channels = test_channels();
        let mut capture = test_capture(0, &channels);
        for channel in capture.channels_mut() {
            channel.samples.truncate(100);
            channel.sample_rate_hz = 2e5;
        }
        let captures = BTreeMap::from([(0, capture)]);

        let artifact = IterationArtifact::build(&test_pattern(), &captures).unwrap();

        let late = &artifact.channels["ch1"].datasets["load_late"];
        assert_eq!(late.data.len(), 30);
        assert_eq!(late.dx, 5e-6);
        assert!((late.x0 - 250e-6).abs() < 1e-15);
    }
}
