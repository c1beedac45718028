//! Trigger sequence tracking.
//!
//! An [`Iteration`] follows one pass through a [`TriggerPattern`]. Captures are
//! offered in arrival order and classified against the next expected trigger
//! by elapsed time since the last accepted trigger:
//!
//! - too early (more than `tolerance` before the deadline): an extra trigger,
//!   rejected without touching any state;
//! - too late on any step but the first: one or more triggers were missed. The
//!   capture is re-checked against the following steps, and if it runs past
//!   the end of the pattern it becomes trigger 0 of the next iteration;
//! - otherwise it is the expected trigger.
//!
//! Completion is signalled by returning a fresh [`Iteration`] that carries the
//! last trigger timestamp forward, so the owner can flush the finished one and
//! adopt its successor. The same hand-off happens from
//! [`Iteration::check_timeout`] when the final trigger never arrives.
//!
//! Sequence anomalies are logged with `warn!`; they are not errors.

use chrono::{DateTime, TimeDelta, Utc};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::capture::Capture;
use crate::pattern::{TriggerPattern, TriggerStep};

/// Default timing tolerance around each expected trigger.
pub fn default_tolerance() -> TimeDelta {
    TimeDelta::seconds(2)
}

/// Classification of a capture against the expected trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detection {
    /// Arrived too early for the expected trigger; dropped.
    Extra,
    /// Accepted as trigger `index` after `missed` skipped triggers.
    Matched {
        /// Trigger index the capture was stored under.
        index: usize,
        /// Number of expected triggers skipped before it.
        missed: usize,
    },
    /// Arrived after the end of the pattern; first trigger of the next
    /// iteration.
    NextIteration {
        /// Number of triggers missed at the end of this iteration.
        missed: usize,
    },
}

/// Result of offering a capture to an iteration.
#[derive(Debug)]
pub struct CaptureOutcome {
    /// How the capture was classified.
    pub detection: Detection,
    /// Successor iteration, when this one completed or was overrun.
    pub next_iteration: Option<Iteration>,
}

impl CaptureOutcome {
    /// Trigger index the capture was stored under, if it was kept.
    pub fn trigger_index(&self) -> Option<usize> {
        match self.detection {
            Detection::Extra => None,
            Detection::Matched { index, .. } => Some(index),
            Detection::NextIteration { .. } => Some(0),
        }
    }
}

/// A capture was offered to an iteration that already holds every trigger.
#[derive(Debug, Error)]
#[error("Iteration already complete")]
pub struct IterationComplete(pub Capture);

/// One pass through the trigger pattern.
#[derive(Debug, Clone)]
pub struct Iteration {
    pattern: TriggerPattern,
    captures: BTreeMap<usize, Capture>,
    cursor: usize,
    last_trigger: Option<DateTime<Utc>>,
}

impl Iteration {
    /// Start an iteration with no previous trigger.
    pub fn new(pattern: TriggerPattern) -> Self {
        Self::with_last_trigger(pattern, None)
    }

    /// Start an iteration timed from a previous trigger.
    pub fn with_last_trigger(pattern: TriggerPattern, last_trigger: Option<DateTime<Utc>>) -> Self {
        Self {
            pattern,
            captures: BTreeMap::new(),
            cursor: 0,
            last_trigger,
        }
    }

    /// Pattern this iteration follows.
    pub fn pattern(&self) -> &TriggerPattern {
        &self.pattern
    }

    /// Index of the next expected trigger; equals the pattern length once
    /// complete.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Timestamp of the last accepted (or presumed) trigger.
    pub fn last_trigger(&self) -> Option<DateTime<Utc>> {
        self.last_trigger
    }

    /// Stored captures by trigger index. Missed triggers are absent.
    pub fn captures(&self) -> &BTreeMap<usize, Capture> {
        &self.captures
    }

    /// Capture stored for `index`.
    pub fn capture(&self, index: usize) -> Option<&Capture> {
        self.captures.get(&index)
    }

    /// Whether every trigger has been accepted or given up on.
    pub fn is_complete(&self) -> bool {
        self.cursor >= self.pattern.len()
    }

    /// Whether no capture has been stored.
    pub fn is_empty(&self) -> bool {
        self.captures.is_empty()
    }

    /// Take ownership of the stored captures.
    pub fn into_captures(self) -> BTreeMap<usize, Capture> {
        self.captures
    }

    /// Offer the next capture in arrival order.
    ///
    /// Returns the capture back inside [`IterationComplete`] if this iteration
    /// no longer accepts captures.
    pub fn capture_trigger(
        &mut self,
        capture: Capture,
        tolerance: TimeDelta,
    ) -> Result<CaptureOutcome, IterationComplete> {
        if self.is_complete() {
            return Err(IterationComplete(capture));
        }

        let timestamp = capture.timestamp();
        let detection = self.check_trigger(self.cursor, timestamp, tolerance);

        let next_iteration = match detection {
            Detection::Extra => {
                warn!(
                    trigger = self.cursor,
                    label = %self.pattern[self.cursor].label,
                    %timestamp,
                    "Extra trigger, ignoring capture"
                );
                None
            }
            Detection::NextIteration { missed } => {
                warn!(
                    trigger = self.cursor,
                    missed,
                    %timestamp,
                    "Missed trigger, capture starts the next iteration"
                );
                let mut next = Self::with_last_trigger(self.pattern.clone(), Some(timestamp));
                next.captures.insert(0, capture);
                next.cursor = 1;
                Some(next)
            }
            Detection::Matched { index, missed } => {
                if missed > 0 {
                    warn!(
                        trigger = self.cursor,
                        label = %self.pattern[self.cursor].label,
                        missed,
                        %timestamp,
                        "Missed trigger"
                    );
                }
                debug!(
                    trigger = index,
                    label = %self.pattern[index].label,
                    %timestamp,
                    "Accepted trigger"
                );
                self.captures.insert(index, capture);
                self.last_trigger = Some(timestamp);
                self.cursor = index + 1;

                self.is_complete()
                    .then(|| Self::with_last_trigger(self.pattern.clone(), self.last_trigger))
            }
        };

        Ok(CaptureOutcome {
            detection,
            next_iteration,
        })
    }

    /// Classify a capture at `timestamp` against trigger `expected`.
    ///
    /// Pure: the caller commits the new state only on acceptance. Each pass
    /// through the loop advances `expected`, so it runs at most N times.
    fn check_trigger(
        &self,
        mut expected: usize,
        timestamp: DateTime<Utc>,
        tolerance: TimeDelta,
    ) -> Detection {
        let first = expected;
        let n = self.pattern.len();
        let Some(mut last) = self.last_trigger else {
            return Detection::Matched {
                index: expected,
                missed: 0,
            };
        };

        loop {
            let step = &self.pattern[expected];
            let Some(deadline) = deadline_after(last, step) else {
                break;
            };
            let error = timestamp - deadline;
            if error < -tolerance {
                return Detection::Extra;
            }
            if error <= tolerance || expected == 0 {
                break;
            }
            if expected >= n - 1 {
                return Detection::NextIteration {
                    missed: n - first,
                };
            }
            last = deadline;
            expected += 1;
        }

        Detection::Matched {
            index: expected,
            missed: expected - first,
        }
    }

    /// Give up on triggers whose deadline passed more than `tolerance` ago.
    ///
    /// Stops at the first step without a timeout and never runs before the
    /// first trigger of the iteration. Returns the successor iteration if
    /// every remaining trigger was given up on.
    pub fn check_timeout(&mut self, now: DateTime<Utc>, tolerance: TimeDelta) -> Option<Iteration> {
        let mut last = self.last_trigger?;
        let n = self.pattern.len();

        while self.cursor < n && self.cursor != 0 {
            let step = &self.pattern[self.cursor];
            let Some(deadline) = deadline_after(last, step) else {
                break;
            };
            if now - deadline <= tolerance {
                break;
            }

            warn!(
                trigger = self.cursor,
                label = %step.label,
                expected = %deadline,
                %now,
                "Missed trigger"
            );
            last = deadline;
            self.last_trigger = Some(last);
            self.cursor += 1;

            if self.cursor >= n {
                return Some(Self::with_last_trigger(self.pattern.clone(), Some(last)));
            }
        }
        None
    }

    /// Time left before the next expected trigger is declared missed.
    ///
    /// `None` when no deadline applies: before any trigger, at the start of
    /// the pattern, on an untimed step, or once complete. Negative once the
    /// deadline has passed but [`check_timeout`](Self::check_timeout) has not
    /// run yet.
    pub fn time_until_timeout(&self, now: DateTime<Utc>, tolerance: TimeDelta) -> Option<TimeDelta> {
        let last = self.last_trigger?;
        if self.cursor == 0 || self.is_complete() {
            return None;
        }
        let deadline = deadline_after(last, &self.pattern[self.cursor])?;
        Some(deadline - now + tolerance)
    }
}

/// When `step` is due after a trigger at `last`; `None` for an untimed step
/// or a deadline past the end of the calendar.
fn deadline_after(last: DateTime<Utc>, step: &TriggerStep) -> Option<DateTime<Utc>> {
    if step.is_untimed() {
        return None;
    }
    last.checked_add_signed(step.timeout())
}
