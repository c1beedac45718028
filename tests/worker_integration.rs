//! End-to-end acquisition tests against the mock digitizer.
//!
//! Timestamps come from a `ManualClock`, so every trigger lands at an exact
//! offset from the run start and timeout handling only happens when a test
//! moves the clock.

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use gage_acquire::clock::ManualClock;
use gage_acquire::config::AcquireConfig;
use gage_acquire::data::decimate::ButterworthDecimator;
use gage_acquire::driver::mock::MockDigitizer;
use gage_acquire::messages::{CaptureReport, RunPlan, RunStatus, WorkerEvent};
use gage_acquire::storage::json::JsonArtifactWriter;
use gage_acquire::storage::{ArtifactWriter, IterationArtifact};
use gage_acquire::{AcqError, AcquisitionWorker, Detection, WorkerHandle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

fn create_test_config(root: &Path) -> AcquireConfig {
    let toml_str = r#"
        [application]
        name = "Gage Acquire Test"
        log_level = "debug"

        [acquisition]
        sample_rate_hz = 1e6

        [worker]
        poll_interval = "1h"
        tolerance = "2s"

        [storage]
        data_root = "unused"
        run_name = "run0"

        [[triggers]]
        label = "load"
        timeout_secs = 0.0

        [[triggers]]
        label = "probe"
        timeout_secs = 5.0

        [[triggers]]
        label = "reference"
        timeout_secs = 5.0

        [[channels]]
        id = 1
        input_range_mvpp = 2000

        [[channels.segments]]
        name = "early"
        start_ms = 0.0
        stop_ms = 0.04

        [[channels.segments]]
        name = "late"
        start_ms = 0.06
        stop_ms = 0.1

        [[channels]]
        id = 2
        input_range_mvpp = 400
    "#;
    let mut config: AcquireConfig = toml::from_str(toml_str).expect("Failed to parse test config");
    config.storage.data_root = root.to_path_buf();
    config
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

struct Harness {
    scope: Arc<MockDigitizer>,
    clock: Arc<ManualClock>,
    handle: WorkerHandle,
    events: broadcast::Receiver<WorkerEvent>,
    plan: RunPlan,
    task: JoinHandle<()>,
    _root: TempDir,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(|_| {})
    }

    fn with_config(adjust: impl FnOnce(&mut AcquireConfig)) -> Self {
        let root = tempfile::tempdir().unwrap();
        let mut config = create_test_config(root.path());
        adjust(&mut config);
        config.validate().unwrap();

        let plan = RunPlan::from_config(&config).unwrap();
        let scope = Arc::new(MockDigitizer::new());
        let clock = Arc::new(ManualClock::new(start()));
        let (handle, task) = AcquisitionWorker::spawn(
            config,
            scope.clone(),
            clock.clone(),
            Arc::new(ButterworthDecimator::new()),
        );
        let events = handle.subscribe();

        Self {
            scope,
            clock,
            handle,
            events,
            plan,
            task,
            _root: root,
        }
    }

    async fn start_run(&self) -> PathBuf {
        self.handle.start_run(self.plan.clone()).await.unwrap()
    }

    /// Wait for the board to be armed, then fire a trigger `secs` after start.
    async fn trigger_at(&self, secs: i64) {
        tokio::time::timeout(EVENT_TIMEOUT, async {
            while !self.scope.is_armed() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("digitizer was never re-armed");

        self.clock.set(start() + TimeDelta::seconds(secs));
        assert!(self.scope.fire_trigger());
    }

    async fn next_event<T>(&mut self, mut select: impl FnMut(WorkerEvent) -> Option<T>) -> T {
        tokio::time::timeout(EVENT_TIMEOUT, async {
            loop {
                match self.events.recv().await {
                    Ok(event) => {
                        if let Some(value) = select(event) {
                            return value;
                        }
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => panic!("worker event channel closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for worker event")
    }

    async fn next_capture(&mut self) -> Arc<CaptureReport> {
        self.next_event(|event| match event {
            WorkerEvent::CaptureProcessed(report) => Some(report),
            _ => None,
        })
        .await
    }

    async fn next_artifact(&mut self) -> (u32, PathBuf) {
        self.next_event(|event| match event {
            WorkerEvent::ArtifactWritten { path, file_number } => Some((file_number, path)),
            WorkerEvent::ArtifactFailed { error, .. } => panic!("artifact failed: {error}"),
            _ => None,
        })
        .await
    }

    async fn shutdown(self) {
        self.handle.shutdown().await.unwrap();
        tokio::time::timeout(EVENT_TIMEOUT, self.task)
            .await
            .expect("worker did not exit")
            .unwrap();
    }
}

fn read_artifact(path: &Path) -> IterationArtifact {
    JsonArtifactWriter.read(path).unwrap()
}

fn artifact_files(dir: &Path) -> Vec<PathBuf> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries.map(|entry| entry.unwrap().path()).collect(),
        Err(_) => Vec::new(),
    }
}

#[tokio::test]
async fn test_full_iteration_is_written() {
    let mut h = Harness::new();
    let dir = h.start_run().await;
    assert!(dir.ends_with("2024/03/01/data/run0/gagescope"));
    assert_eq!(h.handle.status().await.unwrap(), RunStatus::Acquiring);

    h.trigger_at(0).await;
    let report = h.next_capture().await;
    assert_eq!(report.detection, Detection::Matched { index: 0, missed: 0 });
    assert_eq!(report.label.as_deref(), Some("load"));
    assert_eq!(report.series.len(), 2);
    assert_eq!(report.next_timeout, Some(TimeDelta::seconds(7)));

    h.trigger_at(5).await;
    assert_eq!(
        h.next_capture().await.detection,
        Detection::Matched { index: 1, missed: 0 }
    );

    h.trigger_at(10).await;
    let report = h.next_capture().await;
    assert_eq!(report.detection, Detection::Matched { index: 2, missed: 0 });
    // The successor has no captures yet, so nothing is pending.
    assert_eq!(report.next_timeout, None);

    let (file_number, path) = h.next_artifact().await;
    assert_eq!(file_number, 0);
    assert_eq!(path, dir.join("iteration_00000.json"));

    let artifact = read_artifact(&path);
    assert_eq!(
        artifact.attributes["load_timestamp"].as_text(),
        Some("2024-03-01T12:00:00.000000Z")
    );
    assert_eq!(
        artifact.attributes["reference_timestamp"].as_text(),
        Some("2024-03-01T12:00:10.000000Z")
    );
    // Channel 2 has no segments and gets no group.
    assert_eq!(artifact.channels.keys().collect::<Vec<_>>(), ["ch1"]);
    let ch1 = &artifact.channels["ch1"];
    assert_eq!(ch1.datasets.len(), 6);
    assert_eq!(ch1.datasets["probe_early"].data.len(), 40);
    assert!((ch1.datasets["probe_late"].x0 - 60e-6).abs() < 1e-12);

    h.handle.stop_run().await.unwrap();
    assert_eq!(h.handle.status().await.unwrap(), RunStatus::Idle);
    h.shutdown().await;
}

#[tokio::test]
async fn test_extra_trigger_is_ignored() {
    let mut h = Harness::new();
    let dir = h.start_run().await;

    h.trigger_at(0).await;
    h.next_capture().await;

    h.trigger_at(1).await;
    let report = h.next_capture().await;
    assert_eq!(report.detection, Detection::Extra);
    assert_eq!(report.trigger_index, None);

    h.trigger_at(5).await;
    h.next_capture().await;
    h.trigger_at(10).await;
    h.next_capture().await;

    let (_, path) = h.next_artifact().await;
    let artifact = read_artifact(&path);
    assert_eq!(
        artifact.attributes["probe_timestamp"].as_text(),
        Some("2024-03-01T12:00:05.000000Z")
    );
    assert_eq!(artifact_files(&dir).len(), 1);

    h.handle.stop_run().await.unwrap();
    h.shutdown().await;
}

#[tokio::test]
async fn test_missed_trigger_skips_to_following_step() {
    let mut h = Harness::new();
    h.start_run().await;

    h.trigger_at(0).await;
    h.next_capture().await;

    h.trigger_at(11).await;
    let report = h.next_capture().await;
    assert!(matches!(report.detection, Detection::Matched { index: 2, .. }));
    assert_eq!(report.label.as_deref(), Some("reference"));

    let (_, path) = h.next_artifact().await;
    let artifact = read_artifact(&path);
    assert!(artifact.attributes.contains_key("load_timestamp"));
    assert!(!artifact.attributes.contains_key("probe_timestamp"));
    assert!(artifact.channels["ch1"].datasets.contains_key("reference_late"));
    assert!(!artifact.channels["ch1"].datasets.contains_key("probe_late"));

    h.handle.stop_run().await.unwrap();
    h.shutdown().await;
}

#[tokio::test]
async fn test_late_capture_starts_next_iteration() {
    let mut h = Harness::new();
    h.start_run().await;

    h.trigger_at(0).await;
    h.next_capture().await;

    h.trigger_at(30).await;
    let report = h.next_capture().await;
    assert_eq!(report.detection, Detection::NextIteration { missed: 2 });
    assert_eq!(report.trigger_index, Some(0));

    let (file_number, path) = h.next_artifact().await;
    assert_eq!(file_number, 0);
    let artifact = read_artifact(&path);
    assert_eq!(
        artifact.attributes["load_timestamp"].as_text(),
        Some("2024-03-01T12:00:00.000000Z")
    );

    // The late capture is trigger 0 of the new iteration.
    h.trigger_at(35).await;
    assert_eq!(
        h.next_capture().await.detection,
        Detection::Matched { index: 1, missed: 0 }
    );

    h.handle.stop_run().await.unwrap();
    h.shutdown().await;
}

#[tokio::test]
async fn test_timeout_flushes_iteration() {
    let mut h = Harness::with_config(|config| {
        config.worker.poll_interval = Duration::from_millis(10);
    });
    h.start_run().await;

    h.trigger_at(0).await;
    h.next_capture().await;

    // No more triggers: both remaining deadlines pass.
    h.clock.set(start() + TimeDelta::seconds(20));
    let (_, path) = h.next_artifact().await;
    let artifact = read_artifact(&path);
    assert!(artifact.attributes.contains_key("load_timestamp"));
    assert!(!artifact.attributes.contains_key("reference_timestamp"));

    // The successor starts fresh at trigger 0.
    h.trigger_at(21).await;
    assert_eq!(
        h.next_capture().await.detection,
        Detection::Matched { index: 0, missed: 0 }
    );

    h.handle.stop_run().await.unwrap();
    h.shutdown().await;
}

#[tokio::test]
async fn test_slow_download_is_not_timed_out() {
    let mut h = Harness::with_config(|config| {
        config.worker.poll_interval = Duration::from_millis(10);
    });
    let dir = h.start_run().await;

    h.trigger_at(0).await;
    h.next_capture().await;

    // Trigger 1 arrives on time, but its capture is still downloading when
    // the clock passes its deadline.
    h.scope.set_transfer_delay(Duration::from_millis(200));
    h.trigger_at(5).await;
    h.clock.set(start() + TimeDelta::milliseconds(7500));

    let report = h.next_capture().await;
    assert_eq!(report.timestamp, start() + TimeDelta::seconds(5));
    assert_eq!(report.detection, Detection::Matched { index: 1, missed: 0 });

    h.scope.set_transfer_delay(Duration::ZERO);
    h.trigger_at(10).await;
    assert_eq!(
        h.next_capture().await.detection,
        Detection::Matched { index: 2, missed: 0 }
    );

    let (_, path) = h.next_artifact().await;
    assert_eq!(path.parent(), Some(dir.as_path()));
    let artifact = read_artifact(&path);
    for field in ["load_timestamp", "probe_timestamp", "reference_timestamp"] {
        assert!(artifact.attributes.contains_key(field), "missing {field}");
    }

    h.handle.stop_run().await.unwrap();
    h.shutdown().await;
}

#[tokio::test]
async fn test_stop_discards_partial_iteration() {
    let mut h = Harness::new();
    let dir = h.start_run().await;

    h.trigger_at(0).await;
    h.next_capture().await;
    h.trigger_at(5).await;
    h.next_capture().await;

    h.handle.stop_run().await.unwrap();
    h.next_event(|event| matches!(event, WorkerEvent::RunStatus(RunStatus::Idle)).then_some(()))
        .await;
    assert!(artifact_files(&dir).is_empty());
    assert!(!h.scope.is_armed());

    // A trigger after stop reaches nobody.
    assert!(!h.scope.fire_trigger());
    h.shutdown().await;
}

#[tokio::test]
async fn test_stop_flushes_partial_iteration_when_configured() {
    let mut h = Harness::with_config(|config| {
        config.worker.flush_partial_on_abort = true;
    });
    h.start_run().await;

    h.trigger_at(0).await;
    h.next_capture().await;

    h.handle.stop_run().await.unwrap();
    let (_, path) = h.next_artifact().await;
    let artifact = read_artifact(&path);
    assert!(artifact.attributes.contains_key("load_timestamp"));
    assert!(!artifact.attributes.contains_key("probe_timestamp"));

    h.shutdown().await;
}

#[tokio::test]
async fn test_failed_download_skips_trigger() {
    let mut h = Harness::new();
    h.start_run().await;

    h.scope.fail_next_download();
    h.trigger_at(0).await;

    // The board is re-armed and the next trigger is trigger 0.
    h.trigger_at(1).await;
    let report = h.next_capture().await;
    assert_eq!(report.timestamp, start() + TimeDelta::seconds(1));
    assert_eq!(report.detection, Detection::Matched { index: 0, missed: 0 });
    assert_eq!(h.scope.trigger_count(), 2);

    h.handle.stop_run().await.unwrap();
    h.shutdown().await;
}

#[tokio::test]
async fn test_arm_failure_rejects_start() {
    let h = Harness::new();

    h.scope.fail_next_start();
    let result = h.handle.start_run(h.plan.clone()).await;
    assert!(matches!(result, Err(AcqError::Driver(_))));
    assert_eq!(h.handle.status().await.unwrap(), RunStatus::Idle);

    // The failure was one-shot.
    h.start_run().await;
    assert_eq!(h.handle.status().await.unwrap(), RunStatus::Acquiring);
    h.shutdown().await;
}

#[tokio::test]
async fn test_rearm_failure_aborts_run() {
    let mut h = Harness::new();
    h.start_run().await;

    h.scope.fail_next_start();
    h.trigger_at(0).await;

    let reason = h
        .next_event(|event| match event {
            WorkerEvent::RunAborted { reason } => Some(reason),
            _ => None,
        })
        .await;
    assert!(reason.contains("re-arm"));
    h.next_event(|event| matches!(event, WorkerEvent::RunStatus(RunStatus::Idle)).then_some(()))
        .await;
    assert_eq!(h.handle.status().await.unwrap(), RunStatus::Idle);
    h.shutdown().await;
}

#[tokio::test]
async fn test_run_state_errors() {
    let h = Harness::new();

    assert!(matches!(h.handle.stop_run().await, Err(AcqError::NotAcquiring)));

    h.start_run().await;
    let second = h.handle.start_run(h.plan.clone()).await;
    assert!(matches!(second, Err(AcqError::AlreadyAcquiring)));

    let mut empty = h.plan.clone();
    empty.channels.clear();
    h.handle.stop_run().await.unwrap();
    assert!(matches!(
        h.handle.start_run(empty).await,
        Err(AcqError::Configuration(_))
    ));
    h.shutdown().await;
}

#[tokio::test]
async fn test_consecutive_iterations_get_increasing_numbers() {
    let mut h = Harness::with_config(|config| {
        config.storage.first_file = 3;
    });
    let dir = h.start_run().await;

    for base in [0, 20] {
        for offset in [0, 5, 10] {
            h.trigger_at(base + offset).await;
            h.next_capture().await;
        }
    }

    // Stopping waits for pending writes.
    h.handle.stop_run().await.unwrap();
    let mut files = artifact_files(&dir);
    files.sort();
    assert_eq!(
        files,
        [dir.join("iteration_00003.json"), dir.join("iteration_00004.json")]
    );
    let second = read_artifact(&files[1]);
    assert_eq!(
        second.attributes["load_timestamp"].as_text(),
        Some("2024-03-01T12:00:20.000000Z")
    );

    h.shutdown().await;
}

#[tokio::test]
async fn test_handle_reports_worker_gone() {
    let h = Harness::new();
    let handle = h.handle.clone();
    h.shutdown().await;

    assert!(matches!(handle.status().await, Err(AcqError::WorkerGone)));
}
