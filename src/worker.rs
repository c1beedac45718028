//! Acquisition worker.
//!
//! The [`AcquisitionWorker`] is the single owner of the active
//! [`Iteration`]. It runs in its own Tokio task and multiplexes three inputs
//! in one `select!` loop, in priority order:
//!
//! 1. [`WorkerCommand`]s from [`WorkerHandle`]s;
//! 2. processed captures from the producer task;
//! 3. the timeout poll tick.
//!
//! ```text
//! driver callback ──try_send(timestamp)──> producer task
//!                                            download, re-arm,
//!                                            resample, plot
//!                                               │
//!                                               ▼
//! WorkerHandle ──commands──> AcquisitionWorker (Iteration owner) <── poll tick
//!                                               │
//!                                     finished iterations
//!                                               ▼
//!                                        writer task ──> artifact files
//! ```
//!
//! The driver callback only enqueues a timestamp into a bounded queue, so it
//! never blocks the driver thread. Downloads and signal processing happen in
//! the producer, and artifact building and file I/O in the writer, so neither
//! delays capture classification. Captures reach the tracker in arrival
//! order.
//!
//! Every trigger the callback accepts is counted as in flight until the
//! producer reports back on it, with a capture or a skip. Timeout checks wait
//! while anything is in flight, so a slow download can never make its own
//! trigger look missed.
//!
//! Stopping a run aborts the producer, drops queued captures and stops the
//! poll timer in one step of the worker loop, so no capture or tick can touch
//! the tracker afterwards.

use chrono::{DateTime, TimeDelta, Utc};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::capture::pipeline::{prepare_plot, resample, PlotSeries};
use crate::capture::Capture;
use crate::clock::Clock;
use crate::config::{validate_channels, AcquireConfig, ChannelConfig};
use crate::data::decimate::Decimator;
use crate::driver::Digitizer;
use crate::error::{AcqError, AppResult};
use crate::iteration::{Iteration, IterationComplete};
use crate::messages::{CaptureReport, RunPlan, RunStatus, WorkerCommand, WorkerEvent};
use crate::storage::{ArtifactFormatRegistry, ArtifactWriter, IterationArtifact, RunTarget};

/// Capacity of the event broadcast channel.
const EVENT_CAPACITY: usize = 256;
/// How long a stopping run waits for pending artifacts to be written.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

fn driver_err(context: &str) -> impl Fn(anyhow::Error) -> AcqError + '_ {
    move |e| AcqError::Driver(format!("{context}: {e:#}"))
}

/// A capture after download and processing, ready for the tracker.
struct ProcessedCapture {
    capture: Capture,
    series: Vec<PlotSeries>,
}

/// Each trigger taken from the queue is answered by exactly one message.
enum ProducerMessage {
    Capture(Box<ProcessedCapture>),
    /// The trigger at this timestamp produced no capture.
    Skipped(DateTime<Utc>),
    /// The producer stopped; the run cannot continue.
    Failed(AcqError),
}

/// Triggers stamped by the driver callback that the worker has not yet
/// heard back about.
#[derive(Clone, Default)]
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn begin(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }

    fn finish(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    fn count(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

struct ActiveRun {
    iteration: Iteration,
    tolerance: TimeDelta,
    in_flight: InFlight,
    producer: JoinHandle<()>,
    writer_tx: mpsc::UnboundedSender<Iteration>,
    writer: JoinHandle<()>,
}

/// Cloneable client of a running [`AcquisitionWorker`].
#[derive(Clone)]
pub struct WorkerHandle {
    command_tx: mpsc::Sender<WorkerCommand>,
    events: broadcast::Sender<WorkerEvent>,
}

impl WorkerHandle {
    async fn request<T>(
        &self,
        (command, rx): (WorkerCommand, tokio::sync::oneshot::Receiver<T>),
    ) -> AppResult<T> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| AcqError::WorkerGone)?;
        rx.await.map_err(|_| AcqError::WorkerGone)
    }

    /// Start a run; returns the directory artifacts are written to.
    pub async fn start_run(&self, plan: RunPlan) -> AppResult<PathBuf> {
        self.request(WorkerCommand::start_run(plan)).await?
    }

    /// Stop the current run.
    pub async fn stop_run(&self) -> AppResult<()> {
        self.request(WorkerCommand::stop_run()).await?
    }

    /// Current worker state.
    pub async fn status(&self) -> AppResult<RunStatus> {
        self.request(WorkerCommand::get_status()).await
    }

    /// Stop any run and terminate the worker.
    pub async fn shutdown(&self) -> AppResult<()> {
        self.request(WorkerCommand::shutdown()).await
    }

    /// Receive worker events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }
}

/// Owner of the sequence tracker and the run lifecycle.
pub struct AcquisitionWorker {
    config: AcquireConfig,
    driver: Arc<dyn Digitizer>,
    clock: Arc<dyn Clock>,
    decimator: Arc<dyn Decimator>,
    events: broadcast::Sender<WorkerEvent>,
    opened: bool,
    run: Option<ActiveRun>,
    produced_rx: Option<mpsc::Receiver<ProducerMessage>>,
    ticker: Option<Interval>,
}

impl AcquisitionWorker {
    /// Create a worker. Call [`run`](Self::run) to start its event loop, or
    /// use [`spawn`](Self::spawn).
    pub fn new(
        config: AcquireConfig,
        driver: Arc<dyn Digitizer>,
        clock: Arc<dyn Clock>,
        decimator: Arc<dyn Decimator>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            driver,
            clock,
            decimator,
            events,
            opened: false,
            run: None,
            produced_rx: None,
            ticker: None,
        }
    }

    /// Spawn the worker task and return a handle to it.
    pub fn spawn(
        config: AcquireConfig,
        driver: Arc<dyn Digitizer>,
        clock: Arc<dyn Clock>,
        decimator: Arc<dyn Decimator>,
    ) -> (WorkerHandle, JoinHandle<()>) {
        let worker = Self::new(config, driver, clock, decimator);
        let (command_tx, command_rx) = mpsc::channel(worker.config.worker.queue_capacity.max(1));
        let handle = WorkerHandle {
            command_tx,
            events: worker.events.clone(),
        };
        (handle, tokio::spawn(worker.run(command_rx)))
    }

    /// Process commands, captures and poll ticks until shutdown or until
    /// every handle is dropped.
    pub async fn run(mut self, mut command_rx: mpsc::Receiver<WorkerCommand>) {
        info!("Acquisition worker started");

        loop {
            tokio::select! {
                biased;

                command = command_rx.recv() => {
                    let Some(command) = command else {
                        debug!("All worker handles dropped");
                        break;
                    };
                    if self.handle_command(command).await {
                        break;
                    }
                }

                message = recv_produced(&mut self.produced_rx) => {
                    if let Some(run) = &self.run {
                        run.in_flight.finish();
                    }
                    match message {
                        Some(ProducerMessage::Capture(processed)) => self.on_capture(*processed),
                        Some(ProducerMessage::Skipped(timestamp)) => {
                            debug!(%timestamp, "Trigger produced no capture");
                        }
                        Some(ProducerMessage::Failed(err)) => self.abort_run(err.to_string()).await,
                        None => self.abort_run("Capture producer stopped".to_string()).await,
                    }
                }

                _ = tick(&mut self.ticker) => self.on_tick(),
            }
        }

        if self.run.is_some() {
            let _ = self.stop_run().await;
        }
        self.close_driver().await;
        info!("Acquisition worker stopped");
    }

    /// Returns `true` when the loop should exit.
    async fn handle_command(&mut self, command: WorkerCommand) -> bool {
        match command {
            WorkerCommand::StartRun { plan, response } => {
                let result = self.start_run(plan).await;
                if let Err(e) = &result {
                    error!(error = %e, "Failed to start run");
                }
                let _ = response.send(result);
            }
            WorkerCommand::StopRun { response } => {
                let _ = response.send(self.stop_run().await);
            }
            WorkerCommand::GetStatus { response } => {
                let _ = response.send(self.status());
            }
            WorkerCommand::Shutdown { response } => {
                if self.run.is_some() {
                    let _ = self.stop_run().await;
                }
                self.close_driver().await;
                let _ = response.send(());
                return true;
            }
        }
        false
    }

    fn status(&self) -> RunStatus {
        if self.run.is_some() {
            RunStatus::Acquiring
        } else {
            RunStatus::Idle
        }
    }

    fn emit(&self, event: WorkerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn ensure_open(&mut self) -> AppResult<()> {
        if !self.opened {
            self.driver
                .initialize()
                .await
                .map_err(driver_err("Failed to initialize driver"))?;
            self.driver
                .open()
                .await
                .map_err(driver_err("Failed to open digitizer"))?;
            self.opened = true;
        }
        Ok(())
    }

    async fn close_driver(&mut self) {
        if self.opened {
            if let Err(e) = self.driver.close().await {
                warn!(error = %e, "Failed to close digitizer");
            }
            self.opened = false;
        }
    }

    async fn configure(&self, channels: &[ChannelConfig]) -> AppResult<()> {
        let acquisition = self.config.acquisition.setup(channels);
        self.driver
            .set_acquisition_config(&acquisition)
            .await
            .map_err(driver_err("Failed to set acquisition configuration"))?;
        for channel in channels {
            self.driver
                .set_channel_config(&channel.setup())
                .await
                .map_err(driver_err("Failed to set channel configuration"))?;
        }
        self.driver
            .set_trigger_config(&self.config.acquisition.trigger)
            .await
            .map_err(driver_err("Failed to set trigger configuration"))?;
        self.driver
            .commit()
            .await
            .map_err(driver_err("Failed to commit configuration"))?;
        debug!(depth = acquisition.depth, "Digitizer configured");
        Ok(())
    }

    async fn start_run(&mut self, plan: RunPlan) -> AppResult<PathBuf> {
        if self.run.is_some() {
            return Err(AcqError::AlreadyAcquiring);
        }
        validate_channels(&plan.channels)?;
        let tolerance = TimeDelta::from_std(self.config.worker.tolerance)
            .map_err(|e| AcqError::Configuration(format!("Invalid tolerance: {e}")))?;
        let writer = ArtifactFormatRegistry::new().create(&self.config.storage.format)?;

        self.ensure_open().await?;
        self.configure(&plan.channels).await?;

        let storage = &self.config.storage;
        let target = RunTarget::new(
            &storage.data_root,
            &storage.run_name,
            self.clock.now().date_naive(),
            storage.first_file,
            writer.extension(),
        );
        let run_dir = target.dir().to_path_buf();

        let capacity = self.config.worker.queue_capacity.max(1);
        let (trigger_tx, trigger_rx) = mpsc::channel::<DateTime<Utc>>(capacity);
        let clock = Arc::clone(&self.clock);
        let in_flight = InFlight::default();
        let callback_in_flight = in_flight.clone();
        self.driver
            .register_end_of_acquisition(Box::new(move || {
                let timestamp = clock.now();
                callback_in_flight.begin();
                if let Err(e) = trigger_tx.try_send(timestamp) {
                    callback_in_flight.finish();
                    warn!(%timestamp, error = %e, "Trigger queue rejected end-of-acquisition event");
                }
            }))
            .map_err(driver_err("Failed to register acquisition callback"))?;

        let channels: Arc<[Arc<ChannelConfig>]> = plan.channels.into_iter().map(Arc::new).collect();
        let (produced_tx, produced_rx) = mpsc::channel(capacity);
        let producer = tokio::spawn(produce(
            Arc::clone(&self.driver),
            channels,
            Arc::clone(&self.decimator),
            trigger_rx,
            produced_tx,
        ));

        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(write_artifacts(
            Arc::from(writer),
            target,
            self.config.worker.max_pending_artifacts.max(1),
            writer_rx,
            self.events.clone(),
        ));

        if let Err(e) = self.driver.start().await {
            producer.abort();
            writer_task.abort();
            self.driver.clear_end_of_acquisition();
            return Err(driver_err("Failed to arm digitizer")(e));
        }

        let mut ticker = tokio::time::interval(self.config.worker.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.ticker = Some(ticker);
        self.produced_rx = Some(produced_rx);
        self.run = Some(ActiveRun {
            iteration: Iteration::new(plan.pattern),
            tolerance,
            in_flight,
            producer,
            writer_tx,
            writer: writer_task,
        });

        info!(dir = %run_dir.display(), "Run started");
        self.emit(WorkerEvent::RunStatus(RunStatus::Acquiring));
        Ok(run_dir)
    }

    async fn stop_run(&mut self) -> AppResult<()> {
        let mut run = self.run.take().ok_or(AcqError::NotAcquiring)?;

        // Producer, queued captures and poll timer go together.
        run.producer.abort();
        self.produced_rx = None;
        self.ticker = None;

        self.driver.clear_end_of_acquisition();
        if let Err(e) = self.driver.abort().await {
            warn!(error = %e, "Failed to abort acquisition");
        }

        if !run.iteration.is_empty() {
            if self.config.worker.flush_partial_on_abort {
                info!(cursor = run.iteration.cursor(), "Flushing partial iteration");
                send_iteration(&run.writer_tx, run.iteration);
            } else {
                info!(cursor = run.iteration.cursor(), "Discarding partial iteration");
            }
        }

        drop(run.writer_tx);
        match tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut run.writer).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Artifact writer task failed"),
            Err(_) => {
                warn!("Artifact writer did not finish in time, aborting it");
                run.writer.abort();
            }
        }

        info!("Run stopped");
        self.emit(WorkerEvent::RunStatus(RunStatus::Idle));
        Ok(())
    }

    async fn abort_run(&mut self, reason: String) {
        error!(%reason, "Aborting run");
        self.emit(WorkerEvent::RunAborted {
            reason: reason.clone(),
        });
        if let Err(e) = self.stop_run().await {
            debug!(error = %e, "Run already stopped");
        }
    }

    fn on_capture(&mut self, processed: ProcessedCapture) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        let ProcessedCapture { capture, series } = processed;
        let timestamp = capture.timestamp();

        let outcome = match run.iteration.capture_trigger(capture, run.tolerance) {
            Ok(outcome) => outcome,
            Err(IterationComplete(_)) => {
                // Completed iterations are replaced as soon as they finish.
                error!(%timestamp, "Capture offered to a completed iteration, dropping it");
                return;
            }
        };

        let trigger_index = outcome.trigger_index();
        let label = trigger_index.map(|index| run.iteration.pattern()[index].label.clone());
        let finished = outcome
            .next_iteration
            .map(|next| std::mem::replace(&mut run.iteration, next));
        let next_timeout = run
            .iteration
            .time_until_timeout(self.clock.now(), run.tolerance);
        let writer_tx = run.writer_tx.clone();

        // Report the capture before its iteration can be written.
        self.emit(WorkerEvent::CaptureProcessed(Arc::new(CaptureReport {
            timestamp,
            detection: outcome.detection,
            trigger_index,
            label,
            series,
            next_timeout,
        })));
        if let Some(finished) = finished {
            send_iteration(&writer_tx, finished);
        }
    }

    fn on_tick(&mut self) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        let pending = run.in_flight.count();
        if pending > 0 {
            debug!(pending, "Captures in flight, deferring timeout check");
            return;
        }
        if let Some(next) = run.iteration.check_timeout(self.clock.now(), run.tolerance) {
            let finished = std::mem::replace(&mut run.iteration, next);
            send_iteration(&run.writer_tx, finished);
        }
    }
}

fn send_iteration(writer_tx: &mpsc::UnboundedSender<Iteration>, iteration: Iteration) {
    if iteration.is_empty() {
        debug!("Finished iteration has no captures, nothing to write");
        return;
    }
    if writer_tx.send(iteration).is_err() {
        error!("Artifact writer is gone, iteration lost");
    }
}

async fn recv_produced(
    rx: &mut Option<mpsc::Receiver<ProducerMessage>>,
) -> Option<ProducerMessage> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Producer task: turns end-of-acquisition timestamps into processed captures.
///
/// Answers every timestamp with a capture or a skip. A failure that is not
/// recoverable ends the task with [`ProducerMessage::Failed`].
async fn produce(
    driver: Arc<dyn Digitizer>,
    channels: Arc<[Arc<ChannelConfig>]>,
    decimator: Arc<dyn Decimator>,
    mut triggers: mpsc::Receiver<DateTime<Utc>>,
    out: mpsc::Sender<ProducerMessage>,
) {
    while let Some(timestamp) = triggers.recv().await {
        let downloaded = Capture::download(driver.as_ref(), &channels, timestamp).await;

        if let Err(e) = driver.start().await {
            let err = driver_err("Failed to re-arm digitizer")(e);
            let _ = out.send(ProducerMessage::Failed(err)).await;
            return;
        }

        let capture = match downloaded {
            Ok(capture) => capture,
            Err(e) => {
                // The board re-armed, so the next trigger can still be read.
                warn!(%timestamp, error = %e, "Capture download failed, trigger skipped");
                if out.send(ProducerMessage::Skipped(timestamp)).await.is_err() {
                    return;
                }
                continue;
            }
        };

        let decimator = Arc::clone(&decimator);
        let processed = tokio::task::spawn_blocking(move || -> AppResult<ProcessedCapture> {
            let mut capture = capture;
            resample(&mut capture, decimator.as_ref())?;
            let series = prepare_plot(&capture, decimator.as_ref())?;
            Ok(ProcessedCapture { capture, series })
        })
        .await;

        let message = match processed {
            Ok(Ok(processed)) => ProducerMessage::Capture(Box::new(processed)),
            Ok(Err(e)) if e.is_recoverable() => {
                warn!(%timestamp, error = %e, "Capture processing failed, trigger skipped");
                ProducerMessage::Skipped(timestamp)
            }
            Ok(Err(e)) => {
                let _ = out.send(ProducerMessage::Failed(e)).await;
                return;
            }
            Err(e) => {
                error!(%timestamp, error = %e, "Capture processing task panicked");
                ProducerMessage::Skipped(timestamp)
            }
        };
        if out.send(message).await.is_err() {
            return;
        }
    }
}

/// Writer task: builds artifacts and writes them, retrying failed writes.
async fn write_artifacts(
    writer: Arc<dyn ArtifactWriter>,
    mut target: RunTarget,
    max_pending: usize,
    mut iterations: mpsc::UnboundedReceiver<Iteration>,
    events: broadcast::Sender<WorkerEvent>,
) {
    let mut pending: VecDeque<IterationArtifact> = VecDeque::new();

    while let Some(iteration) = iterations.recv().await {
        match IterationArtifact::from_iteration(&iteration) {
            Ok(artifact) => {
                if pending.len() >= max_pending {
                    error!(max_pending, "Too many unwritten artifacts, dropping the oldest");
                    pending.pop_front();
                }
                pending.push_back(artifact);
            }
            Err(e) => {
                error!(error = %e, "Failed to build iteration artifact");
                let _ = events.send(WorkerEvent::ArtifactFailed {
                    file_number: None,
                    error: e.to_string(),
                });
            }
        }
        flush_pending(&writer, &mut target, &mut pending, &events).await;
    }

    if !pending.is_empty() {
        flush_pending(&writer, &mut target, &mut pending, &events).await;
        if !pending.is_empty() {
            error!(count = pending.len(), "Run ended with unwritten artifacts");
        }
    }
}

async fn flush_pending(
    writer: &Arc<dyn ArtifactWriter>,
    target: &mut RunTarget,
    pending: &mut VecDeque<IterationArtifact>,
    events: &broadcast::Sender<WorkerEvent>,
) {
    while let Some(artifact) = pending.pop_front() {
        let (file_number, path) = match target.reserve() {
            Ok(reserved) => reserved,
            Err(e) => {
                error!(error = %e, "Failed to prepare artifact path");
                let _ = events.send(WorkerEvent::ArtifactFailed {
                    file_number: None,
                    error: e.to_string(),
                });
                pending.push_front(artifact);
                return;
            }
        };

        let task_writer = Arc::clone(writer);
        let task_path = path.clone();
        let written = tokio::task::spawn_blocking(move || {
            let result = task_writer.write(&artifact, &task_path);
            (artifact, result)
        })
        .await;

        match written {
            Ok((_, Ok(()))) => {
                info!(file_number, path = %path.display(), "Artifact written");
                let _ = events.send(WorkerEvent::ArtifactWritten { path, file_number });
            }
            Ok((artifact, Err(e))) => {
                error!(file_number, path = %path.display(), error = %e, "Failed to write artifact");
                let _ = events.send(WorkerEvent::ArtifactFailed {
                    file_number: Some(file_number),
                    error: e.to_string(),
                });
                if e.is_transient() {
                    pending.push_front(artifact);
                    return;
                }
            }
            Err(e) => {
                error!(file_number, error = %e, "Artifact write task panicked");
                return;
            }
        }
    }
}
