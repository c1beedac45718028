//! Message types for the acquisition worker.
//!
//! Commands travel to the [`AcquisitionWorker`](crate::worker::AcquisitionWorker)
//! over an mpsc channel and carry a oneshot sender for the reply. Events flow
//! the other way over a broadcast channel so that any number of observers
//! (CLI, plotting front end, tests) can follow the run.
//!
//! # Message Flow
//!
//! ```text
//! Client                             Worker Task
//! ------                             -----------
//! 1. Create command with oneshot
//! 2. Send via mpsc channel    ------>
//!                                    3. Receive command
//!                                    4. Start/stop run
//!                                    5. Send response
//! 6. Await oneshot receiver   <------
//!
//! subscribe() <====== broadcast ===== RunStatus, CaptureProcessed,
//!                                     ArtifactWritten, ArtifactFailed
//! ```
//!
//! Each command variant has a helper that returns the command together with
//! the receiver to await:
//!
//! ```rust
//! use gage_acquire::messages::WorkerCommand;
//!
//! let (cmd, rx) = WorkerCommand::stop_run();
//! // cmd_tx.send(cmd).await?;
//! // let result = rx.await?;
//! ```

use chrono::{DateTime, TimeDelta, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::capture::pipeline::PlotSeries;
use crate::config::{AcquireConfig, ChannelConfig};
use crate::error::AppResult;
use crate::iteration::Detection;
use crate::pattern::TriggerPattern;

/// What to acquire in one run.
#[derive(Debug, Clone)]
pub struct RunPlan {
    /// Trigger pattern of every iteration
    pub pattern: TriggerPattern,
    /// Channels to download on each trigger
    pub channels: Vec<ChannelConfig>,
}

impl RunPlan {
    /// Plan using the pattern and channels of a configuration.
    pub fn from_config(config: &AcquireConfig) -> AppResult<Self> {
        Ok(Self {
            pattern: config.trigger_pattern()?,
            channels: config.channels.clone(),
        })
    }
}

/// Commands accepted by the acquisition worker.
#[derive(Debug)]
pub enum WorkerCommand {
    /// Configure and arm the digitizer and start tracking iterations.
    ///
    /// # Response
    ///
    /// - `Ok(dir)`: run started, artifacts go to `dir`
    /// - `Err`: already acquiring, invalid channels, or the board refused the
    ///   configuration
    StartRun {
        /// Pattern and channels of the run
        plan: RunPlan,
        /// Response channel
        response: oneshot::Sender<AppResult<PathBuf>>,
    },

    /// Abort the board, stop timeout polling and end the run.
    ///
    /// The in-progress iteration is discarded unless
    /// `worker.flush_partial_on_abort` is set.
    StopRun {
        /// Response channel, `Err(NotAcquiring)` when idle
        response: oneshot::Sender<AppResult<()>>,
    },

    /// Query the current state.
    GetStatus {
        /// Response channel
        response: oneshot::Sender<RunStatus>,
    },

    /// Stop any run, close the digitizer and exit the worker loop.
    Shutdown {
        /// Acknowledged once the worker has cleaned up
        response: oneshot::Sender<()>,
    },
}

impl WorkerCommand {
    /// Helper to create a StartRun command
    pub fn start_run(plan: RunPlan) -> (Self, oneshot::Receiver<AppResult<PathBuf>>) {
        let (tx, rx) = oneshot::channel();
        (Self::StartRun { plan, response: tx }, rx)
    }

    /// Helper to create a StopRun command
    pub fn stop_run() -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::StopRun { response: tx }, rx)
    }

    /// Helper to create a GetStatus command
    pub fn get_status() -> (Self, oneshot::Receiver<RunStatus>) {
        let (tx, rx) = oneshot::channel();
        (Self::GetStatus { response: tx }, rx)
    }

    /// Helper to create a Shutdown command
    pub fn shutdown() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }
}

/// Worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// No run in progress
    Idle,
    /// Board armed, iterations being tracked
    Acquiring,
}

/// Summary of one capture after it went through the sequence tracker.
#[derive(Debug, Clone)]
pub struct CaptureReport {
    /// End-of-acquisition time
    pub timestamp: DateTime<Utc>,
    /// Classification by the tracker
    pub detection: Detection,
    /// Trigger index the capture was stored under
    pub trigger_index: Option<usize>,
    /// Label of that trigger
    pub label: Option<String>,
    /// Plot-ready channel data
    pub series: Vec<PlotSeries>,
    /// Time left until the next expected trigger is declared missed
    pub next_timeout: Option<TimeDelta>,
}

/// Events broadcast by the worker.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// State changed
    RunStatus(RunStatus),
    /// A capture was classified
    CaptureProcessed(Arc<CaptureReport>),
    /// An iteration artifact was written
    ArtifactWritten {
        /// Artifact path
        path: PathBuf,
        /// File number within the run
        file_number: u32,
    },
    /// An iteration artifact could not be built or written
    ArtifactFailed {
        /// File number, if one was reserved
        file_number: Option<u32>,
        /// Error description
        error: String,
    },
    /// The run ended because of a driver failure
    RunAborted {
        /// Error description
        reason: String,
    },
}
