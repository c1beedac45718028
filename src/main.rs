//! CLI Entry Point for gage-acquire
//!
//! Provides command-line interface for:
//! - Running a configured trigger pattern against the simulated digitizer
//! - Inspecting a written iteration artifact
//!
//! # Usage
//!
//! Simulate three iterations, dropping one trigger in ten:
//! ```bash
//! gage-acquire --config config/gage_acquire.toml simulate --iterations 3 --miss-probability 0.1
//! ```
//!
//! Inspect an artifact:
//! ```bash
//! gage-acquire inspect data/2024/03/01/data/run0/gagescope/iteration_00000.json
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use gage_acquire::clock::SystemClock;
use gage_acquire::config::AcquireConfig;
use gage_acquire::data::decimate::ButterworthDecimator;
use gage_acquire::driver::mock::MockDigitizer;
use gage_acquire::logging::{self, OutputFormat, TracingConfig};
use gage_acquire::messages::{RunPlan, WorkerEvent};
use gage_acquire::storage::ArtifactFormatRegistry;
use gage_acquire::{AcquisitionWorker, Detection};
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

/// How long the simulation waits for the board to re-arm after a trigger.
const REARM_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "gage-acquire")]
#[command(about = "Segmented trigger-sequence acquisition", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = "config/gage_acquire.toml")]
    config: PathBuf,

    /// Log output format (pretty, compact, json)
    #[arg(long, global = true)]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured trigger pattern against the simulated digitizer
    Simulate {
        /// Number of iterations to trigger
        #[arg(long, default_value_t = 3)]
        iterations: usize,

        /// Probability of skipping each trigger
        #[arg(long, default_value_t = 0.0)]
        miss_probability: f64,

        /// Pause between iterations, in seconds
        #[arg(long, default_value_t = 1.0)]
        gap_secs: f64,

        /// Override the run name
        #[arg(long)]
        run_name: Option<String>,

        /// Override the data root
        #[arg(long)]
        data_root: Option<PathBuf>,
    },

    /// Print a summary of an iteration artifact
    Inspect {
        /// Artifact file (.json, .h5)
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let format = cli
        .log_format
        .as_deref()
        .map(str::parse::<OutputFormat>)
        .transpose()?
        .unwrap_or_default();

    match cli.command {
        Commands::Simulate {
            iterations,
            miss_probability,
            gap_secs,
            run_name,
            data_root,
        } => {
            let mut config = AcquireConfig::load_from(&cli.config)
                .with_context(|| format!("Failed to load {}", cli.config.display()))?;
            if let Some(run_name) = run_name {
                config.storage.run_name = run_name;
            }
            if let Some(data_root) = data_root {
                config.storage.data_root = data_root;
            }
            config.validate()?;
            logging::init(TracingConfig::from_config(&config)?.with_format(format))?;

            if !(0.0..=1.0).contains(&miss_probability) {
                bail!("--miss-probability must be between 0 and 1");
            }
            let gap = Duration::try_from_secs_f64(gap_secs).context("Invalid --gap-secs")?;
            simulate(config, iterations, miss_probability, gap).await
        }
        Commands::Inspect { file } => {
            logging::init(TracingConfig::default().with_format(format))?;
            inspect(&file)
        }
    }
}

async fn simulate(
    config: AcquireConfig,
    iterations: usize,
    miss_probability: f64,
    gap: Duration,
) -> Result<()> {
    let plan = RunPlan::from_config(&config)?;
    let scope = Arc::new(MockDigitizer::new());
    let (handle, worker_task) = AcquisitionWorker::spawn(
        config,
        scope.clone(),
        Arc::new(SystemClock),
        Arc::new(ButterworthDecimator::new()),
    );

    let mut events = handle.subscribe();
    let reporter = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => report(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event reporter lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let pattern = plan.pattern.clone();
    let dir = handle.start_run(plan).await?;
    info!(dir = %dir.display(), iterations, "Simulation started");

    let mut rng = rand::thread_rng();
    for iteration in 0..iterations {
        for (index, step) in pattern.iter().enumerate() {
            let wait = if index == 0 {
                if iteration == 0 {
                    Duration::ZERO
                } else {
                    gap
                }
            } else {
                Duration::try_from_secs_f64(step.timeout_secs).unwrap_or(Duration::ZERO)
            };
            tokio::time::sleep(wait).await;

            if rng.gen_bool(miss_probability) {
                info!(iteration, trigger = index, label = %step.label, "Skipping trigger");
                continue;
            }
            if !wait_until_armed(&scope).await {
                warn!(iteration, trigger = index, "Digitizer not armed, trigger lost");
                continue;
            }
            scope.fire_trigger();
        }
    }

    // Give the last download and artifact write a moment to land.
    tokio::time::sleep(Duration::from_millis(500)).await;
    if let Err(e) = handle.stop_run().await {
        error!(error = %e, "Failed to stop run");
    }
    handle.shutdown().await?;
    drop(handle);

    if let Err(e) = worker_task.await {
        error!(error = %e, "Worker task failed");
    }
    let _ = reporter.await;
    info!(dir = %dir.display(), "Simulation finished");
    Ok(())
}

async fn wait_until_armed(scope: &MockDigitizer) -> bool {
    let deadline = tokio::time::Instant::now() + REARM_TIMEOUT;
    while !scope.is_armed() {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    true
}

fn report(event: &WorkerEvent) {
    match event {
        WorkerEvent::RunStatus(status) => info!(?status, "Run status"),
        WorkerEvent::CaptureProcessed(report) => match report.detection {
            Detection::Extra => info!(timestamp = %report.timestamp, "Extra trigger ignored"),
            Detection::Matched { index, missed } => info!(
                trigger = index,
                label = report.label.as_deref().unwrap_or_default(),
                missed,
                series = report.series.len(),
                next_timeout_ms = report.next_timeout.map(|t| t.num_milliseconds()),
                "Capture stored"
            ),
            Detection::NextIteration { missed } => {
                info!(missed, "Capture started the next iteration")
            }
        },
        WorkerEvent::ArtifactWritten { path, file_number } => {
            info!(file_number, path = %path.display(), "Iteration written")
        }
        WorkerEvent::ArtifactFailed { file_number, error } => {
            error!(?file_number, %error, "Iteration not written")
        }
        WorkerEvent::RunAborted { reason } => error!(%reason, "Run aborted"),
    }
}

fn inspect(path: &std::path::Path) -> Result<()> {
    let artifact = ArtifactFormatRegistry::new().for_path(path)?.read(path)?;

    println!("{}", path.display());
    println!();
    println!("Attributes:");
    for (name, value) in &artifact.attributes {
        println!("  {name} = {value}");
    }

    for (group, channel) in &artifact.channels {
        println!();
        println!("{group}:");
        for (name, value) in &channel.attributes {
            println!("  @{name} = {value}");
        }
        for (name, dataset) in &channel.datasets {
            println!(
                "  {name}: {} samples, x0 = {} s, dx = {} s",
                dataset.data.len(),
                dataset.x0,
                dataset.dx
            );
        }
    }

    println!();
    println!("{} datasets", artifact.dataset_count());
    Ok(())
}
