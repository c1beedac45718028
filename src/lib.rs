//! # Gage Acquire Core Library
//!
//! Segmented trigger-sequence acquisition for waveform digitizers. A run
//! expects an ordered, repeating pattern of external triggers (for example
//! `load`, `probe`, `reference`), classifies every capture against that
//! pattern by timing, and writes each completed pass ("iteration") as one
//! artifact containing named time segments of every monitored channel.
//!
//! ## Crate Structure
//!
//! - **`config`**: Figment-based loading and validation of the TOML
//!   configuration (trigger pattern, channels, worker and storage settings).
//! - **`pattern`** / **`segment`**: the trigger pattern and the named time
//!   windows cut from each channel.
//! - **`driver`**: the `Digitizer` hardware capability and its mock.
//! - **`capture`**: one downloaded acquisition plus the resample and plot
//!   preparation pipeline.
//! - **`data`**: anti-alias decimation and display filters.
//! - **`iteration`**: the sequence tracker deciding whether a capture is the
//!   expected trigger, an extra trigger, or follows missed ones.
//! - **`storage`**: the artifact model and its JSON and HDF5 backends, plus
//!   the on-disk layout of a run.
//! - **`worker`** / **`messages`**: the actor that owns the tracker and
//!   drives a run, and the commands and events it exchanges.
//! - **`clock`**: injectable time source.
//! - **`logging`**: tracing subscriber setup.
//! - **`error`**: the crate-wide `AcqError`.

pub mod capture;
pub mod clock;
pub mod config;
pub mod data;
pub mod driver;
pub mod error;
pub mod iteration;
pub mod logging;
pub mod messages;
pub mod pattern;
pub mod segment;
pub mod storage;
pub mod worker;

pub use error::{AcqError, AppResult};
pub use iteration::{Detection, Iteration};
pub use pattern::{TriggerPattern, TriggerStep};
pub use worker::{AcquisitionWorker, WorkerHandle};
