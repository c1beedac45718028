//! Custom error types for the application.
//!
//! This module defines the primary error type, `AcqError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized way to classify the
//! failures that can occur between the digitizer driver and the artifact on
//! disk.
//!
//! ## Error Hierarchy
//!
//! - **`Figment`** / **`Configuration`**: the configuration file could not be
//!   parsed, or parsed into values that are semantically invalid (unknown input
//!   range, empty trigger pattern, overlapping segment names, ...).
//! - **`Io`** / **`Storage`** / **`Serialization`**: writing or reading an
//!   iteration artifact failed. These are fatal to a single artifact only; the
//!   acquisition keeps running.
//! - **`Driver`**: the digitizer reported an error. A failed download is
//!   treated as "no capture delivered", while failures to arm or configure the
//!   board stop the run.
//! - **`EmptyIteration`**: an iteration with no stored captures was handed to
//!   the output builder.
//!
//! Trigger sequence anomalies (extra or missed triggers) are deliberately not
//! represented here. They are classified and logged by [`crate::iteration`].

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, AcqError>;

#[derive(Error, Debug)]
pub enum AcqError {
    #[error("Configuration error: {0}")]
    Figment(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Digitizer error: {0}")]
    Driver(String),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    #[error("Iteration contains no captures")]
    EmptyIteration,

    #[error("Acquisition is already running")]
    AlreadyAcquiring,

    #[error("No acquisition is running")]
    NotAcquiring,

    #[error("Acquisition worker is no longer running")]
    WorkerGone,
}

impl From<figment::Error> for AcqError {
    fn from(err: figment::Error) -> Self {
        AcqError::Figment(Box::new(err))
    }
}

impl AcqError {
    /// Whether the failure only affects the current operation.
    ///
    /// Storage and configuration failures while building an artifact are
    /// recoverable: the run continues and the next iteration is written
    /// normally. Driver failures and a dead worker are not.
    pub fn is_recoverable(&self) -> bool {
        match self {
            AcqError::Io(_)
            | AcqError::Storage(_)
            | AcqError::Serialization(_)
            | AcqError::Configuration(_)
            | AcqError::EmptyIteration
            | AcqError::AlreadyAcquiring
            | AcqError::NotAcquiring => true,
            AcqError::Figment(_)
            | AcqError::Driver(_)
            | AcqError::FeatureNotEnabled(_)
            | AcqError::WorkerGone => false,
        }
    }

    /// Whether retrying the same write later could succeed.
    pub(crate) fn is_transient(&self) -> bool {
        matches!(self, AcqError::Io(_) | AcqError::Storage(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_are_recoverable() {
        let err = AcqError::Storage("disk full".into());
        assert!(err.is_recoverable());
        assert!(err.is_transient());
        assert_eq!(err.to_string(), "Storage error: disk full");
    }

    #[test]
    fn driver_errors_stop_the_run() {
        let err = AcqError::Driver("download timed out".into());
        assert!(!err.is_recoverable());
        assert!(!err.is_transient());
    }

    #[test]
    fn empty_iteration_is_not_retried() {
        assert!(AcqError::EmptyIteration.is_recoverable());
        assert!(!AcqError::EmptyIteration.is_transient());
    }
}
