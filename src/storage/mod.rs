//! Iteration artifact storage.
//!
//! A completed [`Iteration`](crate::iteration::Iteration) is converted into an
//! in-memory [`IterationArtifact`] by the output builder and then persisted by
//! an [`ArtifactWriter`]. Writers are selected by format name through the
//! [`ArtifactFormatRegistry`], which registers backends according to the
//! enabled Cargo features:
//!
//! - `json` is always available.
//! - `hdf5` requires the `storage_hdf5` feature.
//!
//! [`RunTarget`] decides where each artifact of a run goes.

pub mod artifact;
#[cfg(feature = "storage_hdf5")]
pub mod hdf5_writer;
pub mod json;

pub use artifact::{AttrValue, ChannelGroup, IterationArtifact, SegmentDataset};

use chrono::{Datelike, NaiveDate};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{AcqError, AppResult};

/// Persists and reloads iteration artifacts in one file format.
///
/// Implementations are synchronous; the worker runs them on the blocking
/// thread pool.
pub trait ArtifactWriter: Send + Sync {
    /// Format identifier, as used in the configuration.
    fn format(&self) -> &'static str;

    /// File extension without the leading dot.
    fn extension(&self) -> &'static str;

    /// Write `artifact` to a new file at `path`. Existing files are never
    /// overwritten.
    fn write(&self, artifact: &IterationArtifact, path: &Path) -> AppResult<()>;

    /// Read an artifact back.
    fn read(&self, path: &Path) -> AppResult<IterationArtifact>;
}

type WriterFactory = Box<dyn Fn() -> Box<dyn ArtifactWriter> + Send + Sync>;

/// Registry of artifact writers available in this build.
pub struct ArtifactFormatRegistry {
    factories: HashMap<String, WriterFactory>,
}

impl Default for ArtifactFormatRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ArtifactFormatRegistry {
    /// Creates a registry with every writer enabled by Cargo features.
    pub fn new() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };

        registry.register("json", || Box::new(json::JsonArtifactWriter));

        #[cfg(feature = "storage_hdf5")]
        registry.register("hdf5", || Box::new(hdf5_writer::Hdf5ArtifactWriter));

        registry
    }

    /// Registers a custom writer factory.
    pub fn register<F>(&mut self, format: &str, factory: F)
    where
        F: Fn() -> Box<dyn ArtifactWriter> + Send + Sync + 'static,
    {
        self.factories.insert(format.to_string(), Box::new(factory));
    }

    /// Creates a writer for `format`.
    ///
    /// # Errors
    ///
    /// Returns [`AcqError::FeatureNotEnabled`] for a known format compiled
    /// out of this build, and [`AcqError::Configuration`] for an unknown one.
    pub fn create(&self, format: &str) -> AppResult<Box<dyn ArtifactWriter>> {
        if let Some(factory) = self.factories.get(format) {
            return Ok(factory());
        }
        if format == "hdf5" {
            return Err(AcqError::FeatureNotEnabled("storage_hdf5".to_string()));
        }
        Err(AcqError::Configuration(format!(
            "Unsupported storage format: '{}'. Available formats: [{}]",
            format,
            self.list_formats().join(", ")
        )))
    }

    /// Creates the writer whose extension matches `path`.
    pub fn for_path(&self, path: &Path) -> AppResult<Box<dyn ArtifactWriter>> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default();
        let format = match extension {
            "h5" | "hdf5" => "hdf5",
            other => other,
        };
        self.create(format)
    }

    /// Sorted list of registered format names.
    pub fn list_formats(&self) -> Vec<String> {
        let mut formats: Vec<String> = self.factories.keys().cloned().collect();
        formats.sort();
        formats
    }

    /// Whether `format` can be created.
    pub fn is_available(&self, format: &str) -> bool {
        self.factories.contains_key(format)
    }
}

/// Output location of one run.
///
/// Artifacts go to
/// `<data_root>/<YYYY>/<MM>/<DD>/data/<run_name>/gagescope/iteration_<NNNNN>.<ext>`
/// with the date of the run start. File numbers only move forward, and a
/// number whose file already exists is skipped.
#[derive(Debug, Clone)]
pub struct RunTarget {
    dir: PathBuf,
    extension: String,
    next_file: u32,
}

impl RunTarget {
    /// Create the target for a run started on `date`.
    pub fn new(
        data_root: impl AsRef<Path>,
        run_name: &str,
        date: NaiveDate,
        first_file: u32,
        extension: &str,
    ) -> Self {
        let dir = data_root
            .as_ref()
            .join(format!("{:04}", date.year()))
            .join(format!("{:02}", date.month()))
            .join(format!("{:02}", date.day()))
            .join("data")
            .join(run_name)
            .join("gagescope");
        Self {
            dir,
            extension: extension.to_string(),
            next_file: first_file,
        }
    }

    /// Directory holding the run's artifacts.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of artifact number `file_number`.
    pub fn path_for(&self, file_number: u32) -> PathBuf {
        self.dir
            .join(format!("iteration_{:05}.{}", file_number, self.extension))
    }

    /// Number the next reservation will try first.
    pub fn next_file(&self) -> u32 {
        self.next_file
    }

    /// Claim the next free file number and its path, creating the run
    /// directory if needed.
    pub fn reserve(&mut self) -> AppResult<(u32, PathBuf)> {
        std::fs::create_dir_all(&self.dir)?;
        loop {
            let number = self.next_file;
            let path = self.path_for(number);
            self.next_file = number
                .checked_add(1)
                .ok_or_else(|| AcqError::Storage("Artifact file numbers exhausted".into()))?;
            if !path.exists() {
                return Ok((number, path));
            }
        }
    }
}
