//! JSON artifact backend.
//!
//! Always compiled. Floats are written with exact round-trip precision, so a
//! read-back artifact compares equal to the one written.

use std::fs::OpenOptions;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use super::{ArtifactWriter, IterationArtifact};
use crate::error::AppResult;

/// Writes artifacts as a single JSON document.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonArtifactWriter;

impl ArtifactWriter for JsonArtifactWriter {
    fn format(&self) -> &'static str {
        "json"
    }

    fn extension(&self) -> &'static str {
        "json"
    }

    fn write(&self, artifact: &IterationArtifact, path: &Path) -> AppResult<()> {
        let file = OpenOptions::new().write(true).create_new(true).open(path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, artifact)?;
        writer.flush()?;
        Ok(())
    }

    fn read(&self, path: &Path) -> AppResult<IterationArtifact> {
        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }
}
