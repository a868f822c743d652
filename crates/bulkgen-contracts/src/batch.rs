use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::images::GeneratedImage;

/// Where a finished run's archive landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveRef {
    pub path: PathBuf,
    pub file_name: String,
    pub entries: u64,
    pub sha256: String,
}

/// Snapshot of one generation run.
///
/// Snapshots are never mutated in place: every transition consumes the old
/// value and returns the next one, so observers only ever see complete states.
/// `completed` only grows, `results.len() == completed` after every unit, the
/// error is set at most once and the archive only on success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchState {
    pub total_units: u64,
    pub completed: u64,
    pub results: Vec<GeneratedImage>,
    pub error: Option<String>,
    pub archive: Option<ArchiveRef>,
}

impl BatchState {
    pub fn new(total_units: u64) -> Self {
        Self {
            total_units,
            completed: 0,
            results: Vec::new(),
            error: None,
            archive: None,
        }
    }

    pub fn with_result(mut self, image: GeneratedImage) -> Self {
        debug_assert!(self.error.is_none(), "result recorded after error");
        debug_assert!(self.completed < self.total_units, "more results than units");
        self.results.push(image);
        self.completed += 1;
        self
    }

    /// Keeps the first error when called more than once.
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        if self.error.is_none() {
            self.error = Some(message.into());
        }
        self
    }

    pub fn with_archive(mut self, archive: ArchiveRef) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn progress_pct(&self) -> f64 {
        if self.total_units == 0 {
            return 0.0;
        }
        (self.completed as f64 / self.total_units as f64 * 100.0).clamp(0.0, 100.0)
    }

    /// Number of grid slots still waiting for an image.
    pub fn placeholders(&self) -> u64 {
        self.total_units.saturating_sub(self.results.len() as u64)
    }

    pub fn all_units_done(&self) -> bool {
        self.total_units > 0 && self.completed == self.total_units
    }

    pub fn is_finished(&self) -> bool {
        self.error.is_none() && self.all_units_done() && self.archive.is_some()
    }
}
