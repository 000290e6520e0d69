use std::path::{Path, PathBuf};

use tracing::{error, info};

use crate::ingest::storage::remove_if_exists;

/// Tracks the files a request has written so they can be removed if the
/// request aborts.
///
/// Call [`commit`](Self::commit) once the record is persisted. A compensator
/// dropped without being committed removes its files, so an early return or
/// a panic cannot leave orphans behind.
#[derive(Debug, Default)]
pub struct Compensator {
    artifacts: Vec<PathBuf>,
    settled: bool,
}

impl Compensator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a path that exists, or may partially exist, on disk.
    pub fn record(&mut self, path: &Path) {
        if !self.artifacts.iter().any(|p| p == path) {
            self.artifacts.push(path.to_path_buf());
        }
    }

    pub fn artifacts(&self) -> &[PathBuf] {
        &self.artifacts
    }

    /// Removes every recorded artifact, newest first. Returns how many files
    /// were actually deleted. Removal errors are logged and do not stop the
    /// remaining removals.
    pub fn compensate(&mut self) -> usize {
        self.settled = true;
        let mut removed = 0;
        for path in self.artifacts.drain(..).rev() {
            match remove_if_exists(&path) {
                Ok(true) => {
                    removed += 1;
                    info!(path = %path.display(), "Removed artifact of failed request");
                }
                Ok(false) => {}
                Err(e) => error!(path = %path.display(), "Failed to remove artifact: {}", e),
            }
        }
        removed
    }

    /// Keeps the artifacts; nothing will be removed.
    pub fn commit(mut self) {
        self.settled = true;
        self.artifacts.clear();
    }
}

impl Drop for Compensator {
    fn drop(&mut self) {
        if !self.settled && !self.artifacts.is_empty() {
            self.compensate();
        }
    }
}
