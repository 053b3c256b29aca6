//! Scoped ownership of per-task local files

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Removes every tracked file when dropped
///
/// Files that were never created are skipped silently; other removal errors
/// are logged and otherwise ignored.
#[derive(Debug, Default)]
pub struct TaskFiles {
    scan_id: Option<i64>,
    paths: Vec<PathBuf>,
}

impl TaskFiles {
    pub fn new(scan_id: i64) -> Self {
        Self {
            scan_id: Some(scan_id),
            paths: Vec::new(),
        }
    }

    /// Take ownership of `path` and return it for convenience
    pub fn track(&mut self, path: PathBuf) -> PathBuf {
        self.paths.push(path.clone());
        path
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Remove all tracked files now
    pub fn cleanup(&mut self) {
        for path in self.paths.drain(..) {
            remove_quietly(self.scan_id, &path);
        }
    }
}

impl Drop for TaskFiles {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn remove_quietly(scan_id: Option<i64>, path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(?scan_id, path = %path.display(), "Removed local file"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(
            ?scan_id,
            path = %path.display(),
            error = %e,
            "Could not delete local file"
        ),
    }
}
