//! Coarse run-level progress snapshot.
//!
//! Written when a run starts and removed when it ends. Everything in it can
//! be rebuilt from the task store, so losing it is harmless.

use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::Result;
use crate::model::ProgressSnapshot;
use crate::storage::write_json_atomic;

#[derive(Debug, Clone)]
pub struct ProgressTracker {
    path: PathBuf,
}

impl ProgressTracker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The last snapshot, or the idle default when there is none.
    ///
    /// An unreadable snapshot is treated as absent.
    pub async fn load(&self) -> ProgressSnapshot {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %self.path.display(), error = %e, "cannot read progress snapshot");
                }
                return ProgressSnapshot::default();
            }
        };
        serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!(path = %self.path.display(), error = %e, "ignoring corrupt progress snapshot");
            ProgressSnapshot::default()
        })
    }

    pub async fn save(&self, snapshot: &ProgressSnapshot) -> Result<()> {
        write_json_atomic(&self.path, snapshot).await
    }

    /// Remove the snapshot. Missing is fine.
    pub async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
