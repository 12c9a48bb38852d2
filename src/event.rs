//! Structured run events, appended to the batch log as JSON lines.
//!
//! The log is the run's history: what was started, skipped and finished,
//! and how long it took. It is write-only for the engine; nothing reads it
//! back to make decisions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::error::Result;
use crate::model::{RunSummary, Status, TaskId};

/// One line of the batch log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    /// Run that emitted the event. A log spans many runs.
    pub run_id: Uuid,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum EventKind {
    RunStarted {
        name: String,
        resume: bool,
        discovered: usize,
        scheduled: usize,
    },
    TaskSkipped {
        id: TaskId,
    },
    TaskStarted {
        id: TaskId,
    },
    TaskFinished {
        id: TaskId,
        status: Status,
        error: Option<String>,
        session_id: Option<String>,
        rate_limited: bool,
        duration_ms: u64,
    },
    RunFinished {
        summary: RunSummary,
        duration_ms: u64,
    },
}

/// Append-only writer for the batch log.
#[derive(Debug)]
pub struct RunLog {
    path: PathBuf,
    run_id: Uuid,
    file: Mutex<Option<tokio::fs::File>>,
}

impl RunLog {
    pub fn new(path: impl Into<PathBuf>, run_id: Uuid) -> Self {
        Self {
            path: path.into(),
            run_id,
            file: Mutex::new(None),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event. The log is not bookkeeping, so a failed write is
    /// reported and otherwise ignored.
    pub async fn record(&self, kind: EventKind) {
        let event = Event {
            timestamp: Utc::now(),
            run_id: self.run_id,
            kind,
        };
        if let Err(e) = self.append(&event).await {
            warn!(path = %self.path.display(), error = %e, "failed to append to run log");
        }
    }

    async fn append(&self, event: &Event) -> Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        if file.is_none() {
            if let Some(parent) = self.path.parent()
                && !parent.as_os_str().is_empty()
            {
                tokio::fs::create_dir_all(parent).await?;
            }
            let opened = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            *file = Some(opened);
        }
        if let Some(f) = file.as_mut() {
            f.write_all(&line).await?;
            f.flush().await?;
        }
        Ok(())
    }

    /// Read every event in the log at `path`, skipping lines that do not
    /// parse (written by a newer version, or torn by a crash).
    pub async fn read(path: &Path) -> Result<Vec<Event>> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!(error = %e, "skipping unreadable log line");
                    None
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn appends_and_reads_back() {
        let path = std::env::temp_dir()
            .join("workbatch-event")
            .join(Uuid::new_v4().to_string())
            .join(".b.log");
        let log = RunLog::new(&path, Uuid::new_v4());

        log.record(EventKind::TaskStarted { id: "a".into() }).await;
        log.record(EventKind::TaskSkipped { id: "b".into() }).await;

        let events = RunLog::read(&path).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].run_id, log.run_id());
        assert_eq!(events[1].kind, EventKind::TaskSkipped { id: "b".into() });
    }

    #[tokio::test]
    async fn torn_lines_are_skipped() {
        let path = std::env::temp_dir()
            .join("workbatch-event")
            .join(Uuid::new_v4().to_string())
            .join(".b.log");
        let log = RunLog::new(&path, Uuid::new_v4());
        log.record(EventKind::TaskStarted { id: "a".into() }).await;

        let mut content = tokio::fs::read_to_string(&path).await.unwrap();
        content.push_str("{\"timestamp\":\"2025-");
        tokio::fs::write(&path, content).await.unwrap();

        assert_eq!(RunLog::read(&path).await.unwrap().len(), 1);
    }
}
