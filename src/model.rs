//! Core data model.
//!
//! A task item is a unit of work found by discovery. A task record is the
//! persisted lifecycle of that item. The run summary is never stored on its
//! own; it is always recomputed from the records it describes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Every task record of a batch, keyed by id.
pub type TaskMap = BTreeMap<TaskId, TaskRecord>;

// ---------------------------------------------------------------------------
// Task Item
// ---------------------------------------------------------------------------

/// Stable identifier of a task item. Survives across runs, which is what
/// makes resume possible.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A discovered unit of work. Immutable once discovery returns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskItem {
    pub id: TaskId,

    /// Location the item was discovered at.
    pub path: PathBuf,

    /// Pipeline-specific data. The engine never looks inside.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl TaskItem {
    pub fn new(id: impl Into<TaskId>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a task, without the data attached to each state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Seen, not yet started.
    Pending,
    /// Admitted to the pool; the external tool may be running.
    Running,
    /// Done successfully. Terminal, and skipped by a resumed run.
    Completed,
    /// Failed after retries, or rejected by the pipeline.
    Failed,
    /// Last attempt hit the per-attempt timeout.
    Timeout,
}

impl Status {
    /// Can a record move from self to `to`?
    ///
    /// Nothing ever returns to `Pending`. Failed, timed-out and stale
    /// running records may be re-armed by a resumed run; completed ones
    /// cannot.
    pub fn can_transition_to(self, to: Status) -> bool {
        use Status::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Timeout)
                | (Running, Running) // left mid-flight by a crashed run
                | (Failed, Running)
                | (Timeout, Running)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed | Status::Timeout)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Pending => "pending",
            Status::Running => "running",
            Status::Completed => "completed",
            Status::Failed => "failed",
            Status::Timeout => "timeout",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Task State
// ---------------------------------------------------------------------------

/// Lifecycle state with the data each state carries.
///
/// Serialized inline into the task record as `"status": "<name>"` plus the
/// variant's fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed {
        error: String,
    },
    Timeout {
        #[serde(default = "timeout_error")]
        error: String,
        /// Tail of the stdout captured before the child was killed.
        #[serde(
            rename = "partialOutput",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        partial_output: Option<String>,
    },
}

/// Error text persisted on every timed-out record.
pub const TIMEOUT_ERROR: &str = "timeout";

fn timeout_error() -> String {
    TIMEOUT_ERROR.to_string()
}

impl TaskState {
    pub fn failed(error: impl Into<String>) -> Self {
        TaskState::Failed {
            error: error.into(),
        }
    }

    pub fn timeout(partial_output: Option<String>) -> Self {
        TaskState::Timeout {
            error: timeout_error(),
            partial_output,
        }
    }

    pub fn status(&self) -> Status {
        match self {
            TaskState::Pending => Status::Pending,
            TaskState::Running => Status::Running,
            TaskState::Completed => Status::Completed,
            TaskState::Failed { .. } => Status::Failed,
            TaskState::Timeout { .. } => Status::Timeout,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            TaskState::Failed { error } | TaskState::Timeout { error, .. } => {
                Some(error.as_str())
            }
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Task Record
// ---------------------------------------------------------------------------

/// Persisted lifecycle record for one task item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: TaskId,

    #[serde(flatten)]
    pub state: TaskState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// Session marker reported by the external tool on stderr.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    /// Whatever the pipeline chose to keep about the result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,

    /// How many times the task has been admitted to the pool.
    #[serde(default)]
    pub runs: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    pub fn new(id: TaskId) -> Self {
        let now = Utc::now();
        Self {
            id,
            state: TaskState::Pending,
            path: None,
            session_id: None,
            context: None,
            runs: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn status(&self) -> Status {
        self.state.status()
    }

    pub fn error(&self) -> Option<&str> {
        self.state.error()
    }

    /// Merge an update onto this record.
    ///
    /// Fields left `None` in the update keep their current value. A state
    /// change is checked against [`Status::can_transition_to`] before
    /// anything is written, so a rejected update leaves the record as it
    /// was.
    pub fn apply(&mut self, update: TaskUpdate) -> Result<()> {
        let now = Utc::now();

        if let Some(state) = update.state {
            let (from, to) = (self.status(), state.status());
            if !from.can_transition_to(to) {
                return Err(Error::InvalidTransition {
                    id: self.id.clone(),
                    from,
                    to,
                });
            }
            if to == Status::Running {
                self.runs += 1;
                self.started_at = Some(now);
                self.finished_at = None;
            } else if to.is_terminal() {
                self.finished_at = Some(now);
            }
            self.state = state;
        }

        if let Some(path) = update.path {
            self.path = Some(path);
        }
        if let Some(session_id) = update.session_id {
            self.session_id = Some(session_id);
        }
        if let Some(context) = update.context {
            self.context = Some(context);
        }

        self.updated_at = now;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Task Update
// ---------------------------------------------------------------------------

/// A partial task record. The only way task records change.
///
/// The scheduler builds one update from the process result and merges the
/// pipeline's own update on top of it, so the pipeline has the last word.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    pub state: Option<TaskState>,
    pub path: Option<PathBuf>,
    pub session_id: Option<String>,
    pub context: Option<serde_json::Value>,
}

impl TaskUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn running() -> Self {
        Self::new().state(TaskState::Running)
    }

    pub fn completed() -> Self {
        Self::new().state(TaskState::Completed)
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self::new().state(TaskState::failed(error))
    }

    pub fn state(mut self, state: TaskState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }

    /// Combine two updates; every field set in `later` wins.
    pub fn merge(self, later: TaskUpdate) -> Self {
        Self {
            state: later.state.or(self.state),
            path: later.path.or(self.path),
            session_id: later.session_id.or(self.session_id),
            context: later.context.or(self.context),
        }
    }
}

// ---------------------------------------------------------------------------
// Run Summary
// ---------------------------------------------------------------------------

/// Task counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub timeout: usize,
}

impl RunSummary {
    /// Partition records by status.
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a TaskRecord>) -> Self {
        let mut summary = Self::default();
        for record in records {
            summary.total += 1;
            match record.status() {
                Status::Pending => summary.pending += 1,
                Status::Running => summary.running += 1,
                Status::Completed => summary.completed += 1,
                Status::Failed => summary.failed += 1,
                Status::Timeout => summary.timeout += 1,
            }
        }
        summary
    }
}

// ---------------------------------------------------------------------------
// Progress Snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    #[default]
    Idle,
    Running,
}

/// Coarse run-level view for status polling. Never authoritative: the task
/// store holds the truth.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub status: ProgressStatus,
    #[serde(default)]
    pub items: Vec<TaskId>,
    #[serde(default)]
    pub completed: Vec<TaskId>,
    #[serde(default)]
    pub results: Vec<serde_json::Value>,
}
