//! Error types for workbatch.
//!
//! Only bookkeeping failures surface here. Per-task outcomes (timeouts,
//! non-zero exits, handler errors) are recorded in the task store instead
//! of being propagated.

use thiserror::Error;

use crate::model::{Status, TaskId};

#[derive(Debug, Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("invalid state transition for task {id}: {from} -> {to}")]
    InvalidTransition { id: TaskId, from: Status, to: Status },

    #[error("discovery failed: {0}")]
    Discovery(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
