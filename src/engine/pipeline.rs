//! The three-stage task pipeline a batch is built from.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::model::{TaskItem, TaskUpdate};
use crate::worker::ProcessResult;

/// Discover work, turn each item into tool input, and make sense of what
/// the tool said.
///
/// Errors from [`build_input`](Pipeline::build_input) and
/// [`interpret_result`](Pipeline::interpret_result) fail only the item they
/// came from. An error from [`discover`](Pipeline::discover) fails the run,
/// since there is nothing to schedule.
#[async_trait]
pub trait Pipeline: Send + Sync + 'static {
    /// Enumerate candidate items under `root`. Ids must be stable across
    /// runs for resume to work.
    async fn discover(&self, root: &Path) -> anyhow::Result<Vec<TaskItem>>;

    /// Produce the stdin payload for one item.
    async fn build_input(&self, item: &TaskItem) -> anyhow::Result<String>;

    /// Inspect the tool's result, persist any derived artifact, and return
    /// what should be merged into the task record.
    ///
    /// Called for failed invocations too. Returning `TaskUpdate::new()`
    /// keeps the status the process outcome implies.
    async fn interpret_result(
        &self,
        item: &TaskItem,
        result: &ProcessResult,
    ) -> anyhow::Result<TaskUpdate>;

    /// Working directory for the tool when handling `item`.
    fn work_dir(&self, _item: &TaskItem, root: &Path) -> PathBuf {
        root.to_path_buf()
    }
}
