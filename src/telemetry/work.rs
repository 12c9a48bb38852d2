//! Task and invocation span helpers.
//!
//! One span covers a task from admission to its final state; a child span
//! covers each spawn of the external tool.

use std::path::Path;
use tracing::Span;

/// Start a span for one task of a batch.
///
/// The `task.status` field is declared empty and filled in once the task
/// reaches a terminal state.
pub fn start_task_span(batch: &str, task_id: &str) -> Span {
    tracing::info_span!(
        "task.execute",
        "batch.name" = batch,
        "task.id" = task_id,
        "task.status" = tracing::field::Empty,
    )
}

/// Start a span for one spawn of the external tool.
pub fn start_invocation_span(backend: &str, tool: &Path) -> Span {
    tracing::info_span!(
        "tool.invoke",
        "tool.backend" = backend,
        "tool.path" = %tool.display(),
    )
}

/// Record a state transition event on the given span.
///
/// Emits a tracing `info` event scoped to the span and, for terminal
/// states, fills in `task.status`.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("task.status", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
