//! Batch scheduler: discover items, then push each one through the
//! pipeline under a bounded pool, keeping the task store current as items
//! finish.

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{Instrument, error, info, warn};
use uuid::Uuid;

use super::pipeline::Pipeline;
use crate::config::DEFAULT_STATE_DIR;
use crate::error::{Error, Result};
use crate::event::{EventKind, RunLog};
use crate::model::*;
use crate::progress::ProgressTracker;
use crate::storage::{TaskStore, write_json_atomic};
use crate::telemetry::metrics;
use crate::telemetry::work::{record_state_transition, start_task_span};
use crate::worker::{Invoke, ProcessResult, RetryPolicy, execute_with_retry};

/// Subdirectory of the state directory holding every batch's files.
pub const BATCH_DIR: &str = "batches";

/// Bytes of stdout kept on a timed-out task record.
const PARTIAL_OUTPUT_TAIL: usize = 4096;

/// Configuration for one named batch.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Namespaces every persisted file of the batch.
    pub name: String,
    /// Items in flight at once.
    pub concurrency: usize,
    /// Per-attempt limit for the external tool.
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub state_dir: PathBuf,
}

impl SchedulerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            concurrency: 6,
            timeout: Duration::from_millis(1_800_000),
            max_retries: 3,
            retry_delay: Duration::from_millis(5000),
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.retry_delay)
    }
}

/// Where a batch keeps its files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    pub log: PathBuf,
    pub progress: PathBuf,
    pub result: PathBuf,
    pub tasks: PathBuf,
}

impl RunPaths {
    pub fn new(state_dir: &Path, name: &str) -> Self {
        let dir = state_dir.join(BATCH_DIR);
        Self {
            log: dir.join(format!(".{name}.log")),
            progress: dir.join(format!("{name}-progress.json")),
            result: dir.join(format!("{name}-result.json")),
            tasks: dir.join(format!("{name}-tasks.json")),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Skip items the task store already records as completed.
    pub resume: bool,
    /// Handed to discovery, and the default working directory of the tool.
    pub root_dir: PathBuf,
}

/// Final aggregate of a run, written to `<name>-result.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub name: String,
    pub run_id: Uuid,
    pub resumed: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub summary: RunSummary,
    /// Items not run because a previous run completed them.
    pub skipped: Vec<TaskId>,
    pub tasks: Vec<TaskRecord>,
}

/// Everything a single item needs while it runs.
struct ItemContext {
    batch: String,
    root: PathBuf,
    timeout: Duration,
    policy: RetryPolicy,
    invoker: Arc<dyn Invoke>,
    store: Arc<Mutex<TaskStore>>,
    log: Arc<RunLog>,
}

/// Drives a pipeline over a batch of items.
pub struct Scheduler {
    config: SchedulerConfig,
    paths: RunPaths,
    invoker: Arc<dyn Invoke>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, invoker: Arc<dyn Invoke>) -> Self {
        let paths = RunPaths::new(&config.state_dir, &config.name);
        Self {
            config,
            paths,
            invoker,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn paths(&self) -> &RunPaths {
        &self.paths
    }

    /// Peek at the persisted task store.
    pub async fn status(&self) -> Result<serde_json::Value> {
        TaskStore::status(&self.config.name, &self.paths.tasks).await
    }

    /// The last result file, verbatim, if a run ever finished.
    pub async fn last_result(&self) -> Result<Option<String>> {
        match tokio::fs::read_to_string(&self.paths.result).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn progress(&self) -> ProgressTracker {
        ProgressTracker::new(&self.paths.progress)
    }

    /// Run the batch to exhaustion.
    ///
    /// Individual items never fail the run. It fails only when discovery
    /// fails or the task store cannot be read or written; in-flight items
    /// are then aborted and the store keeps whatever was last persisted.
    pub async fn run<P: Pipeline>(
        &self,
        pipeline: Arc<P>,
        options: RunOptions,
    ) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let start = Instant::now();
        let log = Arc::new(RunLog::new(&self.paths.log, run_id));
        let progress = self.progress();

        let discovered = pipeline
            .discover(&options.root_dir)
            .await
            .map_err(|e| Error::Discovery(format!("{e:#}")))?;
        let items = dedup_items(discovered);

        let mut store = if options.resume {
            TaskStore::open(&self.config.name, &self.paths.tasks).await?
        } else {
            TaskStore::fresh(&self.config.name, &self.paths.tasks)
        };

        let (skipped, pending): (Vec<TaskItem>, Vec<TaskItem>) =
            items.into_iter().partition(|item| {
                options.resume
                    && store
                        .get(&item.id)
                        .is_some_and(|r| r.status() == Status::Completed)
            });
        store.observe(&pending).await?;

        info!(
            batch = %self.config.name,
            %run_id,
            resume = options.resume,
            scheduled = pending.len(),
            skipped = skipped.len(),
            concurrency = self.config.concurrency,
            "batch started"
        );
        log.record(EventKind::RunStarted {
            name: self.config.name.clone(),
            resume: options.resume,
            discovered: pending.len() + skipped.len(),
            scheduled: pending.len(),
        })
        .await;
        for item in &skipped {
            log.record(EventKind::TaskSkipped { id: item.id.clone() })
                .await;
        }

        let snapshot = ProgressSnapshot {
            status: ProgressStatus::Running,
            items: pending.iter().chain(&skipped).map(|i| i.id.clone()).collect(),
            completed: skipped.iter().map(|i| i.id.clone()).collect(),
            results: Vec::new(),
        };
        if let Err(e) = progress.save(&snapshot).await {
            warn!(error = %e, "failed to write progress snapshot");
        }

        let store = Arc::new(Mutex::new(store));
        let ctx = Arc::new(ItemContext {
            batch: self.config.name.clone(),
            root: options.root_dir.clone(),
            timeout: self.config.timeout,
            policy: self.config.retry_policy(),
            invoker: Arc::clone(&self.invoker),
            store: Arc::clone(&store),
            log: Arc::clone(&log),
        });

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut join_set: JoinSet<Result<()>> = JoinSet::new();
        let mut in_flight: HashMap<tokio::task::Id, TaskId> = HashMap::new();
        let mut failure: Option<Error> = None;

        // Admission in discovery order; each item holds its permit until
        // it reaches a terminal state.
        for item in pending {
            while let Some(joined) = join_set.try_join_next_with_id() {
                self.reap(joined, &mut in_flight, &store, &mut failure)
                    .await;
            }
            if failure.is_some() {
                break;
            }

            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let ctx = Arc::clone(&ctx);
            let pipeline = Arc::clone(&pipeline);
            let id = item.id.clone();
            let handle = join_set.spawn(async move {
                let _permit = permit;
                run_item(ctx, pipeline, item).await
            });
            in_flight.insert(handle.id(), id);
        }

        while let Some(joined) = join_set.join_next_with_id().await {
            self.reap(joined, &mut in_flight, &store, &mut failure)
                .await;
            if failure.is_some() {
                join_set.abort_all();
            }
        }

        if let Some(e) = failure {
            error!(batch = %self.config.name, %run_id, error = %e, "batch aborted");
            return Err(e);
        }

        let report = {
            let store = store.lock().await;
            RunReport {
                name: self.config.name.clone(),
                run_id,
                resumed: options.resume,
                started_at,
                finished_at: Utc::now(),
                summary: store.summary(),
                skipped: skipped.into_iter().map(|i| i.id).collect(),
                tasks: store.tasks().values().cloned().collect(),
            }
        };
        write_json_atomic(&self.paths.result, &report).await?;
        if let Err(e) = progress.clear().await {
            warn!(error = %e, "failed to clear progress snapshot");
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        log.record(EventKind::RunFinished {
            summary: report.summary,
            duration_ms,
        })
        .await;
        info!(
            batch = %self.config.name,
            %run_id,
            total = report.summary.total,
            completed = report.summary.completed,
            failed = report.summary.failed,
            timeout = report.summary.timeout,
            duration_ms,
            "batch finished"
        );

        Ok(report)
    }

    /// Account for one finished item task.
    async fn reap(
        &self,
        joined: std::result::Result<(tokio::task::Id, Result<()>), JoinError>,
        in_flight: &mut HashMap<tokio::task::Id, TaskId>,
        store: &Mutex<TaskStore>,
        failure: &mut Option<Error>,
    ) {
        match joined {
            Ok((task, Ok(()))) => {
                in_flight.remove(&task);
            }
            Ok((task, Err(e))) => {
                let id = in_flight.remove(&task);
                error!(task = ?id, error = %e, "task store failure");
                failure.get_or_insert(e);
            }
            Err(join_error) => {
                let id = in_flight.remove(&join_error.id());
                if !join_error.is_panic() {
                    return;
                }
                let message = panic_message(join_error);
                let Some(id) = id else {
                    return;
                };
                error!(id = %id, panic = %message, "task panicked");
                let mut store = store.lock().await;
                if store.get(&id).is_some_and(|r| r.status().is_terminal()) {
                    return;
                }
                // Recorded like any other handler failure.
                let update = TaskUpdate::failed(format!("panicked: {message}"));
                if let Err(e) = store.update(&id, update).await {
                    failure.get_or_insert(e);
                }
            }
        }
    }
}

/// Take one item from pending to a terminal state.
///
/// Only task store failures are returned; everything else ends up on the
/// task record.
async fn run_item<P: Pipeline>(
    ctx: Arc<ItemContext>,
    pipeline: Arc<P>,
    item: TaskItem,
) -> Result<()> {
    let span = start_task_span(&ctx.batch, item.id.as_str());

    async {
        let start = Instant::now();
        let previous = {
            let mut store = ctx.store.lock().await;
            let previous = store
                .get(&item.id)
                .map(|r| r.status())
                .unwrap_or(Status::Pending);
            store
                .update(&item.id, TaskUpdate::running().path(item.path.clone()))
                .await?;
            previous
        };
        record_state_transition(&span, &previous.to_string(), "running");
        ctx.log
            .record(EventKind::TaskStarted { id: item.id.clone() })
            .await;

        let (update, result) = match pipeline.build_input(&item).await {
            Err(e) => (TaskUpdate::failed(format!("{e:#}")), None),
            Ok(input) => {
                let work_dir = pipeline.work_dir(&item, &ctx.root);
                let result = execute_with_retry(
                    ctx.invoker.as_ref(),
                    &input,
                    &work_dir,
                    ctx.timeout,
                    ctx.policy,
                )
                .await;
                let handler = pipeline
                    .interpret_result(&item, &result)
                    .await
                    .unwrap_or_else(|e| TaskUpdate::failed(format!("{e:#}")));
                (settle(process_update(&result), handler), Some(result))
            }
        };

        let record = ctx.store.lock().await.update(&item.id, update).await?;
        let status = record.status();
        let duration_ms = start.elapsed().as_millis() as u64;

        record_state_transition(&span, "running", &status.to_string());
        metrics::task_outcomes().add(
            1,
            &[
                KeyValue::new("batch", ctx.batch.clone()),
                KeyValue::new("status", status.to_string()),
            ],
        );
        ctx.log
            .record(EventKind::TaskFinished {
                id: item.id.clone(),
                status,
                error: record.error().map(str::to_string),
                session_id: record.session_id.clone(),
                rate_limited: result.as_ref().is_some_and(|r| r.is_rate_limited),
                duration_ms,
            })
            .await;

        match record.error() {
            None => info!(duration_ms, "task completed"),
            Some(error) => warn!(%status, error, duration_ms, "task did not complete"),
        }
        Ok(())
    }
    .instrument(span.clone())
    .await
}

/// What the process outcome alone says about the task.
fn process_update(result: &ProcessResult) -> TaskUpdate {
    let state = if result.success {
        TaskState::Completed
    } else if result.is_timeout() {
        let partial = tail(&result.output, PARTIAL_OUTPUT_TAIL);
        TaskState::Timeout {
            error: result
                .error_message()
                .unwrap_or_else(|| TIMEOUT_ERROR.to_string()),
            partial_output: (!partial.is_empty()).then(|| partial.to_string()),
        }
    } else {
        TaskState::failed(
            result
                .error_message()
                .unwrap_or_else(|| "unknown failure".to_string()),
        )
    };

    let update = TaskUpdate::new().state(state);
    match &result.session_id {
        Some(session_id) => update.session_id(session_id.clone()),
        None => update,
    }
}

/// Merge the pipeline's update over the process outcome. The pipeline may
/// pick any terminal state; anything else falls back to the process one.
fn settle(process: TaskUpdate, handler: TaskUpdate) -> TaskUpdate {
    let fallback = process.state.clone();
    let mut merged = process.merge(handler);
    if !merged
        .state
        .as_ref()
        .is_some_and(|s| s.status().is_terminal())
    {
        warn!("pipeline returned a non-terminal state, keeping the process outcome");
        merged.state = fallback;
    }
    merged
}

/// Drop items whose id was already discovered. First one wins.
fn dedup_items(items: Vec<TaskItem>) -> Vec<TaskItem> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| {
            let fresh = seen.insert(item.id.clone());
            if !fresh {
                warn!(id = %item.id, "duplicate task id from discovery, ignoring");
            }
            fresh
        })
        .collect()
}

/// Last `max` bytes of `s`, moved forward to a char boundary.
fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

fn panic_message(join_error: JoinError) -> String {
    let payload = join_error.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
