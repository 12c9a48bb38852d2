//! Integration tests for job files and the file pipeline.

use async_trait::async_trait;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use workbatch::engine::{Pipeline, RunOptions, Scheduler};
use workbatch::job::{FilePipeline, JobConfig, extract_json};
use workbatch::model::*;
use workbatch::worker::{Invoke, ProcessResult};

fn scratch_dir() -> PathBuf {
    std::env::temp_dir()
        .join("workbatch-job")
        .join(uuid::Uuid::new_v4().to_string())
}

fn write(root: &Path, relative: &str, content: &str) {
    let path = root.join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

fn ok(output: &str) -> ProcessResult {
    ProcessResult {
        success: true,
        output: output.to_string(),
        session_id: None,
        error: None,
        is_rate_limited: false,
    }
}

// ---------------------------------------------------------------------------
// Job file
// ---------------------------------------------------------------------------

#[test]
fn job_file_overrides_scheduler_defaults() {
    let job = JobConfig::parse(
        r#"
        [job]
        name = "audit"
        concurrency = 4
        timeout_ms = 600000
        max_retries = 2
        extensions = ["rs"]
        exclude = ["target"]
        output_dir = "out"
        prompt = "Review {path}:\n{content}"
        "#,
    )
    .unwrap();

    let config = job.scheduler_config(Path::new("/state"));
    assert_eq!(config.name, "audit");
    assert_eq!(config.concurrency, 4);
    assert_eq!(config.timeout, Duration::from_millis(600_000));
    assert_eq!(config.max_retries, 2);
    assert_eq!(config.retry_delay, Duration::from_millis(5000));
    assert_eq!(config.state_dir, PathBuf::from("/state"));
    assert_eq!(job.output_dir(Path::new("/state")), PathBuf::from("out"));
}

#[test]
fn minimal_job_file_uses_defaults() {
    let job = JobConfig::parse("[job]\nname = \"lint\"\n").unwrap();
    assert_eq!(job.prompt, "{content}");
    assert!(job.extensions.is_empty());
    assert_eq!(
        job.output_dir(Path::new("/state")),
        PathBuf::from("/state/batches/lint-out")
    );
    assert_eq!(job.scheduler_config(Path::new("/state")).concurrency, 6);
}

#[test]
fn bad_job_files_are_rejected() {
    assert!(JobConfig::parse("name = \"no table\"").is_err());
    assert!(JobConfig::parse("[job]\nname = \"\"").is_err());
    assert!(JobConfig::parse("[job]\nname = \"a/b\"").is_err());
    assert!(JobConfig::parse("[job]\nname = \"a\"\nconcurrency = 0").is_err());

    let err = JobConfig::load(Path::new("/definitely/not/here.toml")).unwrap_err();
    assert!(matches!(err, workbatch::error::Error::Config(_)));
}

// ---------------------------------------------------------------------------
// File pipeline
// ---------------------------------------------------------------------------

#[tokio::test]
async fn discovers_matching_files_in_name_order() {
    let root = scratch_dir();
    write(&root, "src/main.rs", "fn main() {}");
    write(&root, "src/lib.rs", "pub mod a;");
    write(&root, "src/a/mod.rs", "");
    write(&root, "README.md", "# hi");
    write(&root, "target/debug/build.rs", "");

    let pipeline = FilePipeline::new(root.join("out"), "{content}")
        .extensions(vec!["rs".into()])
        .exclude(vec!["target".into()]);
    let items = pipeline.discover(&root).await.unwrap();

    let ids: Vec<_> = items.iter().map(|i| i.id.as_str()).collect();
    // Files of a directory come before the contents of its subdirectories.
    assert_eq!(ids, vec!["src/lib.rs", "src/main.rs", "src/a/mod.rs"]);
    assert_eq!(items[0].path, root.join("src/lib.rs"));
    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn build_input_fills_the_prompt() {
    let root = scratch_dir();
    write(&root, "notes.txt", "remember the milk");

    let pipeline = FilePipeline::new(root.join("out"), "File {path}\n---\n{content}");
    let items = pipeline.discover(&root).await.unwrap();
    let input = pipeline.build_input(&items[0]).await.unwrap();

    assert_eq!(input, "File notes.txt\n---\nremember the milk");
    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn interpret_writes_artifact_or_fails() {
    let root = scratch_dir();
    let pipeline = FilePipeline::new(root.join("out"), "{content}");
    let item = TaskItem::new("src/lib.rs", root.join("src/lib.rs"));

    let update = pipeline
        .interpret_result(&item, &ok("Looks fine.\n{\"issues\": []}"))
        .await
        .unwrap();
    let artifact = root.join("out").join("src__lib.rs.json");
    assert_eq!(update.state, None);
    assert_eq!(update.context, Some(json!({"artifact": artifact})));
    let written: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&artifact).unwrap()).unwrap();
    assert_eq!(written, json!({"issues": []}));

    let err = pipeline
        .interpret_result(&item, &ok("I could not decide."))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "no JSON payload in output");

    let mut failed = ok("");
    failed.success = false;
    let update = pipeline.interpret_result(&item, &failed).await.unwrap();
    assert_eq!(update, TaskUpdate::new());
    let _ = std::fs::remove_dir_all(&root);
}

#[test]
fn extraction_handles_prose_and_fences() {
    assert_eq!(
        extract_json("Sure!\n```json\n[1, 2]\n```"),
        Some(json!([1, 2]))
    );
    assert_eq!(
        extract_json("score follows {\"score\": 9} and {\"score\": 1}"),
        Some(json!({"score": 9}))
    );
}

// ---------------------------------------------------------------------------
// End to end
// ---------------------------------------------------------------------------

/// Answers every prompt with a JSON verdict wrapped in prose, except for
/// prompts mentioning "vague".
struct Reviewer;

#[async_trait]
impl Invoke for Reviewer {
    async fn execute(&self, input: &str, _work_dir: &Path, _timeout: Duration) -> ProcessResult {
        if input.contains("vague") {
            return ok("Hard to say.");
        }
        ok(&format!(
            "Here is my review.\n```json\n{{\"chars\": {}}}\n```",
            input.len()
        ))
    }
}

#[tokio::test]
async fn job_runs_end_to_end() {
    let root = scratch_dir();
    write(&root, "a.md", "alpha");
    write(&root, "b.md", "vague");
    write(&root, "skip/c.md", "never seen");

    let state_dir = root.join(".state");
    let job = JobConfig::parse(
        "[job]\nname = \"docs\"\nextensions = [\"md\"]\nexclude = [\"skip\", \".state\"]\nmax_retries = 0\n",
    )
    .unwrap();
    let scheduler = Scheduler::new(job.scheduler_config(&state_dir), Arc::new(Reviewer));

    let report = scheduler
        .run(
            Arc::new(job.pipeline(&state_dir)),
            RunOptions {
                resume: false,
                root_dir: root.clone(),
            },
        )
        .await
        .unwrap();

    assert_eq!(report.summary.total, 2);
    assert_eq!(report.summary.completed, 1);
    assert_eq!(report.summary.failed, 1);

    let b = report.tasks.iter().find(|t| t.id.as_str() == "b.md").unwrap();
    assert_eq!(b.error(), Some("no JSON payload in output"));

    let artifact = state_dir.join("batches/docs-out/a.md.json");
    let written: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(artifact).unwrap()).unwrap();
    assert_eq!(written, json!({"chars": 5}));
    let _ = std::fs::remove_dir_all(&root);
}
