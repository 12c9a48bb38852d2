//! Integration tests for the process invoker, with small shell scripts
//! standing in for the external tool.
#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use workbatch::worker::{Invoke, InvokeError, Invoker, InvokerConfig};

// Writing an executable while another test forks can make exec fail with
// ETXTBSY, so the tests in this file take turns.
static SERIAL: Mutex<()> = Mutex::const_new(());

fn scratch_dir() -> PathBuf {
    let dir = std::env::temp_dir()
        .join("workbatch-invoker")
        .join(uuid::Uuid::new_v4().to_string());
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn script(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("tool.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn invoker(tool: PathBuf) -> Invoker {
    Invoker::new(InvokerConfig {
        tool,
        backend: "codex".to_string(),
    })
}

#[tokio::test]
async fn feeds_stdin_and_passes_backend_and_timeout() {
    let _serial = SERIAL.lock().await;
    let dir = scratch_dir();
    let tool = script(
        &dir,
        r#"printf '%s ' "$@"; echo "timeout=$CODEAGENT_TIMEOUT"; cat"#,
    );

    let result = invoker(tool)
        .execute("hello from stdin\n", &dir, Duration::from_millis(5000))
        .await;

    assert!(result.success, "{result:?}");
    assert_eq!(result.error, None);
    assert_eq!(
        result.output,
        "--backend codex - timeout=5000\nhello from stdin"
    );
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn session_id_is_read_from_stderr() {
    let _serial = SERIAL.lock().await;
    let dir = scratch_dir();
    let tool = script(&dir, "echo 'SESSION_ID: sess-42' >&2\necho '{\"ok\": true}'");

    let result = invoker(tool)
        .execute("", &dir, Duration::from_millis(5000))
        .await;

    assert!(result.success);
    assert_eq!(result.session_id.as_deref(), Some("sess-42"));
    assert_eq!(result.output, "{\"ok\": true}");
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn whitespace_only_stdout_is_empty_output() {
    let _serial = SERIAL.lock().await;
    let dir = scratch_dir();
    let tool = script(&dir, "printf '  \\n\\t\\n'");

    let result = invoker(tool)
        .execute("x", &dir, Duration::from_millis(5000))
        .await;

    assert!(!result.success);
    assert_eq!(result.error, Some(InvokeError::EmptyOutput));
    assert_eq!(result.error_message().as_deref(), Some("empty output"));
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn non_zero_exit_is_reported_with_code() {
    let _serial = SERIAL.lock().await;
    let dir = scratch_dir();
    let tool = script(&dir, "echo 'partial answer'\necho 'boom' >&2\nexit 3");

    let result = invoker(tool)
        .execute("x", &dir, Duration::from_millis(5000))
        .await;

    assert!(!result.success);
    assert_eq!(result.error_message().as_deref(), Some("exit code 3"));
    assert!(!result.is_rate_limited);
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn exit_429_is_rate_limited() {
    let _serial = SERIAL.lock().await;
    let dir = scratch_dir();
    let tool = script(&dir, "echo 'slow down' >&2\nexit 429");

    let result = invoker(tool)
        .execute("x", &dir, Duration::from_millis(5000))
        .await;

    assert!(!result.success);
    assert!(result.is_rate_limited);
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn missing_tool_is_a_spawn_failure() {
    let _serial = SERIAL.lock().await;
    let dir = scratch_dir();

    let result = invoker(dir.join("does-not-exist"))
        .execute("x", &dir, Duration::from_millis(5000))
        .await;

    assert!(!result.success);
    assert!(matches!(result.error, Some(InvokeError::Spawn(_))));
    assert!(result.output.is_empty());
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn timeout_kills_child_and_keeps_partial_output() {
    let _serial = SERIAL.lock().await;
    let dir = scratch_dir();
    let tool = script(&dir, "echo 'SESSION_ID: slow-1' >&2\necho 'partial'\nexec sleep 30");

    let start = Instant::now();
    let result = invoker(tool)
        .execute("x", &dir, Duration::from_millis(500))
        .await;

    assert!(start.elapsed() < Duration::from_secs(10));
    assert!(!result.success);
    assert!(result.is_timeout());
    assert_eq!(result.error_message().as_deref(), Some("timeout"));
    assert_eq!(result.output, "partial\n");
    assert_eq!(result.session_id.as_deref(), Some("slow-1"));
    let _ = std::fs::remove_dir_all(&dir);
}
