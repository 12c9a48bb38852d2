//! Process invocation: one spawn-to-exit lifecycle of the external tool.
//!
//! The tool is started as `<tool> --backend <name> -`, fed its input on
//! stdin, and raced against a single deadline. Whatever happens, the call
//! resolves exactly once with a [`ProcessResult`]; it never returns an error.

pub mod retry;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{Instrument, debug, warn};

use crate::config::{DEFAULT_BACKEND, DEFAULT_TOOL};
use crate::telemetry::{metrics, work::start_invocation_span};

pub use retry::{RetryPolicy, execute_with_retry};

/// Environment variable carrying the per-attempt timeout to the child, in
/// milliseconds.
pub const TIMEOUT_ENV: &str = "CODEAGENT_TIMEOUT";

/// Marker the tool prints on stderr to report its session.
const SESSION_MARKER: &str = "SESSION_ID:";

// ---------------------------------------------------------------------------
// Process Result
// ---------------------------------------------------------------------------

/// Why an invocation did not succeed. The display strings are part of the
/// persisted task format.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvokeError {
    /// The process could not be started.
    #[error("{0}")]
    Spawn(String),

    /// Waiting on the process failed after it started.
    #[error("{0}")]
    Io(String),

    #[error("timeout")]
    Timeout,

    /// Exit 0 with nothing but whitespace on stdout. A stable negative
    /// answer, never retried.
    #[error("empty output")]
    EmptyOutput,

    #[error("exit code {0}")]
    ExitCode(i32),
}

/// Outcome of one invocation, as seen by the retry controller and the
/// scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessResult {
    pub success: bool,
    /// Trimmed stdout, or the raw partial stdout after a timeout.
    pub output: String,
    pub session_id: Option<String>,
    pub error: Option<InvokeError>,
    /// The tool signaled throttling. Informational only.
    pub is_rate_limited: bool,
}

impl ProcessResult {
    pub fn spawn_failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            session_id: None,
            error: Some(InvokeError::Spawn(message.into())),
            is_rate_limited: false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.error, Some(InvokeError::Timeout))
    }

    pub fn is_empty_output(&self) -> bool {
        matches!(self.error, Some(InvokeError::EmptyOutput))
    }

    /// Error text as persisted, if any.
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(|e| e.to_string())
    }

    fn outcome_label(&self) -> &'static str {
        match &self.error {
            None => "ok",
            Some(InvokeError::Spawn(_)) => "spawn_failed",
            Some(InvokeError::Io(_)) => "io_error",
            Some(InvokeError::Timeout) => "timeout",
            Some(InvokeError::EmptyOutput) => "empty_output",
            Some(InvokeError::ExitCode(_)) => "exit_code",
        }
    }
}

// ---------------------------------------------------------------------------
// Invoke
// ---------------------------------------------------------------------------

/// Something that runs one input through the external tool.
///
/// Implementations hold no state between calls.
#[async_trait]
pub trait Invoke: Send + Sync {
    async fn execute(&self, input: &str, work_dir: &Path, timeout: Duration) -> ProcessResult;
}

/// Which tool to spawn and which backend to ask it for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvokerConfig {
    pub tool: PathBuf,
    pub backend: String,
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            tool: PathBuf::from(DEFAULT_TOOL),
            backend: DEFAULT_BACKEND.to_string(),
        }
    }
}

/// Spawns the configured tool as a child process.
#[derive(Debug, Clone, Default)]
pub struct Invoker {
    config: InvokerConfig,
}

impl Invoker {
    pub fn new(config: InvokerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &InvokerConfig {
        &self.config
    }

    async fn run(&self, input: &str, work_dir: &Path, timeout: Duration) -> ProcessResult {
        let spawned = Command::new(&self.config.tool)
            .arg("--backend")
            .arg(&self.config.backend)
            .arg("-")
            .current_dir(work_dir)
            .env(TIMEOUT_ENV, timeout.as_millis().to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                warn!(tool = %self.config.tool.display(), error = %e, "failed to spawn tool");
                return ProcessResult::spawn_failure(e.to_string());
            }
        };

        let (Some(mut stdin), Some(mut stdout), Some(mut stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return ProcessResult::spawn_failure("child stdio was not captured");
        };

        // Written from its own task so a child that prints before reading
        // cannot deadlock against a full stdin pipe.
        let payload = input.to_owned();
        let writer = tokio::spawn(async move {
            if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                debug!(error = %e, "stdin write failed");
            }
        });

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let mut out = Vec::new();
        let mut err = Vec::new();
        let mut scanner = SessionScanner::default();
        let (mut out_open, mut err_open) = (true, true);

        let waited = loop {
            tokio::select! {
                read = stdout.read_buf(&mut out), if out_open => {
                    if !matches!(read, Ok(n) if n > 0) {
                        out_open = false;
                    }
                }
                read = stderr.read_buf(&mut err), if err_open => {
                    if matches!(read, Ok(n) if n > 0) {
                        scanner.scan(&err);
                    } else {
                        err_open = false;
                        scanner.finish(&err);
                    }
                }
                status = child.wait(), if !out_open && !err_open => break status,
                _ = &mut deadline => {
                    writer.abort();
                    if let Err(e) = child.start_kill() {
                        debug!(error = %e, "kill after timeout failed");
                    }
                    let _ = child.wait().await;
                    scanner.finish(&err);

                    let stderr_text = String::from_utf8_lossy(&err);
                    warn!(timeout_ms = timeout.as_millis() as u64, "tool timed out, killed");
                    return ProcessResult {
                        success: false,
                        output: String::from_utf8_lossy(&out).into_owned(),
                        session_id: scanner.session_id,
                        error: Some(InvokeError::Timeout),
                        is_rate_limited: is_rate_limited(None, &stderr_text),
                    };
                }
            }
        };
        writer.abort();

        let status = match waited {
            Ok(status) => status,
            Err(e) => {
                return ProcessResult {
                    success: false,
                    output: String::from_utf8_lossy(&out).trim().to_string(),
                    session_id: scanner.session_id,
                    error: Some(InvokeError::Io(e.to_string())),
                    is_rate_limited: false,
                };
            }
        };

        let output = String::from_utf8_lossy(&out).trim().to_string();
        let stderr_text = String::from_utf8_lossy(&err);
        let is_rate_limited = is_rate_limited(status.code(), &stderr_text);

        let error = if !status.success() {
            // No code means the child died from a signal.
            Some(InvokeError::ExitCode(status.code().unwrap_or(-1)))
        } else if output.is_empty() {
            Some(InvokeError::EmptyOutput)
        } else {
            None
        };

        if let Some(ref e) = error {
            debug!(error = %e, stderr = %stderr_text.trim(), "tool finished unsuccessfully");
        }

        ProcessResult {
            success: error.is_none(),
            output,
            session_id: scanner.session_id,
            error,
            is_rate_limited,
        }
    }
}

#[async_trait]
impl Invoke for Invoker {
    async fn execute(&self, input: &str, work_dir: &Path, timeout: Duration) -> ProcessResult {
        let span = start_invocation_span(&self.config.backend, &self.config.tool);
        let start = Instant::now();

        let result = self.run(input, work_dir, timeout).instrument(span).await;

        let backend = KeyValue::new("backend", self.config.backend.clone());
        metrics::invocations().add(
            1,
            &[backend.clone(), KeyValue::new("result", result.outcome_label())],
        );
        metrics::invocation_duration_ms()
            .record(start.elapsed().as_millis() as f64, &[backend.clone()]);
        if result.is_rate_limited {
            metrics::rate_limited().add(1, &[backend]);
        }

        result
    }
}

// ---------------------------------------------------------------------------
// Stream classification
// ---------------------------------------------------------------------------

/// Incremental search for the session marker over a growing stderr buffer.
/// Only complete lines are looked at until the stream closes.
#[derive(Debug, Default)]
struct SessionScanner {
    scanned: usize,
    session_id: Option<String>,
}

impl SessionScanner {
    fn scan(&mut self, buf: &[u8]) {
        if self.session_id.is_some() {
            return;
        }
        let Some(newline) = buf.iter().rposition(|&b| b == b'\n') else {
            return;
        };
        if newline < self.scanned {
            return;
        }
        self.session_id = parse_session_id(&String::from_utf8_lossy(&buf[self.scanned..=newline]));
        self.scanned = newline + 1;
    }

    fn finish(&mut self, buf: &[u8]) {
        if self.session_id.is_none() && self.scanned < buf.len() {
            self.session_id = parse_session_id(&String::from_utf8_lossy(&buf[self.scanned..]));
            self.scanned = buf.len();
        }
    }
}

/// First `SESSION_ID: <token>` found in `text`.
pub fn parse_session_id(text: &str) -> Option<String> {
    text.lines().find_map(|line| {
        let (_, rest) = line.split_once(SESSION_MARKER)?;
        rest.split_whitespace().next().map(str::to_string)
    })
}

/// Did the tool signal throttling or backend unavailability?
///
/// True for exit code 429, any "429" on stderr, "too many requests" in any
/// case, or a line pairing an HTTP 400 with "no available account".
pub fn is_rate_limited(exit_code: Option<i32>, stderr: &str) -> bool {
    if exit_code == Some(429) || stderr.contains("429") {
        return true;
    }
    let lower = stderr.to_lowercase();
    if lower.contains("too many requests") {
        return true;
    }
    lower.lines().any(|line| {
        line.find("400")
            .is_some_and(|at| line[at..].contains("no available account"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_is_first_marker_token() {
        let text = "starting\nSESSION_ID: abc-123 extra\nSESSION_ID: later\n";
        assert_eq!(parse_session_id(text).as_deref(), Some("abc-123"));
        assert_eq!(parse_session_id("nothing here"), None);
        assert_eq!(parse_session_id("SESSION_ID:   \n"), None);
    }

    #[test]
    fn scanner_waits_for_complete_lines() {
        let mut scanner = SessionScanner::default();
        let mut buf = b"SESSION_ID: ab".to_vec();
        scanner.scan(&buf);
        assert_eq!(scanner.session_id, None);

        buf.extend_from_slice(b"cd\nmore\n");
        scanner.scan(&buf);
        assert_eq!(scanner.session_id.as_deref(), Some("abcd"));
    }

    #[test]
    fn scanner_finish_reads_unterminated_tail() {
        let mut scanner = SessionScanner::default();
        let buf = b"log line\nSESSION_ID: tail-1".to_vec();
        scanner.scan(&buf);
        assert_eq!(scanner.session_id, None);
        scanner.finish(&buf);
        assert_eq!(scanner.session_id.as_deref(), Some("tail-1"));
    }

    #[test]
    fn rate_limit_signals() {
        assert!(is_rate_limited(Some(429), "anything at all"));
        assert!(is_rate_limited(Some(1), "upstream returned 429"));
        assert!(is_rate_limited(Some(1), "Error: Too Many Requests"));
        assert!(is_rate_limited(
            Some(1),
            "API Error: 400 {\"error\":\"No available account\"}"
        ));
        assert!(!is_rate_limited(Some(1), "no available account\nstatus 400"));
        assert!(!is_rate_limited(Some(0), "all good"));
        assert!(!is_rate_limited(None, ""));
    }

    #[test]
    fn error_strings_match_persisted_format() {
        assert_eq!(InvokeError::Timeout.to_string(), "timeout");
        assert_eq!(InvokeError::EmptyOutput.to_string(), "empty output");
        assert_eq!(InvokeError::ExitCode(3).to_string(), "exit code 3");
        assert_eq!(
            InvokeError::Spawn("No such file or directory (os error 2)".into()).to_string(),
            "No such file or directory (os error 2)"
        );
    }
}
