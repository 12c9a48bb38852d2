//! Typed configuration from environment variables.
//!
//! Loads once at startup. Every value has a default, so a bare
//! environment yields a working config; malformed values fail fast.

use crate::error::{Error, Result};
use crate::worker::InvokerConfig;
use std::path::PathBuf;

/// Default external tool spawned for every task.
pub const DEFAULT_TOOL: &str = "codeagent-wrapper";

/// Default backend passed as `--backend <name>`.
pub const DEFAULT_BACKEND: &str = "codex";

/// Default directory holding persisted batch state.
pub const DEFAULT_STATE_DIR: &str = ".workbatch";

#[derive(Debug, Clone)]
pub struct Config {
    /// Executable invoked per task.
    pub tool: PathBuf,
    /// Backend identifier forwarded to the tool.
    pub backend: String,
    /// Root of the persisted state (tasks, progress, result, log).
    pub state_dir: PathBuf,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            tool: PathBuf::from(
                non_empty_var("WORKBATCH_TOOL")?.unwrap_or_else(|| DEFAULT_TOOL.to_string()),
            ),
            backend: non_empty_var("WORKBATCH_BACKEND")?
                .unwrap_or_else(|| DEFAULT_BACKEND.to_string()),
            state_dir: PathBuf::from(
                non_empty_var("WORKBATCH_STATE_DIR")?
                    .unwrap_or_else(|| DEFAULT_STATE_DIR.to_string()),
            ),
            otel_endpoint: non_empty_var("OTEL_ENDPOINT")?,
            log_level: non_empty_var("LOG_LEVEL")?.unwrap_or_else(|| "info".to_string()),
        })
    }

    /// The invocation settings derived from this config.
    pub fn invoker(&self) -> InvokerConfig {
        InvokerConfig {
            tool: self.tool.clone(),
            backend: self.backend.clone(),
        }
    }
}

/// Read a variable, treating an empty string the same as unset.
fn non_empty_var(name: &str) -> Result<Option<String>> {
    match std::env::var(name) {
        Ok(v) if v.trim().is_empty() => Ok(None),
        Ok(v) => Ok(Some(v)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(Error::Config(format!(
            "environment variable {name} is not valid unicode"
        ))),
    }
}
