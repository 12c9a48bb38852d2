//! Job definitions.
//!
//! A job file names a batch, tunes the scheduler for it and describes the
//! file pipeline that feeds it. Everything except the name is optional.

pub mod extract;
pub mod files;

use crate::engine::SchedulerConfig;
use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use extract::extract_json;
pub use files::FilePipeline;

/// Prompt used when the job file has none: the file content alone.
pub const DEFAULT_PROMPT: &str = "{content}";

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct JobFile {
    job: JobConfig,
}

/// One `[job]` table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct JobConfig {
    pub name: String,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub retry_delay_ms: Option<u64>,
    /// File extensions to include, without the dot. Empty includes all.
    #[serde(default)]
    pub extensions: Vec<String>,
    /// Directory names never descended into.
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Where interpreted artifacts are written. Defaults to a directory
    /// named after the job next to the batch state.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default = "default_prompt")]
    pub prompt: String,
}

fn default_prompt() -> String {
    DEFAULT_PROMPT.to_string()
}

impl JobConfig {
    /// Load a job from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read job file {}: {e}", path.display())))?;
        Self::parse(&content)
            .map_err(|e| Error::Config(format!("bad job file {}: {e}", path.display())))
    }

    /// Parse a job from TOML text.
    pub fn parse(content: &str) -> std::result::Result<Self, String> {
        let file: JobFile = toml::from_str(content).map_err(|e| e.to_string())?;
        let job = file.job;
        if job.name.trim().is_empty() {
            return Err("job name must not be empty".to_string());
        }
        if job
            .name
            .chars()
            .any(|c| std::path::is_separator(c) || c.is_control())
        {
            return Err(format!("job name {:?} must be a plain file name", job.name));
        }
        if job.concurrency == Some(0) {
            return Err("concurrency must be at least 1".to_string());
        }
        Ok(job)
    }

    /// Scheduler settings for this job, defaults filled in.
    pub fn scheduler_config(&self, state_dir: &Path) -> SchedulerConfig {
        let mut config = SchedulerConfig::new(&self.name);
        config.state_dir = state_dir.to_path_buf();
        if let Some(n) = self.concurrency {
            config.concurrency = n;
        }
        if let Some(ms) = self.timeout_ms {
            config.timeout = Duration::from_millis(ms);
        }
        if let Some(n) = self.max_retries {
            config.max_retries = n;
        }
        if let Some(ms) = self.retry_delay_ms {
            config.retry_delay = Duration::from_millis(ms);
        }
        config
    }

    /// Resolved artifact directory.
    pub fn output_dir(&self, state_dir: &Path) -> PathBuf {
        self.output_dir.clone().unwrap_or_else(|| {
            state_dir
                .join(crate::engine::BATCH_DIR)
                .join(format!("{}-out", self.name))
        })
    }

    /// The file pipeline this job describes.
    pub fn pipeline(&self, state_dir: &Path) -> FilePipeline {
        FilePipeline::new(self.output_dir(state_dir), self.prompt.clone())
            .extensions(self.extensions.clone())
            .exclude(self.exclude.clone())
    }
}
