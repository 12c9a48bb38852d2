//! Pipeline over the files of a directory tree.
//!
//! Each matching file is one task, identified by its path relative to the
//! root. The prompt template is filled with that path and the file content;
//! the JSON payload found in the tool's answer is written as an artifact.

use anyhow::{Context, bail};
use async_trait::async_trait;
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::extract::extract_json;
use crate::engine::Pipeline;
use crate::model::{TaskItem, TaskUpdate};
use crate::storage::write_json_atomic;
use crate::worker::ProcessResult;

const PATH_PLACEHOLDER: &str = "{path}";
const CONTENT_PLACEHOLDER: &str = "{content}";

#[derive(Debug, Clone)]
pub struct FilePipeline {
    output_dir: PathBuf,
    prompt: String,
    extensions: Vec<String>,
    exclude: Vec<String>,
}

impl FilePipeline {
    pub fn new(output_dir: impl Into<PathBuf>, prompt: impl Into<String>) -> Self {
        Self {
            output_dir: output_dir.into(),
            prompt: prompt.into(),
            extensions: Vec::new(),
            exclude: Vec::new(),
        }
    }

    /// Only files with one of these extensions are discovered. A leading dot
    /// is ignored.
    pub fn extensions(mut self, extensions: Vec<String>) -> Self {
        self.extensions = extensions
            .into_iter()
            .map(|e| e.trim_start_matches('.').to_string())
            .collect();
        self
    }

    /// Directory names never descended into.
    pub fn exclude(mut self, exclude: Vec<String>) -> Self {
        self.exclude = exclude;
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Where the artifact for `item` is written.
    pub fn artifact_path(&self, item: &TaskItem) -> PathBuf {
        self.output_dir
            .join(format!("{}.json", artifact_name(item.id.as_str())))
    }

    fn wants(&self, path: &Path) -> bool {
        self.extensions.is_empty()
            || path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| self.extensions.iter().any(|want| want == ext))
    }

    fn skips_dir(&self, name: &str) -> bool {
        self.exclude.iter().any(|ex| ex == name)
    }

    fn render(&self, id: &str, content: &str) -> String {
        self.prompt
            .replace(PATH_PLACEHOLDER, id)
            .replace(CONTENT_PLACEHOLDER, content)
    }
}

#[async_trait]
impl Pipeline for FilePipeline {
    async fn discover(&self, root: &Path) -> anyhow::Result<Vec<TaskItem>> {
        let mut items = Vec::new();
        let mut dirs = vec![root.to_path_buf()];

        while let Some(dir) = dirs.pop() {
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .with_context(|| format!("cannot read directory {}", dir.display()))?;

            let mut found = Vec::new();
            while let Some(entry) = entries.next_entry().await? {
                found.push(entry);
            }
            found.sort_by_key(|e| e.file_name());

            let mut subdirs = Vec::new();
            for entry in found {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    if !self.skips_dir(&entry.file_name().to_string_lossy()) {
                        subdirs.push(path);
                    }
                } else if file_type.is_file() && self.wants(&path) {
                    let relative = path.strip_prefix(root).unwrap_or(&path);
                    let id = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    items.push(TaskItem::new(id, path));
                }
            }
            // Reversed onto the stack so subdirectories pop in name order.
            dirs.extend(subdirs.into_iter().rev());
        }

        debug!(root = %root.display(), found = items.len(), "discovered files");
        Ok(items)
    }

    async fn build_input(&self, item: &TaskItem) -> anyhow::Result<String> {
        let content = tokio::fs::read_to_string(&item.path)
            .await
            .with_context(|| format!("cannot read {}", item.path.display()))?;
        Ok(self.render(item.id.as_str(), &content))
    }

    async fn interpret_result(
        &self,
        item: &TaskItem,
        result: &ProcessResult,
    ) -> anyhow::Result<TaskUpdate> {
        if !result.success {
            return Ok(TaskUpdate::new());
        }
        let Some(payload) = extract_json(&result.output) else {
            bail!("no JSON payload in output");
        };

        let artifact = self.artifact_path(item);
        write_json_atomic(&artifact, &payload)
            .await
            .with_context(|| format!("cannot write {}", artifact.display()))?;
        Ok(TaskUpdate::new().context(json!({ "artifact": artifact })))
    }
}

/// Flatten a relative id into a single file name.
///
/// Path separators become `__`; `_`, `%` and anything else outside
/// alphanumerics, `.` and `-` is percent-encoded. Every output token is
/// unambiguous, so distinct ids never share an artifact.
fn artifact_name(id: &str) -> String {
    let mut name = String::with_capacity(id.len());
    for c in id.chars() {
        match c {
            '/' => name.push_str("__"),
            c if c.is_alphanumeric() || matches!(c, '.' | '-') => name.push(c),
            c => {
                let mut buf = [0u8; 4];
                for byte in c.encode_utf8(&mut buf).bytes() {
                    name.push_str(&format!("%{byte:02X}"));
                }
            }
        }
    }
    name
}
