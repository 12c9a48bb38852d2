//! JSON-file task store.
//!
//! Single source of truth for task state and the only thing resume reads.
//! Every mutation is written through before it returns, so a crash between
//! two task completions loses nothing. One writer per file: the scheduler
//! owns the store and serializes access to it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::Result;
use crate::model::*;

/// On-disk shape of the tasks file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TasksFile {
    pub name: String,
    pub updated_at: DateTime<Utc>,
    /// Recomputed on every save; ignored on load.
    pub summary: RunSummary,
    pub tasks: Vec<TaskRecord>,
}

/// Durable map from task id to task record.
#[derive(Debug)]
pub struct TaskStore {
    name: String,
    path: PathBuf,
    tasks: TaskMap,
}

impl TaskStore {
    /// An empty store that will overwrite whatever is at `path` on first
    /// save. Used for fresh runs.
    pub fn fresh(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            tasks: TaskMap::new(),
        }
    }

    /// Open the store at `path`, loading whatever was persisted there.
    pub async fn open(name: impl Into<String>, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let tasks = Self::load(&path).await?;
        Ok(Self {
            name: name.into(),
            path,
            tasks,
        })
    }

    /// Read the task map from `path`. A missing file is an empty map.
    pub async fn load(path: &Path) -> Result<TaskMap> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(TaskMap::new()),
            Err(e) => return Err(e.into()),
        };
        let file: TasksFile = serde_json::from_str(&content)?;
        Ok(file
            .tasks
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect())
    }

    /// Persist the whole store, replacing the previous file atomically.
    pub async fn save(&self) -> Result<()> {
        let file = TasksFile {
            name: self.name.clone(),
            updated_at: Utc::now(),
            summary: self.summary(),
            tasks: self.tasks.values().cloned().collect(),
        };
        write_json_atomic(&self.path, &file).await?;
        debug!(path = %self.path.display(), tasks = file.tasks.len(), "task store saved");
        Ok(())
    }

    /// Merge `update` onto the record for `id`, creating it if absent, and
    /// persist before returning. Returns the merged record.
    ///
    /// A rejected transition leaves both memory and disk untouched.
    pub async fn update(&mut self, id: &TaskId, update: TaskUpdate) -> Result<TaskRecord> {
        let mut record = self
            .tasks
            .get(id)
            .cloned()
            .unwrap_or_else(|| TaskRecord::new(id.clone()));
        record.apply(update)?;
        self.tasks.insert(id.clone(), record.clone());
        self.save().await?;
        Ok(record)
    }

    /// Create pending records for items seen for the first time, then
    /// persist once. Existing records are left alone.
    pub async fn observe(&mut self, items: &[TaskItem]) -> Result<()> {
        for item in items {
            self.tasks.entry(item.id.clone()).or_insert_with(|| {
                let mut record = TaskRecord::new(item.id.clone());
                record.path = Some(item.path.clone());
                record
            });
        }
        self.save().await
    }

    /// Cheap peek at the persisted store for status queries.
    ///
    /// Returns `{"status": "never_run", "name": ...}` when nothing was ever
    /// written, otherwise the file's JSON verbatim.
    pub async fn status(name: &str, path: &Path) -> Result<serde_json::Value> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(serde_json::json!({
                "status": "never_run",
                "name": name,
            })),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get(&self, id: &TaskId) -> Option<&TaskRecord> {
        self.tasks.get(id)
    }

    pub fn tasks(&self) -> &TaskMap {
        &self.tasks
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary::from_records(self.tasks.values())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Write `value` as pretty JSON to a sibling temp file, then rename it over
/// `path`. Readers see either the old file or the new one.
pub(crate) async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut json = serde_json::to_vec_pretty(value)?;
    json.push(b'\n');

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, &json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(file: &str) -> PathBuf {
        std::env::temp_dir()
            .join("workbatch-storage")
            .join(uuid::Uuid::new_v4().to_string())
            .join(file)
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let path = temp_path("t-tasks.json");
        assert!(TaskStore::load(&path).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let path = temp_path("t-tasks.json");
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, "{not json").await.unwrap();

        let err = TaskStore::open("t", &path).await.unwrap_err();
        assert!(matches!(err, crate::error::Error::Json(_)));
    }

    #[tokio::test]
    async fn atomic_write_leaves_no_temp_file() {
        let path = temp_path("t-tasks.json");
        let store = TaskStore::fresh("t", &path);
        store.save().await.unwrap();

        let dir = path.parent().unwrap();
        let names: Vec<_> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["t-tasks.json".to_string()]);
        let _ = std::fs::remove_dir_all(dir);
    }
}
