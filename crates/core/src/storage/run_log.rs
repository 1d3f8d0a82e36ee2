use crate::types::{RunId, WorkflowResult};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Durable record of finished runs
#[async_trait::async_trait]
pub trait RunLog: Send + Sync {
    /// Persist the final result of a run
    async fn record(&self, result: &WorkflowResult) -> Result<()>;

    /// Every recorded result, oldest first
    async fn list(&self) -> Result<Vec<WorkflowResult>>;

    /// Latest recorded result for a run
    async fn get(&self, run_id: RunId) -> Result<Option<WorkflowResult>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .rev()
            .find(|r| r.run_id == run_id))
    }
}

/// Run log stored as JSON Lines, one file per day.
///
/// Layout: `<base>/runs/YYYY-MM-DD.jsonl`
pub struct JsonlRunLog {
    base_path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlRunLog {
    pub fn new(base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();
        std::fs::create_dir_all(base_path.join("runs"))
            .context("Failed to create run log directory")?;
        Ok(Self {
            base_path,
            write_lock: Mutex::new(()),
        })
    }

    fn log_path(&self, date: &DateTime<Utc>) -> PathBuf {
        self.base_path
            .join("runs")
            .join(format!("{}.jsonl", date.format("%Y-%m-%d")))
    }

    async fn read_file(path: &Path) -> Result<Vec<WorkflowResult>> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read run log {}", path.display()))?;

        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).context("Failed to parse run record"))
            .collect()
    }
}

#[async_trait::async_trait]
impl RunLog for JsonlRunLog {
    async fn record(&self, result: &WorkflowResult) -> Result<()> {
        let date = result.completed_at.unwrap_or_else(Utc::now);
        let path = self.log_path(&date);

        let mut line = serde_json::to_string(result).context("Failed to serialize run result")?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open run log {}", path.display()))?;
        file.write_all(line.as_bytes())
            .await
            .context("Failed to append run record")?;
        file.flush().await.context("Failed to flush run log")?;

        tracing::debug!(run_id = %result.run_id, path = %path.display(), "Recorded run");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<WorkflowResult>> {
        let mut files: Vec<PathBuf> = walkdir::WalkDir::new(self.base_path.join("runs"))
            .max_depth(1)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.into_path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "jsonl"))
            .collect();
        // Date-stamped names sort chronologically.
        files.sort();

        let mut results = Vec::new();
        for file in files {
            results.extend(Self::read_file(&file).await?);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RunStatus;
    use tempfile::TempDir;

    fn finished(status: RunStatus) -> WorkflowResult {
        let mut result = WorkflowResult::new(RunId::new());
        result.overall_status = status;
        result.completed_at = Some(Utc::now());
        result
    }

    #[tokio::test]
    async fn test_record_and_list() {
        let dir = TempDir::new().unwrap();
        let log = JsonlRunLog::new(dir.path()).unwrap();

        let first = finished(RunStatus::Success);
        let second = finished(RunStatus::Failed);
        log.record(&first).await.unwrap();
        log.record(&second).await.unwrap();

        let runs = log.list().await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].run_id, first.run_id);
        assert_eq!(runs[1].overall_status, RunStatus::Failed);

        let found = log.get(second.run_id).await.unwrap().unwrap();
        assert_eq!(found.run_id, second.run_id);
        assert!(log.get(RunId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_log() {
        let dir = TempDir::new().unwrap();
        let log = JsonlRunLog::new(dir.path().join("nested")).unwrap();

        assert!(log.list().await.unwrap().is_empty());
    }
}
