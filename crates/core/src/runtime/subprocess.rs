use super::{scan_artifacts, wait_with_deadline, ExecOptions, ExecutionResult, Runtime};
use crate::error::RuntimeError;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;
use tempfile::TempDir;
use tokio::process::Command;
use tokio::sync::Mutex;

/// Runs commands as local child processes inside a scratch directory
#[derive(Default)]
pub struct SubprocessRuntime {
    workdir: Mutex<Option<TempDir>>,
}

impl SubprocessRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scratch directory, once `setup` has run
    pub async fn workdir(&self) -> Option<PathBuf> {
        self.workdir.lock().await.as_ref().map(|d| d.path().to_path_buf())
    }
}

#[async_trait::async_trait]
impl Runtime for SubprocessRuntime {
    fn name(&self) -> &'static str {
        "subprocess"
    }

    async fn setup(&self) -> Result<(), RuntimeError> {
        let mut workdir = self.workdir.lock().await;
        if workdir.is_none() {
            let dir = tempfile::Builder::new().prefix("conductor-run-").tempdir()?;
            tracing::debug!(path = %dir.path().display(), "created scratch directory");
            *workdir = Some(dir);
        }
        Ok(())
    }

    async fn execute(&self, command: &str, options: ExecOptions) -> ExecutionResult {
        let started = Instant::now();

        let cwd = match (options.cwd, self.workdir().await) {
            (Some(cwd), _) => cwd,
            (None, Some(scratch)) => scratch,
            (None, None) => {
                return ExecutionResult::failed(
                    RuntimeError::NotSetUp {
                        runtime: self.name().to_string(),
                    }
                    .to_string(),
                    started.elapsed(),
                )
            }
        };

        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&cwd)
            .envs(&options.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        match child {
            Ok(child) => wait_with_deadline(child, options.timeout, started).await,
            Err(e) => ExecutionResult::failed(format!("failed to spawn command: {e}"), started.elapsed()),
        }
    }

    async fn collect_artifacts(&self) -> Result<Map<String, Value>, RuntimeError> {
        match self.workdir().await {
            Some(dir) => scan_artifacts(&dir),
            None => Ok(Map::new()),
        }
    }

    async fn cleanup(&self) -> Result<(), RuntimeError> {
        if let Some(dir) = self.workdir.lock().await.take() {
            let path = dir.path().to_path_buf();
            dir.close()?;
            tracing::debug!(path = %path.display(), "removed scratch directory");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_execute_captures_output_and_exit_code() {
        let runtime = SubprocessRuntime::new();
        runtime.setup().await.unwrap();

        let result = runtime
            .execute("echo hello; echo oops >&2; exit 3", ExecOptions::with_timeout(Duration::from_secs(10)))
            .await;

        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stdout.trim(), "hello");
        assert_eq!(result.stderr.trim(), "oops");
        assert!(result.error.is_none());
        assert!(!result.success());

        runtime.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn test_execute_passes_env() {
        let runtime = SubprocessRuntime::new();
        runtime.setup().await.unwrap();

        let mut options = ExecOptions::with_timeout(Duration::from_secs(10));
        options.env.insert("GREETING".to_string(), "hi".to_string());

        let result = runtime.execute("printf \"$GREETING\"", options).await;
        assert!(result.success());
        assert_eq!(result.stdout, "hi");

        runtime.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_kills_child() {
        let runtime = SubprocessRuntime::new();
        runtime.setup().await.unwrap();

        let result = runtime
            .execute("sleep 5", ExecOptions::with_timeout(Duration::from_millis(200)))
            .await;

        assert!(result.timed_out);
        assert!(result.error.unwrap().contains("timed out"));
        assert!(result.duration < Duration::from_secs(5));

        runtime.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn test_scratch_dir_lifecycle_and_artifacts() {
        let runtime = SubprocessRuntime::new();
        assert!(runtime.workdir().await.is_none());

        runtime.setup().await.unwrap();
        let dir = runtime.workdir().await.unwrap();
        runtime.setup().await.unwrap();
        assert_eq!(runtime.workdir().await.unwrap(), dir);

        let result = runtime
            .execute("mkdir out && printf abc > out/report.txt", ExecOptions::with_timeout(Duration::from_secs(10)))
            .await;
        assert!(result.success());

        let artifacts = runtime.collect_artifacts().await.unwrap();
        let report = artifacts.get("out/report.txt").unwrap();
        assert_eq!(report["size"], 3);

        runtime.cleanup().await.unwrap();
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_execute_without_setup_reports_error() {
        let runtime = SubprocessRuntime::new();
        let result = runtime
            .execute("true", ExecOptions::with_timeout(Duration::from_secs(1)))
            .await;
        assert!(result.error.unwrap().contains("has not been set up"));
    }
}
