use super::{scan_artifacts, wait_with_deadline, ExecOptions, ExecutionResult, Runtime};
use crate::error::RuntimeError;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;
use tempfile::TempDir;
use tokio::process::Command;
use tokio::sync::Mutex;

const CONTAINER_WORKDIR: &str = "/workspace";

/// Runs commands in throwaway containers through an engine CLI (docker, podman).
///
/// The scratch directory is bind-mounted at `/workspace`. `setup` fails with
/// `RuntimeError::Unavailable` when the engine binary cannot be run; there is
/// no fallback to local execution.
pub struct ContainerRuntime {
    engine: String,
    image: String,
    workdir: Mutex<Option<TempDir>>,
}

impl ContainerRuntime {
    pub fn new(engine: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            engine: engine.into(),
            image: image.into(),
            workdir: Mutex::new(None),
        }
    }

    async fn workdir(&self) -> Option<PathBuf> {
        self.workdir.lock().await.as_ref().map(|d| d.path().to_path_buf())
    }

    fn unavailable(&self, reason: impl Into<String>) -> RuntimeError {
        RuntimeError::Unavailable {
            runtime: format!("container ({})", self.engine),
            reason: reason.into(),
        }
    }

    async fn check_engine(&self) -> Result<(), RuntimeError> {
        let output = Command::new(&self.engine)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    self.unavailable(format!("'{}' not found on PATH", self.engine))
                } else {
                    self.unavailable(e.to_string())
                }
            })?;

        if !output.status.success() {
            return Err(self.unavailable(format!(
                "'{} --version' exited with {}",
                self.engine, output.status
            )));
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl Runtime for ContainerRuntime {
    fn name(&self) -> &'static str {
        "container"
    }

    async fn setup(&self) -> Result<(), RuntimeError> {
        let mut workdir = self.workdir.lock().await;
        if workdir.is_some() {
            return Ok(());
        }

        self.check_engine().await?;
        let dir = tempfile::Builder::new().prefix("conductor-ctr-").tempdir()?;
        tracing::info!(engine = %self.engine, image = %self.image, "container runtime ready");
        *workdir = Some(dir);
        Ok(())
    }

    async fn execute(&self, command: &str, options: ExecOptions) -> ExecutionResult {
        let started = Instant::now();

        let Some(scratch) = self.workdir().await else {
            return ExecutionResult::failed(
                RuntimeError::NotSetUp {
                    runtime: self.name().to_string(),
                }
                .to_string(),
                started.elapsed(),
            );
        };

        let name = format!("conductor-{}", uuid::Uuid::new_v4().simple());
        let mut cmd = Command::new(&self.engine);
        cmd.arg("run")
            .arg("--rm")
            .arg("--name")
            .arg(&name)
            .arg("-v")
            .arg(format!("{}:{}", scratch.display(), CONTAINER_WORKDIR))
            .arg("-w")
            .arg(
                options
                    .cwd
                    .as_ref()
                    .map_or_else(|| CONTAINER_WORKDIR.to_string(), |p| p.display().to_string()),
            );
        for (key, value) in &options.env {
            cmd.arg("-e").arg(format!("{key}={value}"));
        }
        cmd.arg(&self.image)
            .arg("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let result = match cmd.spawn() {
            Ok(child) => wait_with_deadline(child, options.timeout, started).await,
            Err(e) => {
                return ExecutionResult::failed(
                    self.unavailable(e.to_string()).to_string(),
                    started.elapsed(),
                )
            }
        };

        if result.timed_out {
            // Killing the CLI client does not stop the container itself.
            let killed = Command::new(&self.engine)
                .arg("kill")
                .arg(&name)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            if let Err(e) = killed {
                tracing::warn!(container = %name, error = %e, "failed to kill timed out container");
            }
        }

        result
    }

    async fn collect_artifacts(&self) -> Result<Map<String, Value>, RuntimeError> {
        match self.workdir().await {
            Some(dir) => scan_artifacts(&dir),
            None => Ok(Map::new()),
        }
    }

    async fn cleanup(&self) -> Result<(), RuntimeError> {
        if let Some(dir) = self.workdir.lock().await.take() {
            dir.close()?;
        }
        Ok(())
    }
}
