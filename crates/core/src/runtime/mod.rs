pub mod container;
pub mod subprocess;

pub use container::ContainerRuntime;
pub use subprocess::SubprocessRuntime;

use crate::config::{RuntimeConfig, RuntimeKind};
use crate::error::RuntimeError;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;
use std::time::Duration;

/// Options for a single command execution
#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub timeout: Duration,
}

impl ExecOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cwd: None,
            env: HashMap::new(),
            timeout,
        }
    }
}

/// Outcome of a command. Always populated, even when the command could not
/// start or was killed.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub error: Option<String>,
    pub timed_out: bool,
}

impl ExecutionResult {
    pub fn failed(error: impl Into<String>, duration: Duration) -> Self {
        Self {
            exit_code: -1,
            stdout: String::new(),
            stderr: String::new(),
            duration,
            error: Some(error.into()),
            timed_out: false,
        }
    }

    pub fn timed_out(timeout: Duration, duration: Duration) -> Self {
        Self {
            timed_out: true,
            ..Self::failed(
                format!("execution timed out after {}s", timeout.as_secs_f64()),
                duration,
            )
        }
    }

    fn from_output(output: Output, duration: Duration) -> Self {
        Self {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration,
            error: None,
            timed_out: false,
        }
    }

    pub fn success(&self) -> bool {
        self.error.is_none() && self.exit_code == 0
    }
}

/// Pluggable execution environment for external commands
#[async_trait::async_trait]
pub trait Runtime: Send + Sync {
    fn name(&self) -> &'static str;

    /// Prepare the environment. Calling it again after success is a no-op.
    async fn setup(&self) -> Result<(), RuntimeError>;

    /// Run a command. Never fails on a non-zero exit.
    async fn execute(&self, command: &str, options: ExecOptions) -> ExecutionResult;

    /// Files left in the working directory, keyed by relative path
    async fn collect_artifacts(&self) -> Result<Map<String, Value>, RuntimeError>;

    async fn cleanup(&self) -> Result<(), RuntimeError>;
}

/// Build the runtime selected by configuration
pub fn from_config(config: &RuntimeConfig) -> Arc<dyn Runtime> {
    match config.kind {
        RuntimeKind::Subprocess => Arc::new(SubprocessRuntime::new()),
        RuntimeKind::Container => Arc::new(ContainerRuntime::new(
            config.container_engine.clone(),
            config.container_image.clone(),
        )),
    }
}

/// Walk a working directory and describe every regular file in it
pub(crate) fn scan_artifacts(root: &Path) -> Result<Map<String, Value>, RuntimeError> {
    let mut artifacts = Map::new();

    for entry in walkdir::WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| RuntimeError::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .into_owned();
        let size = entry.metadata().map_err(|e| RuntimeError::Io(e.into()))?.len();

        artifacts.insert(
            relative,
            serde_json::json!({
                "path": entry.path().display().to_string(),
                "size": size,
            }),
        );
    }

    Ok(artifacts)
}

/// Wait for a spawned child, killing it once the deadline passes
pub(crate) async fn wait_with_deadline(
    child: tokio::process::Child,
    timeout: Duration,
    started: std::time::Instant,
) -> ExecutionResult {
    // Dropping the wait future drops the child, and `kill_on_drop` reaps it.
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => ExecutionResult::from_output(output, started.elapsed()),
        Ok(Err(e)) => ExecutionResult::failed(format!("failed to wait for command: {e}"), started.elapsed()),
        Err(_) => ExecutionResult::timed_out(timeout, started.elapsed()),
    }
}
