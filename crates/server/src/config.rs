use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use conductor_core::storage::{JsonlRunLog, RunLog};
use conductor_core::{ConnectionManager, EngineConfig, RunId, RunStatus, RuntimeConfig, WorkflowResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// How long a finished run's event history stays available for replay
    #[serde(default = "default_event_retention_secs")]
    pub event_retention_secs: u64,
}

fn default_event_retention_secs() -> u64 {
    300
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            engine: EngineConfig::default(),
            runtime: RuntimeConfig::default(),
            event_retention_secs: default_event_retention_secs(),
        }
    }
}

impl ServerConfig {
    pub fn load(config_path: &Path, data_dir: PathBuf) -> Result<Self> {
        // Create data directory if it doesn't exist
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        // Load config file if it exists, otherwise use defaults
        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            tracing::info!("Configuration file not found, using defaults");
            Self::default()
        };

        config.data_dir = data_dir;

        Ok(config)
    }

    pub fn event_retention(&self) -> Duration {
        Duration::from_secs(self.event_retention_secs)
    }
}

/// What the server knows about a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<WorkflowResult>,
}

impl RunRecord {
    pub fn running(run_id: RunId) -> Self {
        Self {
            run_id,
            status: RunStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            result: None,
        }
    }

    pub fn from_result(result: WorkflowResult) -> Self {
        Self {
            run_id: result.run_id,
            status: result.overall_status,
            started_at: result.started_at,
            completed_at: result.completed_at,
            error: None,
            result: Some(result),
        }
    }
}

/// Application state shared across handlers
pub struct AppState {
    pub config: ServerConfig,
    pub connections: Arc<ConnectionManager>,
    pub run_log: Arc<JsonlRunLog>,
    pub runs: RwLock<HashMap<RunId, RunRecord>>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Result<Self> {
        let run_log = Arc::new(
            JsonlRunLog::new(config.data_dir.clone()).context("Failed to create run log")?,
        );
        let connections = Arc::new(ConnectionManager::new(config.engine.replay_buffer_size));

        Ok(Self {
            config,
            connections,
            run_log,
            runs: RwLock::new(HashMap::new()),
        })
    }

    /// Look a run up in memory first, then in the run log
    pub async fn find_run(&self, run_id: RunId) -> Result<Option<RunRecord>> {
        if let Some(record) = self.runs.read().await.get(&run_id) {
            return Ok(Some(record.clone()));
        }

        Ok(self.run_log.get(run_id).await?.map(RunRecord::from_result))
    }

    /// Drop everything held in memory for a finished run
    pub async fn evict_run(&self, run_id: RunId) {
        self.connections.clear_run(run_id).await;
        self.runs.write().await.remove(&run_id);
    }
}
