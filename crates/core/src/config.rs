use crate::workflow::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of steps running at once
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Iteration cap for `loop_until` steps that do not set `loop_max`
    #[serde(default = "default_loop_max")]
    pub default_loop_max: u32,

    /// Events retained per run for late subscribers
    #[serde(default = "default_replay_buffer_size")]
    pub replay_buffer_size: usize,
}

fn default_max_concurrency() -> usize {
    4
}

fn default_loop_max() -> u32 {
    3
}

fn default_replay_buffer_size() -> usize {
    100
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            default_loop_max: default_loop_max(),
            replay_buffer_size: default_replay_buffer_size(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    #[default]
    Subprocess,
    Container,
}

/// Runtime backend selection for `shell` steps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub kind: RuntimeKind,

    /// Tries per handler invocation; 1 disables retries
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,

    #[serde(default = "default_container_image")]
    pub container_image: String,

    #[serde(default = "default_container_engine")]
    pub container_engine: String,

    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
}

fn default_max_attempts() -> u32 {
    1
}

fn default_backoff_secs() -> u64 {
    1
}

fn default_container_image() -> String {
    "alpine:3".to_string()
}

fn default_container_engine() -> String {
    "docker".to_string()
}

fn default_timeout_secs() -> u64 {
    300
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            kind: RuntimeKind::default(),
            max_attempts: default_max_attempts(),
            backoff_secs: default_backoff_secs(),
            container_image: default_container_image(),
            container_engine: default_container_engine(),
            default_timeout_secs: default_timeout_secs(),
        }
    }
}

impl RuntimeConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts.max(1), self.backoff_secs)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }
}
