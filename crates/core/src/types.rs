use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Outputs produced by a step handler, keyed by output name
pub type Outputs = serde_json::Map<String, serde_json::Value>;

/// Unique identifier for a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Overall status of a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Lifecycle state of a single step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Ready,
    Running,
    Retrying,
    Success,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    /// Terminal states accept no further transitions
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Success | StepStatus::Failed | StepStatus::Skipped | StepStatus::Cancelled
        )
    }

    /// Terminal states that cause dependents to be skipped
    pub fn blocks_dependents(self) -> bool {
        matches!(
            self,
            StepStatus::Failed | StepStatus::Skipped | StepStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Ready => "ready",
            StepStatus::Running => "running",
            StepStatus::Retrying => "retrying",
            StepStatus::Success => "success",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_kind() -> String {
    "echo".to_string()
}

/// Definition of a single workflow step, as produced by a workflow loader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    /// Handler kind used to execute the step (see `HandlerRegistry`)
    #[serde(default = "default_kind")]
    pub kind: String,
    /// Handler parameters; string leaves may contain `${...}` references
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default, alias = "depends_on")]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub when: Option<String>,
    #[serde(default)]
    pub loop_until: Option<String>,
    #[serde(default)]
    pub loop_max: Option<u32>,
    #[serde(default)]
    pub optional: bool,
    /// Run even when a dependency failed or was skipped
    #[serde(default)]
    pub ignore_upstream_failure: bool,
    /// Result key -> context path
    #[serde(default, alias = "output_mapping")]
    pub outputs: BTreeMap<String, String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl StepDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: default_kind(),
            params: serde_json::Value::Null,
            dependencies: Vec::new(),
            when: None,
            loop_until: None,
            loop_max: None,
            optional: false,
            ignore_upstream_failure: false,
            outputs: BTreeMap::new(),
            timeout_secs: None,
        }
    }

    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn when(mut self, expr: impl Into<String>) -> Self {
        self.when = Some(expr.into());
        self
    }

    pub fn loop_until(mut self, expr: impl Into<String>, max: u32) -> Self {
        self.loop_until = Some(expr.into());
        self.loop_max = Some(max);
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn ignore_upstream_failure(mut self) -> Self {
        self.ignore_upstream_failure = true;
        self
    }

    pub fn output(mut self, result_key: impl Into<String>, context_path: impl Into<String>) -> Self {
        self.outputs.insert(result_key.into(), context_path.into());
        self
    }
}

/// Record of one step execution attempt (or of a skip)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_name: String,
    pub status: StepStatus,
    pub attempt: u32,
    pub input_data: serde_json::Value,
    pub output_data: serde_json::Value,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl StepResult {
    pub fn skipped(step_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            step_name: step_name.into(),
            status: StepStatus::Skipped,
            attempt: 0,
            input_data: serde_json::Value::Null,
            output_data: serde_json::Value::Null,
            start_time: None,
            end_time: None,
            error: Some(reason.into()),
        }
    }
}

/// Result of a whole workflow run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub run_id: RunId,
    pub overall_status: RunStatus,
    pub steps: Vec<StepResult>,
    pub final_output: serde_json::Value,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowResult {
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            overall_status: RunStatus::Running,
            steps: Vec::new(),
            final_output: serde_json::Value::Null,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// The last recorded result for a step
    pub fn step(&self, name: &str) -> Option<&StepResult> {
        self.steps.iter().rev().find(|s| s.step_name == name)
    }

    /// Final status of a step, if it has any recorded result
    pub fn step_status(&self, name: &str) -> Option<StepStatus> {
        self.step(name).map(|s| s.status)
    }

    /// All recorded attempts for a step, oldest first
    pub fn attempts(&self, name: &str) -> Vec<&StepResult> {
        self.steps.iter().filter(|s| s.step_name == name).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_definition_deserializes_loader_shape() {
        let def: StepDefinition = serde_json::from_value(serde_json::json!({
            "name": "summarize",
            "dependencies": ["fetch"],
            "when": "${inputs.enabled}",
            "loop_until": "${ctx.done} == true",
            "loop_max": 5,
            "optional": true,
            "outputs": {"summary": "ctx.summary"}
        }))
        .unwrap();

        assert_eq!(def.kind, "echo");
        assert_eq!(def.dependencies, vec!["fetch".to_string()]);
        assert_eq!(def.loop_max, Some(5));
        assert!(def.optional);
        assert!(!def.ignore_upstream_failure);
        assert_eq!(def.outputs.get("summary").unwrap(), "ctx.summary");
    }

    #[test]
    fn test_terminal_states() {
        assert!(StepStatus::Success.is_terminal());
        assert!(StepStatus::Cancelled.is_terminal());
        assert!(!StepStatus::Retrying.is_terminal());
        assert!(!StepStatus::Success.blocks_dependents());
        assert!(StepStatus::Skipped.blocks_dependents());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&StepStatus::Retrying).unwrap();
        assert_eq!(json, "\"retrying\"");
    }
}
