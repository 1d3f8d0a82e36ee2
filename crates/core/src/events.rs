use crate::types::{RunId, RunStatus, StepResult, StepStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// A lifecycle event for a run, delivered to live and late observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub run_id: RunId,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub step_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    WorkflowStart,
    StepStart,
    StepComplete,
    WorkflowEnd,
}

impl Event {
    pub fn new(run_id: RunId, event_type: EventType, data: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type,
            run_id,
            step_name: None,
            timestamp: Utc::now(),
            data,
        }
    }

    pub fn for_step(mut self, step_name: impl Into<String>) -> Self {
        self.step_name = Some(step_name.into());
        self
    }

    pub fn workflow_start(run_id: RunId, steps: Vec<String>) -> Self {
        Self::new(run_id, EventType::WorkflowStart, json!({ "steps": steps }))
    }

    pub fn step_start(run_id: RunId, step_name: &str, attempt: u32) -> Self {
        Self::new(run_id, EventType::StepStart, json!({ "attempt": attempt })).for_step(step_name)
    }

    pub fn step_complete(run_id: RunId, result: &StepResult) -> Self {
        let mut data = json!({
            "status": result.status,
            "attempt": result.attempt,
            "error": result.error,
            "output": result.output_data,
        });
        if result.status == StepStatus::Skipped {
            data["reason"] = json!(result.error);
        }

        Self::new(run_id, EventType::StepComplete, data).for_step(result.step_name.clone())
    }

    pub fn workflow_end(run_id: RunId, status: RunStatus, duration_ms: i64) -> Self {
        Self::new(
            run_id,
            EventType::WorkflowEnd,
            json!({ "status": status, "duration_ms": duration_ms }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StepResult;

    #[test]
    fn test_event_json_shape() {
        let run_id = RunId::new();
        let event = Event::step_complete(run_id, &StepResult::skipped("b", "dependency failed"));
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "step_complete");
        assert_eq!(json["run_id"], run_id.0.to_string());
        assert_eq!(json["step_name"], "b");
        assert_eq!(json["data"]["status"], "skipped");
        assert_eq!(json["data"]["reason"], "dependency failed");
    }

    #[test]
    fn test_workflow_events_omit_step_name() {
        let event = Event::workflow_end(RunId::new(), RunStatus::Success, 12);
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "workflow_end");
        assert!(json.get("step_name").is_none());
        assert_eq!(json["data"]["status"], "success");
    }
}
