use super::{parse_run_id, ApiError, ApiResult};
use crate::config::{AppState, RunRecord};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use conductor_core::runtime;
use conductor_core::storage::RunLog;
use conductor_core::workflow::{HandlerRegistry, WorkflowDag, WorkflowExecutor};
use conductor_core::{Event, ExecutionContext, RunId, RunStatus, StepDefinition};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct CreateRunRequest {
    #[serde(default)]
    pub inputs: serde_json::Map<String, serde_json::Value>,
    pub steps: Vec<StepDefinition>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateRunResponse {
    pub run_id: RunId,
    pub status: RunStatus,
}

/// Validate a workflow and start executing it in the background
pub async fn create_run(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateRunRequest>,
) -> ApiResult<(StatusCode, Json<CreateRunResponse>)> {
    let dag = WorkflowDag::build(request.steps).map_err(ApiError::bad_request)?;

    // Each run gets its own runtime so scratch directories never overlap.
    let runtime = runtime::from_config(&state.config.runtime);
    let registry =
        HandlerRegistry::with_runtime(runtime.clone(), state.config.runtime.default_timeout())
            .with_retry(state.config.runtime.retry_policy());
    registry.resolve(&dag).map_err(ApiError::bad_request)?;

    let executor = WorkflowExecutor::new(
        Arc::new(registry),
        state.connections.clone(),
        state.config.engine.clone(),
    )
    .with_run_log(state.run_log.clone());

    let run_id = RunId::new();
    state
        .runs
        .write()
        .await
        .insert(run_id, RunRecord::running(run_id));
    tracing::info!(%run_id, steps = dag.len(), "Accepted workflow run");

    let context = ExecutionContext::new(request.inputs);
    let state = state.clone();
    tokio::spawn(async move {
        let outcome = executor.execute(run_id, &dag, context).await;

        if let Err(e) = runtime.cleanup().await {
            tracing::warn!(%run_id, error = %e, "Runtime cleanup failed");
        }

        {
            let mut runs = state.runs.write().await;
            let started_at = runs.get(&run_id).map(|r| r.started_at);
            let mut record = match outcome {
                Ok(result) => RunRecord::from_result(result),
                Err(e) => RunRecord {
                    status: RunStatus::Failed,
                    completed_at: Some(Utc::now()),
                    error: Some(e.to_string()),
                    ..RunRecord::running(run_id)
                },
            };
            if let Some(started_at) = started_at {
                record.started_at = started_at;
            }
            runs.insert(run_id, record);
        }

        tokio::time::sleep(state.config.event_retention()).await;
        state.evict_run(run_id).await;
        tracing::debug!(%run_id, "Evicted finished run from memory");
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(CreateRunResponse {
            run_id,
            status: RunStatus::Running,
        }),
    ))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&RunRecord> for RunSummary {
    fn from(record: &RunRecord) -> Self {
        Self {
            run_id: record.run_id,
            status: record.status,
            started_at: record.started_at,
            completed_at: record.completed_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListRunsResponse {
    pub runs: Vec<RunSummary>,
}

/// List runs from this process plus those in the run log, newest first
pub async fn list_runs(State(state): State<Arc<AppState>>) -> ApiResult<Json<ListRunsResponse>> {
    let mut runs: Vec<RunSummary> = state.runs.read().await.values().map(Into::into).collect();
    let known: HashSet<RunId> = runs.iter().map(|r| r.run_id).collect();

    for result in state.run_log.list().await? {
        if !known.contains(&result.run_id) {
            runs.push((&RunRecord::from_result(result)).into());
        }
    }

    runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    Ok(Json(ListRunsResponse { runs }))
}

/// Get a specific run
pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<RunRecord>> {
    let run_id = parse_run_id(&run_id)?;

    let record = state
        .find_run(run_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Run {run_id}")))?;
    Ok(Json(record))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetRunEventsResponse {
    pub run_id: RunId,
    pub events: Vec<Event>,
}

/// Buffered lifecycle events for a run
pub async fn get_run_events(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<GetRunEventsResponse>> {
    let run_id = parse_run_id(&run_id)?;

    let events = state.connections.history(run_id).await;
    if events.is_empty() && state.find_run(run_id).await?.is_none() {
        return Err(ApiError::not_found(format!("Run {run_id}")));
    }

    Ok(Json(GetRunEventsResponse { run_id, events }))
}
