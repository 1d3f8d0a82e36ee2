use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
};
use conductor_core::{ChannelListener, Event, EventType, RunId, RunStatus};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::api::{parse_run_id, ApiError, ApiResult};
use crate::config::{AppState, RunRecord};

/// Control messages sent alongside run events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    /// Sent once before the replayed history
    Subscribed { run_id: RunId },
    /// Sent instead of events when a run ended and its history is gone
    Finished { run: RunRecord },
}

/// Stream a run's events: buffered history first, then live events until
/// `workflow_end`
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<Response> {
    let run_id = parse_run_id(&run_id)?;

    let known = !state.connections.history(run_id).await.is_empty()
        || state.find_run(run_id).await?.is_some();
    if !known {
        return Err(ApiError::not_found(format!("Run {run_id}")));
    }

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, run_id)))
}

/// Handle individual WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, run_id: RunId) {
    let (mut sender, mut receiver) = socket.split();

    if let Ok(msg_json) = serde_json::to_string(&WsMessage::Subscribed { run_id }) {
        if sender.send(Message::Text(msg_json.into())).await.is_err() {
            return;
        }
    }

    let (listener, mut events) = ChannelListener::new();
    let listener_id = state.connections.subscribe(run_id, Arc::new(listener)).await;
    tracing::info!(%run_id, "WebSocket subscribed to run");

    if let Some(run) = finished_without_history(&state, run_id).await {
        if let Ok(msg_json) = serde_json::to_string(&WsMessage::Finished { run }) {
            let _ = sender.send(Message::Text(msg_json.into())).await;
        }
        let _ = sender.send(Message::Close(None)).await;
        state.connections.disconnect(run_id, listener_id).await;
        tracing::info!(%run_id, "Run already finished, WebSocket closed");
        return;
    }

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match forward(&mut sender, &event).await {
                    Ok(true) => continue,
                    Ok(false) => {
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                    Err(e) => {
                        tracing::debug!(%run_id, error = %e, "WebSocket send failed");
                        break;
                    }
                }
            }
            msg = receiver.next() => match msg {
                Some(Ok(Message::Ping(payload))) => {
                    if sender.send(Message::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    tracing::info!(%run_id, "WebSocket connection closed");
                    break;
                }
                Some(Err(e)) => {
                    tracing::error!("WebSocket error: {}", e);
                    break;
                }
                Some(Ok(_)) => {}
            }
        }
    }

    state.connections.disconnect(run_id, listener_id).await;
    tracing::info!(%run_id, "WebSocket connection terminated");
}

/// A run that has ended and whose buffered events were already dropped.
/// Checked after subscribing, so nothing buffered can be missed.
async fn finished_without_history(state: &AppState, run_id: RunId) -> Option<RunRecord> {
    if !state.connections.history(run_id).await.is_empty() {
        return None;
    }

    match state.find_run(run_id).await {
        Ok(Some(run)) if run.status != RunStatus::Running => Some(run),
        Ok(_) => None,
        Err(e) => {
            tracing::warn!(%run_id, error = %e, "Run lookup failed");
            None
        }
    }
}

/// Send one event; `Ok(false)` once the run has ended
async fn forward<S>(sender: &mut S, event: &Event) -> anyhow::Result<bool>
where
    S: futures::Sink<Message, Error = axum::Error> + Unpin,
{
    let msg_json = serde_json::to_string(event)?;
    sender.send(Message::Text(msg_json.into())).await?;
    Ok(event.event_type != EventType::WorkflowEnd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use conductor_core::WorkflowResult;
    use tempfile::TempDir;

    fn state(dir: &TempDir) -> AppState {
        AppState::new(ServerConfig {
            data_dir: dir.path().to_path_buf(),
            ..ServerConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_finished_run_without_history_is_reported() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir);

        let mut result = WorkflowResult::new(RunId::new());
        result.overall_status = RunStatus::Failed;
        let run_id = result.run_id;
        state
            .runs
            .write()
            .await
            .insert(run_id, RunRecord::from_result(result));

        let run = finished_without_history(&state, run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);

        let msg = serde_json::to_value(WsMessage::Finished { run }).unwrap();
        assert_eq!(msg["type"], "finished");
        assert_eq!(msg["run"]["status"], "failed");
    }

    #[tokio::test]
    async fn test_live_or_buffered_runs_keep_streaming() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir);

        let running = RunId::new();
        state
            .runs
            .write()
            .await
            .insert(running, RunRecord::running(running));
        assert!(finished_without_history(&state, running).await.is_none());

        let mut result = WorkflowResult::new(RunId::new());
        result.overall_status = RunStatus::Success;
        let buffered = result.run_id;
        state
            .runs
            .write()
            .await
            .insert(buffered, RunRecord::from_result(result));
        state
            .connections
            .broadcast(buffered, Event::workflow_start(buffered, vec!["a".to_string()]))
            .await;
        assert!(finished_without_history(&state, buffered).await.is_none());

        assert!(finished_without_history(&state, RunId::new()).await.is_none());
    }
}
