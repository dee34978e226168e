//! REST handlers: session metadata, blocking interactions, and tasks.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use amux_protocol::{
    ChatMessage, ErrorCode, InteractionAnswer, InteractionPayload, SessionMeta, TaskInfo, TaskSpec,
};
use libamux::AmuxError;

use crate::server::AppState;

type ApiResult<T> = Result<T, (StatusCode, String)>;

fn error_response(e: &AmuxError) -> (StatusCode, String) {
    let (code, message) = e.to_error_code();
    let status = match code {
        ErrorCode::SessionNotActive => StatusCode::NOT_FOUND,
        ErrorCode::InteractionTimeout => StatusCode::REQUEST_TIMEOUT,
        ErrorCode::SpawnFailure => StatusCode::BAD_GATEWAY,
        ErrorCode::InvalidCommand => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, message)
}

pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<SessionMeta>>> {
    state
        .registry
        .store()
        .list_sessions()
        .map(Json)
        .map_err(|e| error_response(&e))
}

pub async fn session_info(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<SessionMeta>> {
    match state.registry.store().load_session(&session_id) {
        Ok(Some(meta)) => Ok(Json(meta)),
        Ok(None) => Err((
            StatusCode::NOT_FOUND,
            format!("no such session: {session_id}"),
        )),
        Err(e) => Err(error_response(&e)),
    }
}

pub async fn session_history(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Vec<ChatMessage>>> {
    state
        .registry
        .store()
        .fetch_history(&session_id)
        .map(Json)
        .map_err(|e| error_response(&e))
}

#[derive(Deserialize)]
pub struct InteractionRequest {
    pub session_id: String,
    pub question: String,
    #[serde(default)]
    pub options: Option<Vec<String>>,
    #[serde(default)]
    pub multiselect: bool,
}

/// Blocks until a connected client answers, the timeout lapses (408), or
/// the session turns out to have no live connections (404).
pub async fn request_interaction(
    State(state): State<Arc<AppState>>,
    Json(request): Json<InteractionRequest>,
) -> ApiResult<Json<InteractionAnswer>> {
    let payload = InteractionPayload {
        question: request.question,
        options: request.options,
        multiselect: request.multiselect,
    };
    state
        .interactions
        .request(&request.session_id, payload)
        .await
        .map(Json)
        .map_err(|e| error_response(&e))
}

#[derive(Deserialize)]
pub struct StartTasksRequest {
    pub tasks: Vec<TaskSpec>,
    #[serde(default)]
    pub sync_session: Option<String>,
}

/// Starts the batch sequentially so foreground tasks run one at a time.
/// Each entry resolves to the task snapshot or an `error` object, so one
/// failed spawn never voids the rest of the batch.
pub async fn start_tasks(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StartTasksRequest>,
) -> Json<Vec<Value>> {
    let mut results = Vec::with_capacity(request.tasks.len());
    for spec in request.tasks {
        let outcome = state
            .tasks
            .start_task(spec, request.sync_session.clone())
            .await;
        results.push(match outcome {
            Ok(info) => serde_json::to_value(info).unwrap_or_else(|_| json!({})),
            Err(e) => json!({ "error": e.to_string() }),
        });
    }
    info!(count = results.len(), "task batch finished");
    Json(results)
}

pub async fn list_tasks(State(state): State<Arc<AppState>>) -> Json<Vec<TaskInfo>> {
    Json(state.tasks.all_tasks().await)
}

pub async fn task_info(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<TaskInfo>> {
    state
        .tasks
        .get_task(&task_id)
        .await
        .map(Json)
        .ok_or((StatusCode::NOT_FOUND, format!("no such task: {task_id}")))
}

pub async fn stop_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Json<Value> {
    let stopped = state.tasks.stop_task(&task_id).await;
    Json(json!({ "stopped": stopped }))
}
