//! Shared state and router assembly.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::http::{HeaderValue, Method};
use axum::routing::{get, post};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use libamux::{InteractionCoordinator, SessionRegistry, TaskManager};

use crate::{api, ws};

pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub interactions: InteractionCoordinator,
    pub tasks: Arc<TaskManager>,
}

pub fn build_router(state: Arc<AppState>, cors: CorsLayer) -> Router {
    Router::new()
        .route("/api/sessions", get(api::list_sessions))
        .route("/api/sessions/{id}", get(api::session_info))
        .route("/api/sessions/{id}/history", get(api::session_history))
        .route("/api/interactions", post(api::request_interaction))
        .route("/api/tasks", get(api::list_tasks).post(api::start_tasks))
        .route("/api/tasks/{id}", get(api::task_info))
        .route("/api/tasks/{id}/stop", post(api::stop_task))
        .route("/ws/sessions", get(ws::watch_sessions))
        .route("/ws/sessions/{id}", get(ws::session_socket))
        .layer(cors)
        .with_state(state)
}

pub fn build_cors(origins: &[String]) -> Result<CorsLayer> {
    if origins.iter().any(|origin| origin == "*") {
        return Ok(CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers(Any));
    }

    let mut headers = Vec::with_capacity(origins.len());
    for origin in origins {
        headers.push(
            HeaderValue::from_str(origin)
                .with_context(|| format!("invalid allowed origin: {origin}"))?,
        );
    }

    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(headers))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any))
}
