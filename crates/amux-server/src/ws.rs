//! WebSocket gateway.
//!
//! `/ws/sessions/{id}` multiplexes one client onto a session: commands
//! arrive as JSON text frames, server events stream back. `/ws/sessions`
//! is a read-only watch feed of session metadata changes.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use amux_protocol::{ClientCommand, ServerEvent, SessionKind};
use libamux::{AmuxError, ConnectionSender, SpawnOptions};

use crate::server::AppState;

pub async fn session_socket(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Response {
    ws.on_upgrade(move |socket| handle_session(socket, state, session_id))
}

async fn handle_session(mut socket: WebSocket, state: Arc<AppState>, session_id: String) {
    let (tx, rx) = mpsc::unbounded_channel();
    // Kept so per-command errors reach only this connection.
    let errors = tx.clone();
    let connection_id = match attach(&state, &session_id, tx).await {
        Ok(connection_id) => connection_id,
        Err(e) => {
            let (code, message) = e.to_error_code();
            warn!(session_id = %session_id, error = %message, "attach refused");
            let event = ServerEvent::error(message, code);
            if let Ok(text) = serde_json::to_string(&event) {
                let _ = socket.send(Message::text(text)).await;
            }
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };
    info!(session_id = %session_id, connection_id, "client attached");

    let (ws_tx, mut ws_rx) = socket.split();
    let writer = tokio::spawn(pump_events(rx, ws_tx));

    while let Some(message) = ws_rx.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                debug!(session_id = %session_id, "read error: {e}");
                break;
            }
        };
        match message {
            Message::Text(text) => dispatch(&state, &session_id, &text, &errors).await,
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.registry.detach(&session_id, connection_id).await;
    drop(errors);
    let _ = writer.await;
    debug!(session_id = %session_id, connection_id, "client detached");
}

/// Persisted task sessions are proxied without owning a process; any
/// other id gets (or joins) the session's single adapter process.
async fn attach(
    state: &AppState,
    session_id: &str,
    tx: ConnectionSender,
) -> Result<u64, AmuxError> {
    let is_task = matches!(
        state.registry.store().load_session(session_id),
        Ok(Some(meta)) if meta.kind == SessionKind::Task
    );
    if is_task {
        return Ok(state.registry.attach_external(session_id, tx).await);
    }
    state
        .registry
        .get_or_create(session_id, &SpawnOptions::default())
        .await?;
    state.registry.attach(session_id, tx).await
}

/// Write loop: drains the connection channel into the socket.
async fn pump_events(
    mut rx: mpsc::UnboundedReceiver<ServerEvent>,
    mut ws_tx: SplitSink<WebSocket, Message>,
) {
    while let Some(event) = rx.recv().await {
        let text = match serde_json::to_string(&event) {
            Ok(text) => text,
            Err(e) => {
                warn!("dropping unserializable event: {e}");
                continue;
            }
        };
        if ws_tx.send(Message::text(text)).await.is_err() {
            break;
        }
    }
}

async fn dispatch(state: &AppState, session_id: &str, text: &str, errors: &ConnectionSender) {
    let command: ClientCommand = match serde_json::from_str(text) {
        Ok(command) => command,
        Err(e) => {
            let (code, message) = AmuxError::InvalidCommand(e.to_string()).to_error_code();
            let _ = errors.send(ServerEvent::error(message, code));
            return;
        }
    };
    let result = match command {
        ClientCommand::UserMessage { text } => state
            .registry
            .user_message(session_id, &text)
            .await
            .map(|_| ()),
        ClientCommand::Interrupt => state.registry.interrupt(session_id).await,
        ClientCommand::TerminateSession => state.registry.terminate(session_id).await,
        ClientCommand::InteractionResponse { id, data } => {
            if !state.interactions.resolve(session_id, &id, data).await {
                debug!(session_id = %session_id, interaction_id = %id, "stale interaction answer");
            }
            Ok(())
        }
    };
    if let Err(e) = result {
        let (code, message) = e.to_error_code();
        let _ = errors.send(ServerEvent::error(message, code));
    }
}

pub async fn watch_sessions(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_watch(socket, state))
}

async fn handle_watch(socket: WebSocket, state: Arc<AppState>) {
    let mut updates = state.registry.subscribe_watchers();
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Current snapshot first, live updates after.
    for meta in state.registry.store().list_sessions().unwrap_or_default() {
        let event = ServerEvent::SessionUpdated { session: meta };
        let Ok(text) = serde_json::to_string(&event) else {
            continue;
        };
        if ws_tx.send(Message::text(text)).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(event) => {
                    let Ok(text) = serde_json::to_string(&event) else {
                        continue;
                    };
                    if ws_tx.send(Message::text(text)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "watch stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            message = ws_rx.next() => match message {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!("watch client disconnected");
}
