//! End-to-end tests against a served router: real HTTP and WebSocket
//! clients on a loopback port, with the scripted spawner standing in for
//! adapter processes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use amux_protocol::{
    AdapterEvent, ChatMessage, ErrorCode, InteractionAnswer, Role, ServerEvent, SessionStatus,
    now_epoch_ms,
};
use amux_server::server::{AppState, build_cors, build_router};
use libamux::{
    AdapterSpawner, FsStore, InteractionCoordinator, ScriptedSpawner, SessionRegistry, TaskManager,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    spawner: Arc<ScriptedSpawner>,
    registry: Arc<SessionRegistry>,
    _dir: TempDir,
}

async fn start_server() -> TestServer {
    let dir = tempfile::tempdir().expect("tempdir");
    let spawner = Arc::new(ScriptedSpawner::new());
    let registry = Arc::new(SessionRegistry::new(
        FsStore::new(dir.path()),
        spawner.clone() as Arc<dyn AdapterSpawner>,
    ));
    let state = Arc::new(AppState {
        interactions: InteractionCoordinator::new(registry.clone())
            .with_timeout(Duration::from_millis(500)),
        tasks: Arc::new(
            TaskManager::new(registry.clone(), spawner.clone() as Arc<dyn AdapterSpawner>)
                .with_poll_interval(Duration::from_millis(20)),
        ),
        registry: registry.clone(),
    });
    let cors = build_cors(&["*".to_string()]).expect("cors");
    let app = build_router(state, cors);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind loopback");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    TestServer {
        addr,
        spawner,
        registry,
        _dir: dir,
    }
}

async fn connect_ws(addr: SocketAddr, path: &str) -> WsStream {
    let (ws, _) = connect_async(format!("ws://{addr}{path}"))
        .await
        .expect("websocket connect");
    ws
}

/// Next parsed server event, skipping control frames.
async fn next_event(ws: &mut WsStream) -> ServerEvent {
    loop {
        let frame = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("frame within deadline")
            .expect("stream open")
            .expect("frame ok");
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).expect("valid server event");
        }
    }
}

async fn send_json(ws: &mut WsStream, value: Value) {
    ws.send(Message::text(value.to_string()))
        .await
        .expect("send frame");
}

/// Deliver an adapter event, waiting out the window between the HTTP
/// upgrade finishing and the server actually spawning the adapter.
async fn push_adapter_event(spawner: &ScriptedSpawner, session_id: &str, event: AdapterEvent) {
    for _ in 0..200 {
        if spawner.push_event(session_id, event.clone()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("adapter for {session_id} never spawned");
}

fn assistant_msg(id: &str, text: &str) -> AdapterEvent {
    AdapterEvent::Message {
        message: ChatMessage {
            id: id.to_string(),
            role: Role::Assistant,
            content: text.to_string(),
            parent_id: None,
            tool_call_id: None,
            is_error: false,
            created_at_epoch_ms: now_epoch_ms(),
        },
    }
}

#[tokio::test]
async fn session_socket_round_trip() {
    let server = start_server().await;
    let mut ws = connect_ws(server.addr, "/ws/sessions/s1").await;
    push_adapter_event(
        &server.spawner,
        "s1",
        AdapterEvent::Init {
            session_id: "s1".to_string(),
        },
    )
    .await;
    assert_eq!(server.spawner.spawn_count("s1"), 1);

    match next_event(&mut ws).await {
        ServerEvent::SessionInfo { info } => {
            assert_eq!(info.session_id, "s1");
            assert!(!info.resumed);
        }
        other => panic!("expected session info, got {other:?}"),
    }

    send_json(&mut ws, json!({"cmd": "user_message", "text": "hello"})).await;
    match next_event(&mut ws).await {
        ServerEvent::Message { message } => {
            assert_eq!(message.role, Role::User);
            assert_eq!(message.content, "hello");
        }
        other => panic!("expected echoed user message, got {other:?}"),
    }
    assert_eq!(server.spawner.sent_turns("s1"), vec!["hello"]);

    server.spawner.push_event("s1", assistant_msg("m1", "hi there"));
    match next_event(&mut ws).await {
        ServerEvent::Message { message } => {
            assert_eq!(message.role, Role::Assistant);
            assert_eq!(message.content, "hi there");
        }
        other => panic!("expected assistant message, got {other:?}"),
    }
}

#[tokio::test]
async fn late_joiner_replays_history_in_order() {
    let server = start_server().await;
    let mut first = connect_ws(server.addr, "/ws/sessions/s1").await;
    push_adapter_event(
        &server.spawner,
        "s1",
        AdapterEvent::Init {
            session_id: "s1".to_string(),
        },
    )
    .await;
    let _ = next_event(&mut first).await;

    send_json(&mut first, json!({"cmd": "user_message", "text": "question"})).await;
    let _ = next_event(&mut first).await;
    server.spawner.push_event("s1", assistant_msg("m1", "answer"));
    let _ = next_event(&mut first).await;

    let mut late = connect_ws(server.addr, "/ws/sessions/s1").await;
    match next_event(&mut late).await {
        ServerEvent::SessionInfo { info } => assert_eq!(info.session_id, "s1"),
        other => panic!("expected replayed session info, got {other:?}"),
    }
    match next_event(&mut late).await {
        ServerEvent::Message { message } => {
            assert_eq!(message.role, Role::User);
            assert_eq!(message.content, "question");
        }
        other => panic!("expected replayed user message, got {other:?}"),
    }
    match next_event(&mut late).await {
        ServerEvent::Message { message } => {
            assert_eq!(message.role, Role::Assistant);
            assert_eq!(message.content, "answer");
        }
        other => panic!("expected replayed assistant message, got {other:?}"),
    }

    // Joining never started a second process.
    assert_eq!(server.spawner.spawn_count("s1"), 1);
}

#[tokio::test]
async fn failed_spawn_reports_error_and_closes() {
    let server = start_server().await;
    server.spawner.fail_next("adapter binary missing");

    let mut ws = connect_ws(server.addr, "/ws/sessions/bad").await;
    match next_event(&mut ws).await {
        ServerEvent::Error { code, message } => {
            assert_eq!(code, ErrorCode::SpawnFailure);
            assert!(message.contains("adapter binary missing"));
        }
        other => panic!("expected error frame, got {other:?}"),
    }

    // Nothing but the close follows.
    loop {
        match timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("frame within deadline")
        {
            Some(Ok(Message::Text(text))) => panic!("unexpected frame after error: {text}"),
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
            Some(Ok(_)) => {}
        }
    }
}

#[tokio::test]
async fn interaction_blocks_until_websocket_answer() {
    let server = start_server().await;
    let mut ws = connect_ws(server.addr, "/ws/sessions/s1").await;
    push_adapter_event(
        &server.spawner,
        "s1",
        AdapterEvent::Init {
            session_id: "s1".to_string(),
        },
    )
    .await;
    let _ = next_event(&mut ws).await;

    let client = reqwest::Client::new();
    let url = format!("http://{}/api/interactions", server.addr);
    let post = tokio::spawn(async move {
        client
            .post(url)
            .json(&json!({
                "session_id": "s1",
                "question": "continue?",
                "options": ["yes", "no"],
            }))
            .send()
            .await
            .expect("request sent")
    });

    let id = loop {
        if let ServerEvent::InteractionRequest { id, payload } = next_event(&mut ws).await {
            assert_eq!(payload.question, "continue?");
            assert_eq!(
                payload.options,
                Some(vec!["yes".to_string(), "no".to_string()])
            );
            break id;
        }
    };
    send_json(
        &mut ws,
        json!({"cmd": "interaction_response", "id": id, "data": "yes"}),
    )
    .await;

    let response = post.await.expect("join");
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let answer: Value = response.json().await.expect("json body");
    assert_eq!(answer, json!("yes"));

    // The resolution is rebroadcast to every observer.
    loop {
        if let ServerEvent::InteractionResponse { id: seen, data } = next_event(&mut ws).await {
            assert_eq!(seen, id);
            assert_eq!(data, InteractionAnswer::One("yes".to_string()));
            break;
        }
    }
}

#[tokio::test]
async fn interaction_without_connections_is_404_and_timeout_is_408() {
    let server = start_server().await;
    let client = reqwest::Client::new();
    let url = format!("http://{}/api/interactions", server.addr);

    let response = client
        .post(&url)
        .json(&json!({"session_id": "ghost", "question": "anyone?"}))
        .send()
        .await
        .expect("request sent");
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    let mut ws = connect_ws(server.addr, "/ws/sessions/s1").await;
    push_adapter_event(
        &server.spawner,
        "s1",
        AdapterEvent::Init {
            session_id: "s1".to_string(),
        },
    )
    .await;
    let _ = next_event(&mut ws).await;

    let response = client
        .post(&url)
        .json(&json!({"session_id": "s1", "question": "unanswered"}))
        .send()
        .await
        .expect("request sent");
    assert_eq!(response.status(), reqwest::StatusCode::REQUEST_TIMEOUT);
}

#[tokio::test]
async fn background_task_completes_on_exit() {
    let server = start_server().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{}/api/tasks", server.addr))
        .json(&json!({
            "tasks": [{"description": "index the repo", "background": true}],
        }))
        .send()
        .await
        .expect("request sent");
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let results: Vec<Value> = response.json().await.expect("json body");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["status"], json!("running"));
    let task_id = results[0]["task_id"].as_str().expect("task id").to_string();

    assert!(
        server
            .spawner
            .push_event(&task_id, AdapterEvent::Exit { exit_code: Some(0) })
    );

    let url = format!("http://{}/api/tasks/{}", server.addr, task_id);
    let mut info = json!(null);
    for _ in 0..200 {
        let response = client.get(&url).send().await.expect("request sent");
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        info = response.json().await.expect("json body");
        if info["status"] == json!("completed") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(info["status"], json!("completed"));
    assert_eq!(info["exit_code"], json!(0));
}

#[tokio::test]
async fn stop_task_over_http_is_idempotent() {
    let server = start_server().await;
    let client = reqwest::Client::new();

    let results: Vec<Value> = client
        .post(format!("http://{}/api/tasks", server.addr))
        .json(&json!({
            "tasks": [{"description": "long running survey", "background": true}],
        }))
        .send()
        .await
        .expect("request sent")
        .json()
        .await
        .expect("json body");
    let task_id = results[0]["task_id"].as_str().expect("task id").to_string();

    let stop_url = format!("http://{}/api/tasks/{}/stop", server.addr, task_id);
    let body: Value = client
        .post(&stop_url)
        .send()
        .await
        .expect("request sent")
        .json()
        .await
        .expect("json body");
    assert_eq!(body, json!({"stopped": true}));
    assert!(server.spawner.was_killed(&task_id));

    let body: Value = client
        .post(&stop_url)
        .send()
        .await
        .expect("request sent")
        .json()
        .await
        .expect("json body");
    assert_eq!(body, json!({"stopped": false}));

    let info: Value = client
        .get(format!("http://{}/api/tasks/{}", server.addr, task_id))
        .send()
        .await
        .expect("request sent")
        .json()
        .await
        .expect("json body");
    assert_eq!(info["status"], json!("failed"));

    let response = client
        .get(format!("http://{}/api/tasks/nope", server.addr))
        .send()
        .await
        .expect("request sent");
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn task_batch_reports_per_task_outcomes() {
    let server = start_server().await;
    server.spawner.fail_next("no adapter for tasks");

    let client = reqwest::Client::new();
    let results: Vec<Value> = client
        .post(format!("http://{}/api/tasks", server.addr))
        .json(&json!({
            "tasks": [
                {"description": "first", "background": true},
                {"description": "second", "background": true},
            ],
        }))
        .send()
        .await
        .expect("request sent")
        .json()
        .await
        .expect("json body");

    assert_eq!(results.len(), 2);
    assert!(
        results[0]["error"]
            .as_str()
            .expect("error entry")
            .contains("no adapter for tasks")
    );
    assert_eq!(results[1]["status"], json!("running"));
}

#[tokio::test]
async fn session_rest_surface_lists_metadata_and_history() {
    let server = start_server().await;
    let client = reqwest::Client::new();
    let base = format!("http://{}", server.addr);

    let sessions: Vec<Value> = client
        .get(format!("{base}/api/sessions"))
        .send()
        .await
        .expect("request sent")
        .json()
        .await
        .expect("json body");
    assert!(sessions.is_empty());

    let mut ws = connect_ws(server.addr, "/ws/sessions/s1").await;
    push_adapter_event(
        &server.spawner,
        "s1",
        AdapterEvent::Init {
            session_id: "s1".to_string(),
        },
    )
    .await;
    let _ = next_event(&mut ws).await;
    send_json(&mut ws, json!({"cmd": "user_message", "text": "hello"})).await;
    let _ = next_event(&mut ws).await;

    let sessions: Vec<Value> = client
        .get(format!("{base}/api/sessions"))
        .send()
        .await
        .expect("request sent")
        .json()
        .await
        .expect("json body");
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["id"], json!("s1"));
    assert_eq!(sessions[0]["status"], json!("running"));

    let meta: Value = client
        .get(format!("{base}/api/sessions/s1"))
        .send()
        .await
        .expect("request sent")
        .json()
        .await
        .expect("json body");
    assert_eq!(meta["kind"], json!("interactive"));

    let response = client
        .get(format!("{base}/api/sessions/nope"))
        .send()
        .await
        .expect("request sent");
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    let history: Vec<Value> = client
        .get(format!("{base}/api/sessions/s1/history"))
        .send()
        .await
        .expect("request sent")
        .json()
        .await
        .expect("json body");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0]["role"], json!("user"));
    assert_eq!(history[0]["content"], json!("hello"));
}

#[tokio::test]
async fn watch_socket_announces_status_changes() {
    let server = start_server().await;

    let mut session_ws = connect_ws(server.addr, "/ws/sessions/s1").await;
    push_adapter_event(
        &server.spawner,
        "s1",
        AdapterEvent::Init {
            session_id: "s1".to_string(),
        },
    )
    .await;
    let _ = next_event(&mut session_ws).await;

    // The watch stream opens with a snapshot of current metadata.
    let mut watch = connect_ws(server.addr, "/ws/sessions").await;
    match next_event(&mut watch).await {
        ServerEvent::SessionUpdated { session } => {
            assert_eq!(session.id, "s1");
            assert_eq!(session.status, SessionStatus::Running);
        }
        other => panic!("expected snapshot, got {other:?}"),
    }

    send_json(&mut session_ws, json!({"cmd": "terminate_session"})).await;
    loop {
        if let ServerEvent::SessionUpdated { session } = next_event(&mut watch).await {
            if session.status == SessionStatus::Terminated {
                assert_eq!(session.id, "s1");
                break;
            }
        }
    }
}

#[tokio::test]
async fn task_session_socket_streams_output_without_owning() {
    let server = start_server().await;
    let client = reqwest::Client::new();

    let results: Vec<Value> = client
        .post(format!("http://{}/api/tasks", server.addr))
        .json(&json!({
            "tasks": [{"description": "survey crates", "background": true}],
        }))
        .send()
        .await
        .expect("request sent")
        .json()
        .await
        .expect("json body");
    let task_id = results[0]["task_id"].as_str().expect("task id").to_string();

    let mut ws = connect_ws(server.addr, &format!("/ws/sessions/{task_id}")).await;
    for _ in 0..200 {
        if server.registry.connection_count(&task_id).await > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(server.spawner.push_event(&task_id, assistant_msg("m1", "progress")));
    loop {
        if let ServerEvent::Message { message } = next_event(&mut ws).await {
            if message.role == Role::Assistant {
                assert_eq!(message.content, "progress");
                break;
            }
        }
    }

    // Watching a task goes through the proxy path, never a second spawn.
    assert_eq!(server.spawner.spawn_count(&task_id), 1);
}

#[tokio::test]
async fn synced_task_follows_parent_turns() {
    let server = start_server().await;
    let mut parent = connect_ws(server.addr, "/ws/sessions/s1").await;
    push_adapter_event(
        &server.spawner,
        "s1",
        AdapterEvent::Init {
            session_id: "s1".to_string(),
        },
    )
    .await;
    let _ = next_event(&mut parent).await;

    let client = reqwest::Client::new();
    let results: Vec<Value> = client
        .post(format!("http://{}/api/tasks", server.addr))
        .json(&json!({
            "tasks": [{"description": "helper task", "background": true}],
            "sync_session": "s1",
        }))
        .send()
        .await
        .expect("request sent")
        .json()
        .await
        .expect("json body");
    let task_id = results[0]["task_id"].as_str().expect("task id").to_string();

    send_json(&mut parent, json!({"cmd": "user_message", "text": "also do x"})).await;
    let _ = next_event(&mut parent).await;

    let mut seen = Vec::new();
    for _ in 0..200 {
        seen.extend(server.spawner.sent_turns(&task_id));
        if seen.iter().any(|turn| turn == "also do x") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(seen.contains(&"helper task".to_string()), "turns: {seen:?}");
    assert!(seen.contains(&"also do x".to_string()), "turns: {seen:?}");

    // The parent's own adapter got the turn directly.
    assert!(server.spawner.sent_turns("s1").contains(&"also do x".to_string()));
}
