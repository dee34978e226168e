use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Unique identifier for a session. Task ids are session ids too.
pub type SessionId = String;

/// Client-to-server commands sent as JSON text frames over a session socket.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum ClientCommand {
    UserMessage {
        text: String,
    },
    Interrupt,
    TerminateSession,
    InteractionResponse {
        id: String,
        data: InteractionAnswer,
    },
}

/// Server-to-client events fanned out to every connection of a session.
///
/// `SessionUpdated` is the exception: it is only carried on the global
/// watch socket, never on per-session sockets.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    Message {
        message: ChatMessage,
    },
    SessionInfo {
        info: SessionInfo,
    },
    ToolResult {
        tool_call_id: String,
        is_error: bool,
        output: String,
    },
    InteractionRequest {
        id: String,
        payload: InteractionPayload,
    },
    InteractionResponse {
        id: String,
        data: InteractionAnswer,
    },
    SessionUpdated {
        session: SessionMeta,
    },
    Error {
        message: String,
        code: ErrorCode,
    },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>, code: ErrorCode) -> Self {
        ServerEvent::Error {
            message: message.into(),
            code,
        }
    }
}

/// Events an adapter process emits on stdout, one JSON object per line.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AdapterEvent {
    Init {
        session_id: SessionId,
    },
    Message {
        message: ChatMessage,
    },
    Summary {
        summary: String,
    },
    Stop,
    Exit {
        #[serde(default)]
        exit_code: Option<i32>,
    },
}

/// Commands written to an adapter process on stdin, one JSON object per line.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum AdapterCommand {
    Turn {
        text: String,
        #[serde(default)]
        parent_id: Option<String>,
    },
    Interrupt,
}

/// One transcript entry. `parent_id` threads a turn to the message it
/// answers; tool output carries `tool_call_id` and `is_error`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    pub created_at_epoch_ms: u64,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>, parent_id: Option<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role: Role::User,
            content: text.into(),
            parent_id,
            tool_call_id: None,
            is_error: false,
            created_at_epoch_ms: now_epoch_ms(),
        }
    }

    pub fn assistant(text: impl Into<String>, parent_id: Option<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role: Role::Assistant,
            content: text.into(),
            parent_id,
            tool_call_id: None,
            is_error: false,
            created_at_epoch_ms: now_epoch_ms(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// Live-process details announced to connections after attach.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SessionInfo {
    pub session_id: SessionId,
    #[serde(default)]
    pub pid: Option<u32>,
    pub adapter: String,
    #[serde(default)]
    pub resumed: bool,
}

/// Persisted session metadata; the session list view is built from these.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SessionMeta {
    pub id: SessionId,
    pub kind: SessionKind,
    pub status: SessionStatus,
    pub adapter: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub created_at_epoch_ms: u64,
    pub updated_at_epoch_ms: u64,
}

/// Task sessions are proxied by the gateway without owning a process.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Interactive,
    Task,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    WaitingInput,
    Completed,
    Failed,
    Terminated,
}

/// A question posed to whoever is watching the session.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct InteractionPayload {
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    #[serde(default)]
    pub multiselect: bool,
}

/// A single choice or free-form string, or several choices for
/// multiselect questions.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum InteractionAnswer {
    One(String),
    Many(Vec<String>),
}

/// Parameters for starting one task.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TaskSpec {
    pub description: String,
    #[serde(rename = "type", default)]
    pub task_type: TaskType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter: Option<String>,
    #[serde(default)]
    pub background: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    #[default]
    Default,
    Spec,
    Entity,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Completed,
    Failed,
}

/// Snapshot of a task record returned by the query surface.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TaskInfo {
    pub task_id: SessionId,
    pub description: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter: Option<String>,
    pub background: bool,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub logs: Vec<String>,
}

/// Error codes for structured error handling.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    SpawnFailure,
    SessionNotActive,
    InteractionTimeout,
    ProcessExit,
    SyncRelayFailure,
    SignalDeliveryFailure,
    InvalidCommand,
    ServerError,
}

/// Milliseconds since the Unix epoch, for message and session timestamps.
pub fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
