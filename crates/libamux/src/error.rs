use amux_protocol::{ErrorCode, SessionId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AmuxError {
    #[error("adapter failed to start for session {0}: {1}")]
    SpawnFailure(SessionId, String),

    #[error("session not active: {0}")]
    SessionNotActive(SessionId),

    #[error("interaction timed out: {0}")]
    InteractionTimeout(String),

    #[error("adapter process for session {session_id} exited with code {exit_code:?}")]
    ProcessExit {
        session_id: SessionId,
        exit_code: Option<i32>,
    },

    #[error("sync relay failed for task {0}: {1}")]
    SyncRelayFailure(SessionId, String),

    #[error("signal delivery failed for session {0}: {1}")]
    SignalDeliveryFailure(SessionId, String),

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl AmuxError {
    /// Convert to protocol error code and sanitized message.
    pub fn to_error_code(&self) -> (ErrorCode, String) {
        match self {
            AmuxError::SpawnFailure(..) => (ErrorCode::SpawnFailure, self.to_string()),
            AmuxError::SessionNotActive(_) => (ErrorCode::SessionNotActive, self.to_string()),
            AmuxError::InteractionTimeout(_) => (ErrorCode::InteractionTimeout, self.to_string()),
            AmuxError::ProcessExit { .. } => (ErrorCode::ProcessExit, self.to_string()),
            AmuxError::SyncRelayFailure(..) => (ErrorCode::SyncRelayFailure, self.to_string()),
            AmuxError::SignalDeliveryFailure(..) => {
                (ErrorCode::SignalDeliveryFailure, self.to_string())
            }
            AmuxError::InvalidCommand(_) => (ErrorCode::InvalidCommand, self.to_string()),
            AmuxError::Storage(_) => (ErrorCode::ServerError, "internal storage error".to_string()),
            AmuxError::Io(_) => (ErrorCode::ServerError, "internal I/O error".to_string()),
        }
    }
}
