use crate::error::AmuxError;
use amux_protocol::{ChatMessage, SessionMeta, SessionStatus, now_epoch_ms};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use tracing::debug;

/// Filesystem session store: one directory per session under `root`,
/// holding `meta.json` and an append-only `history.jsonl` transcript.
///
/// History on disk is what makes a session re-connectable after its
/// process exits; `has_history` drives the registry's resume-vs-create
/// decision.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

const META_FILE: &str = "meta.json";
const HISTORY_FILE: &str = "history.jsonl";

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn save_session(&self, meta: &SessionMeta) -> Result<(), AmuxError> {
        let dir = self.checked_dir(&meta.id)?;
        fs::create_dir_all(&dir)?;
        let json = serde_json::to_string(meta)
            .map_err(|e| AmuxError::Storage(format!("serialize session meta: {e}")))?;
        fs::write(dir.join(META_FILE), json)?;
        Ok(())
    }

    pub fn load_session(&self, session_id: &str) -> Result<Option<SessionMeta>, AmuxError> {
        let path = self.checked_dir(session_id)?.join(META_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)?;
        let meta = serde_json::from_str(&raw)
            .map_err(|e| AmuxError::Storage(format!("parse {}: {e}", path.display())))?;
        Ok(Some(meta))
    }

    /// Patch the persisted status. Unknown sessions are a no-op: status
    /// writes race with eviction and must never fail teardown.
    pub fn update_status(&self, session_id: &str, status: SessionStatus) -> Result<(), AmuxError> {
        let Some(mut meta) = self.load_session(session_id)? else {
            debug!(session_id = %session_id, "status update for unknown session");
            return Ok(());
        };
        meta.status = status;
        meta.updated_at_epoch_ms = now_epoch_ms();
        self.save_session(&meta)
    }

    pub fn set_title(&self, session_id: &str, title: &str) -> Result<(), AmuxError> {
        let Some(mut meta) = self.load_session(session_id)? else {
            debug!(session_id = %session_id, "title update for unknown session");
            return Ok(());
        };
        meta.title = Some(title.to_string());
        meta.updated_at_epoch_ms = now_epoch_ms();
        self.save_session(&meta)
    }

    /// All persisted sessions, most recently created first. Entries that
    /// fail to parse are skipped, not fatal.
    pub fn list_sessions(&self) -> Result<Vec<SessionMeta>, AmuxError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut sessions = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let path = entry.path().join(META_FILE);
            let raw = match fs::read_to_string(&path) {
                Ok(raw) => raw,
                Err(_) => continue,
            };
            match serde_json::from_str::<SessionMeta>(&raw) {
                Ok(meta) => sessions.push(meta),
                Err(e) => debug!(path = %path.display(), error = %e, "skipping unreadable session meta"),
            }
        }
        sessions.sort_by(|a, b| b.created_at_epoch_ms.cmp(&a.created_at_epoch_ms));
        Ok(sessions)
    }

    pub fn persist_message(&self, session_id: &str, message: &ChatMessage) -> Result<(), AmuxError> {
        let dir = self.checked_dir(session_id)?;
        fs::create_dir_all(&dir)?;
        let line = serde_json::to_string(message)
            .map_err(|e| AmuxError::Storage(format!("serialize message: {e}")))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(HISTORY_FILE))?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        Ok(())
    }

    /// Full transcript in append order. Missing sessions yield an empty
    /// transcript; corrupt lines are skipped.
    pub fn fetch_history(&self, session_id: &str) -> Result<Vec<ChatMessage>, AmuxError> {
        let path = self.checked_dir(session_id)?.join(HISTORY_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&path)?;
        let mut messages = Vec::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<ChatMessage>(line) {
                Ok(message) => messages.push(message),
                Err(e) => debug!(session_id = %session_id, error = %e, "skipping corrupt history line"),
            }
        }
        Ok(messages)
    }

    pub fn has_history(&self, session_id: &str) -> bool {
        let Ok(dir) = self.checked_dir(session_id) else {
            return false;
        };
        fs::metadata(dir.join(HISTORY_FILE))
            .map(|m| m.len() > 0)
            .unwrap_or(false)
    }

    // Session ids become directory names, so anything that is not a
    // plain identifier is rejected before it touches the filesystem.
    fn checked_dir(&self, session_id: &str) -> Result<PathBuf, AmuxError> {
        let valid = !session_id.is_empty()
            && session_id.len() <= 128
            && session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(AmuxError::Storage(format!(
                "invalid session id: {session_id:?}"
            )));
        }
        Ok(self.root.join(session_id))
    }
}
