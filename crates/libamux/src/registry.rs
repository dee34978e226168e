use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, broadcast, mpsc};
use tracing::{debug, info, warn};

use amux_protocol::{
    AdapterEvent, ChatMessage, InteractionPayload, Role, ServerEvent, SessionId, SessionInfo,
    SessionKind, SessionMeta, SessionStatus, now_epoch_ms,
};

use crate::adapter::{AdapterSpawner, InputTurn, SpawnMode, SpawnOptions};
use crate::error::AmuxError;
use crate::store::FsStore;

const WATCH_CHANNEL_CAPACITY: usize = 256;
pub(crate) const DEFAULT_ADAPTER_NAME: &str = "default";

/// One attached client connection. Unbounded so log replay and fan-out
/// never block the registry lock; the transport side drains it.
pub type ConnectionSender = mpsc::UnboundedSender<ServerEvent>;

/// The open question of a session, at most one at a time.
#[derive(Debug, Clone)]
pub struct OpenInteraction {
    pub id: String,
    pub payload: InteractionPayload,
}

/// A session whose adapter process this registry owns.
struct SessionRecord {
    meta: SessionMeta,
    handle: crate::adapter::AdapterHandle,
    resumed: bool,
    connections: HashMap<u64, ConnectionSender>,
    event_log: Vec<ServerEvent>,
    current_interaction: Option<OpenInteraction>,
    last_assistant_id: Option<String>,
}

/// A session observed here without a locally owned process.
#[derive(Default)]
struct ExternalRecord {
    connections: HashMap<u64, ConnectionSender>,
    event_log: Vec<ServerEvent>,
    current_interaction: Option<OpenInteraction>,
    last_assistant_id: Option<String>,
}

#[derive(Default)]
struct RegistryInner {
    owned: HashMap<String, SessionRecord>,
    external: HashMap<String, ExternalRecord>,
    next_connection_id: u64,
}

/// Holds every live session: the single adapter handle per id, the
/// attached connections, the append-only event log replayed to late
/// joiners, and the open interaction marker.
///
/// All mutation happens under one lock, taken per operation and never
/// held across an await, so one full command is processed before the
/// next begins.
pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
    watchers: broadcast::Sender<ServerEvent>,
    store: FsStore,
    spawner: Arc<dyn AdapterSpawner>,
}

impl SessionRegistry {
    pub fn new(store: FsStore, spawner: Arc<dyn AdapterSpawner>) -> Self {
        let (watchers, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            inner: Mutex::new(RegistryInner::default()),
            watchers,
            store,
            spawner,
        }
    }

    pub fn store(&self) -> &FsStore {
        &self.store
    }

    /// Receiver for the global session-list broadcast. Carries only
    /// `session_updated` events, independent of any session id.
    pub fn subscribe_watchers(&self) -> broadcast::Receiver<ServerEvent> {
        self.watchers.subscribe()
    }

    /// Return the existing live record for `session_id`, or start one.
    ///
    /// This is the sole mechanism enforcing at-most-one process per id:
    /// the check and the spawn happen under the same lock, so concurrent
    /// callers converge on a single handle. Resume-vs-create is decided
    /// by whether persisted history exists. On spawn failure nothing is
    /// registered.
    pub async fn get_or_create(
        self: &Arc<Self>,
        session_id: &str,
        options: &SpawnOptions,
    ) -> Result<(), AmuxError> {
        let mut inner = self.inner.lock().await;
        if inner.owned.contains_key(session_id) {
            return Ok(());
        }

        let existing = self.store.load_session(session_id)?;
        let adapter_name = options
            .adapter
            .clone()
            .or_else(|| existing.as_ref().map(|m| m.adapter.clone()))
            .unwrap_or_else(|| DEFAULT_ADAPTER_NAME.to_string());
        let mode = if self.store.has_history(session_id) {
            SpawnMode::Resume
        } else {
            SpawnMode::Create
        };
        let spawn_options = SpawnOptions {
            adapter: Some(adapter_name.clone()),
            prompt_addendum: options.prompt_addendum.clone(),
        };

        let mut handle = self.spawner.spawn(&session_id.to_string(), mode, &spawn_options)?;
        let events = handle.take_events().ok_or_else(|| {
            AmuxError::SpawnFailure(session_id.to_string(), "event stream missing".to_string())
        })?;

        let meta = match existing {
            Some(mut meta) => {
                meta.status = SessionStatus::Running;
                meta.adapter = adapter_name;
                meta.updated_at_epoch_ms = now_epoch_ms();
                meta
            }
            None => SessionMeta {
                id: session_id.to_string(),
                kind: SessionKind::Interactive,
                status: SessionStatus::Running,
                adapter: adapter_name,
                title: None,
                created_at_epoch_ms: now_epoch_ms(),
                updated_at_epoch_ms: now_epoch_ms(),
            },
        };
        self.store.save_session(&meta)?;

        info!(session_id = %session_id, adapter = %meta.adapter, resumed = mode == SpawnMode::Resume, "adapter session started");
        self.notify_watchers(&meta);

        inner.owned.insert(
            session_id.to_string(),
            SessionRecord {
                meta,
                handle,
                resumed: mode == SpawnMode::Resume,
                connections: HashMap::new(),
                event_log: Vec::new(),
                current_interaction: None,
                last_assistant_id: None,
            },
        );
        drop(inner);

        let registry = Arc::clone(self);
        let pump_session = session_id.to_string();
        tokio::spawn(async move {
            let mut events = events;
            while let Some(event) = events.recv().await {
                registry.ingest(&pump_session, event).await;
            }
            debug!(session_id = %pump_session, "adapter event stream closed");
        });

        Ok(())
    }

    /// Attach a connection to an owned session: replay the event log in
    /// order, then register for live events, atomically.
    pub async fn attach(
        &self,
        session_id: &str,
        tx: ConnectionSender,
    ) -> Result<u64, AmuxError> {
        let mut inner = self.inner.lock().await;
        let connection_id = inner.next_connection_id;
        inner.next_connection_id += 1;
        let record = inner
            .owned
            .get_mut(session_id)
            .ok_or_else(|| AmuxError::SessionNotActive(session_id.to_string()))?;
        for event in &record.event_log {
            let _ = tx.send(event.clone());
        }
        record.connections.insert(connection_id, tx);
        debug!(session_id = %session_id, connection_id, "connection attached");
        Ok(connection_id)
    }

    /// Attach to (or create) an external record: a session observed here
    /// without a locally owned process, such as a task session.
    pub async fn attach_external(&self, session_id: &str, tx: ConnectionSender) -> u64 {
        let mut inner = self.inner.lock().await;
        let connection_id = inner.next_connection_id;
        inner.next_connection_id += 1;
        let record = inner.external.entry(session_id.to_string()).or_default();
        for event in &record.event_log {
            let _ = tx.send(event.clone());
        }
        record.connections.insert(connection_id, tx);
        debug!(session_id = %session_id, connection_id, "external connection attached");
        connection_id
    }

    /// Drop a connection. Owned processes survive their last observer;
    /// an emptied external record is forgotten entirely.
    pub async fn detach(&self, session_id: &str, connection_id: u64) {
        let mut inner = self.inner.lock().await;
        if let Some(record) = inner.owned.get_mut(session_id) {
            record.connections.remove(&connection_id);
            return;
        }
        if let Some(record) = inner.external.get_mut(session_id) {
            record.connections.remove(&connection_id);
            if record.connections.is_empty() {
                inner.external.remove(session_id);
                debug!(session_id = %session_id, "external record dropped");
            }
        }
    }

    pub async fn connection_count(&self, session_id: &str) -> usize {
        let inner = self.inner.lock().await;
        if let Some(record) = inner.owned.get(session_id) {
            return record.connections.len();
        }
        inner
            .external
            .get(session_id)
            .map(|r| r.connections.len())
            .unwrap_or(0)
    }

    /// Append an event to a session's log and fan it out to its
    /// connections. Sessions not present in either table are a no-op.
    pub async fn post_event(&self, session_id: &str, event: ServerEvent) {
        let mut inner = self.inner.lock().await;
        if let Some(record) = inner.owned.get_mut(session_id) {
            record.event_log.push(event.clone());
            fan_out(&mut record.connections, &event);
        } else if let Some(record) = inner.external.get_mut(session_id) {
            record.event_log.push(event.clone());
            fan_out(&mut record.connections, &event);
        }
    }

    /// Handle a `user_message` command: persist, mark running, broadcast,
    /// and forward to the owned handle threaded to the latest assistant
    /// message. External sessions persist and broadcast only.
    pub async fn user_message(
        &self,
        session_id: &str,
        text: &str,
    ) -> Result<ChatMessage, AmuxError> {
        let mut inner = self.inner.lock().await;
        if let Some(record) = inner.owned.get_mut(session_id) {
            let message = ChatMessage::user(text, record.last_assistant_id.clone());
            self.store.persist_message(session_id, &message)?;
            if record.meta.status != SessionStatus::Running {
                record.meta.status = SessionStatus::Running;
                record.meta.updated_at_epoch_ms = now_epoch_ms();
                self.persist_status(session_id, SessionStatus::Running);
            }
            let event = ServerEvent::Message {
                message: message.clone(),
            };
            record.event_log.push(event.clone());
            fan_out(&mut record.connections, &event);
            record.handle.emit(InputTurn::new(
                text,
                record.last_assistant_id.clone(),
            ))?;
            return Ok(message);
        }
        if let Some(record) = inner.external.get_mut(session_id) {
            let message = ChatMessage::user(text, record.last_assistant_id.clone());
            self.store.persist_message(session_id, &message)?;
            self.persist_status(session_id, SessionStatus::Running);
            let event = ServerEvent::Message {
                message: message.clone(),
            };
            record.event_log.push(event.clone());
            fan_out(&mut record.connections, &event);
            return Ok(message);
        }
        Err(AmuxError::SessionNotActive(session_id.to_string()))
    }

    /// Forward an interrupt to the owned handle. External and unknown
    /// sessions are a no-op.
    pub async fn interrupt(&self, session_id: &str) -> Result<(), AmuxError> {
        let inner = self.inner.lock().await;
        match inner.owned.get(session_id) {
            Some(record) => record.handle.interrupt(),
            None => Ok(()),
        }
    }

    /// Force the owned handle to stop and evict the record. Idempotent:
    /// a second call finds nothing and still succeeds. The persisted
    /// status becomes `terminated` either way.
    pub async fn terminate(&self, session_id: &str) -> Result<(), AmuxError> {
        let mut inner = self.inner.lock().await;
        if let Some(mut record) = inner.owned.remove(session_id) {
            if let Err(e) = record.handle.kill() {
                warn!(session_id = %session_id, error = %e, "kill on terminate");
            }
            info!(session_id = %session_id, "session terminated");
        } else {
            inner.external.remove(session_id);
        }
        drop(inner);
        self.persist_status(session_id, SessionStatus::Terminated);
        if let Ok(Some(meta)) = self.store.load_session(session_id) {
            self.notify_watchers(&meta);
        }
        Ok(())
    }

    /// Kill every owned handle at process exit. Persisted status is left
    /// untouched so the sessions resume on the next start.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        let drained: Vec<(SessionId, SessionRecord)> = inner.owned.drain().collect();
        inner.external.clear();
        drop(inner);
        for (session_id, mut record) in drained {
            if let Err(e) = record.handle.kill() {
                debug!(session_id = %session_id, error = %e, "kill on shutdown");
            }
        }
        info!("registry shut down");
    }

    /// Record the open interaction for a session and broadcast the
    /// request. Fails when no connection is attached: a question nobody
    /// can see would only ever time out.
    pub async fn open_interaction(
        &self,
        session_id: &str,
        interaction: OpenInteraction,
    ) -> Result<(), AmuxError> {
        let mut inner = self.inner.lock().await;
        let event = ServerEvent::InteractionRequest {
            id: interaction.id.clone(),
            payload: interaction.payload.clone(),
        };
        if let Some(record) = inner.owned.get_mut(session_id) {
            if record.connections.is_empty() {
                return Err(AmuxError::SessionNotActive(session_id.to_string()));
            }
            record.current_interaction = Some(interaction);
            record.meta.status = SessionStatus::WaitingInput;
            record.meta.updated_at_epoch_ms = now_epoch_ms();
            record.event_log.push(event.clone());
            fan_out(&mut record.connections, &event);
        } else if let Some(record) = inner.external.get_mut(session_id) {
            if record.connections.is_empty() {
                return Err(AmuxError::SessionNotActive(session_id.to_string()));
            }
            record.current_interaction = Some(interaction);
            record.event_log.push(event.clone());
            fan_out(&mut record.connections, &event);
        } else {
            return Err(AmuxError::SessionNotActive(session_id.to_string()));
        }
        drop(inner);
        self.persist_status(session_id, SessionStatus::WaitingInput);
        if let Ok(Some(meta)) = self.store.load_session(session_id) {
            self.notify_watchers(&meta);
        }
        Ok(())
    }

    /// Clear the open-interaction marker if (and only if) the id still
    /// matches, restoring the running status. Returns whether anything
    /// was cleared. Safe to call repeatedly and after eviction.
    pub async fn clear_interaction(&self, session_id: &str, interaction_id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let cleared = if let Some(record) = inner.owned.get_mut(session_id) {
            match &record.current_interaction {
                Some(open) if open.id == interaction_id => {
                    record.current_interaction = None;
                    record.meta.status = SessionStatus::Running;
                    record.meta.updated_at_epoch_ms = now_epoch_ms();
                    true
                }
                _ => false,
            }
        } else if let Some(record) = inner.external.get_mut(session_id) {
            match &record.current_interaction {
                Some(open) if open.id == interaction_id => {
                    record.current_interaction = None;
                    true
                }
                _ => false,
            }
        } else {
            false
        };
        drop(inner);
        if cleared {
            self.persist_status(session_id, SessionStatus::Running);
            if let Ok(Some(meta)) = self.store.load_session(session_id) {
                self.notify_watchers(&meta);
            }
        }
        cleared
    }

    pub async fn current_interaction(&self, session_id: &str) -> Option<OpenInteraction> {
        let inner = self.inner.lock().await;
        if let Some(record) = inner.owned.get(session_id) {
            return record.current_interaction.clone();
        }
        inner
            .external
            .get(session_id)
            .and_then(|r| r.current_interaction.clone())
    }

    /// Consume one adapter event from the pump.
    async fn ingest(&self, session_id: &str, event: AdapterEvent) {
        match event {
            AdapterEvent::Init { .. } => {
                let mut inner = self.inner.lock().await;
                if let Some(record) = inner.owned.get_mut(session_id) {
                    let info = SessionInfo {
                        session_id: session_id.to_string(),
                        pid: record.handle.pid(),
                        adapter: record.meta.adapter.clone(),
                        resumed: record.resumed,
                    };
                    let event = ServerEvent::SessionInfo { info };
                    record.event_log.push(event.clone());
                    fan_out(&mut record.connections, &event);
                }
            }
            AdapterEvent::Message { message } => {
                if let Err(e) = self.store.persist_message(session_id, &message) {
                    warn!(session_id = %session_id, error = %e, "persist adapter message");
                }
                let mut inner = self.inner.lock().await;
                if let Some(record) = inner.owned.get_mut(session_id) {
                    if message.role == Role::Assistant {
                        record.last_assistant_id = Some(message.id.clone());
                    }
                    let event = to_server_event(message);
                    record.event_log.push(event.clone());
                    fan_out(&mut record.connections, &event);
                }
            }
            AdapterEvent::Summary { summary } => {
                if let Err(e) = self.store.set_title(session_id, &summary) {
                    warn!(session_id = %session_id, error = %e, "persist summary");
                }
                let mut inner = self.inner.lock().await;
                if let Some(record) = inner.owned.get_mut(session_id) {
                    record.meta.title = Some(summary);
                    record.meta.updated_at_epoch_ms = now_epoch_ms();
                    self.notify_watchers(&record.meta);
                }
            }
            AdapterEvent::Stop => {
                debug!(session_id = %session_id, "adapter stop");
            }
            AdapterEvent::Exit { exit_code } => {
                self.record_exit(session_id, exit_code).await;
            }
        }
    }

    /// The one eviction path: broadcast the exit as an error event, map
    /// the code onto a terminal status, persist it, forget the record.
    /// Safe when the record is already gone (terminate races exit).
    async fn record_exit(&self, session_id: &str, exit_code: Option<i32>) {
        let mut inner = self.inner.lock().await;
        let Some(mut record) = inner.owned.remove(session_id) else {
            return;
        };
        drop(inner);

        let status = if exit_code == Some(0) {
            SessionStatus::Completed
        } else {
            SessionStatus::Failed
        };
        let error = AmuxError::ProcessExit {
            session_id: session_id.to_string(),
            exit_code,
        };
        let (code, message) = error.to_error_code();
        let event = ServerEvent::error(message, code);
        record.event_log.push(event.clone());
        fan_out(&mut record.connections, &event);

        record.meta.status = status;
        record.meta.updated_at_epoch_ms = now_epoch_ms();
        info!(session_id = %session_id, exit_code = ?exit_code, status = ?status, "adapter session exited");
        self.persist_status(session_id, status);
        self.notify_watchers(&record.meta);
    }

    fn persist_status(&self, session_id: &str, status: SessionStatus) {
        if let Err(e) = self.store.update_status(session_id, status) {
            warn!(session_id = %session_id, error = %e, "persist session status");
        }
    }

    /// Re-announce a session's persisted metadata on the watch set.
    /// Used by controllers that patch the store directly.
    pub(crate) fn publish_session_meta(&self, session_id: &str) {
        if let Ok(Some(meta)) = self.store.load_session(session_id) {
            self.notify_watchers(&meta);
        }
    }

    fn notify_watchers(&self, meta: &SessionMeta) {
        let _ = self.watchers.send(ServerEvent::SessionUpdated {
            session: meta.clone(),
        });
    }
}

/// Deliver one event to every open connection, forgetting closed ones.
/// A closed transport is a silent no-op, never an error.
fn fan_out(connections: &mut HashMap<u64, ConnectionSender>, event: &ServerEvent) {
    connections.retain(|_, tx| tx.send(event.clone()).is_ok());
}

/// Adapter messages with the tool role surface as `tool_result` events;
/// everything else stays a plain message.
pub(crate) fn to_server_event(message: ChatMessage) -> ServerEvent {
    if message.role == Role::Tool {
        ServerEvent::ToolResult {
            tool_call_id: message.tool_call_id.clone().unwrap_or_default(),
            is_error: message.is_error,
            output: message.content,
        }
    } else {
        ServerEvent::Message { message }
    }
}
