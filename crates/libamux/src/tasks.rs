//! Background and foreground task orchestration.
//!
//! A task is a child session driven by its own adapter handle. The manager
//! keeps an in-memory record per task (records outlive the task so finished
//! work stays inspectable), persists the task transcript through the shared
//! store, and optionally polls a parent session so new user turns flow into
//! the task and task output flows back out.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use amux_protocol::{
    AdapterEvent, ChatMessage, Role, ServerEvent, SessionId, SessionKind, SessionMeta,
    SessionStatus, TaskInfo, TaskSpec, TaskStatus, now_epoch_ms,
};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::adapter::{AdapterHandle, AdapterSpawner, InputTurn, SpawnMode, SpawnOptions};
use crate::error::AmuxError;
use crate::registry::{DEFAULT_ADAPTER_NAME, SessionRegistry, to_server_event};

/// How often a synchronized task re-reads its parent transcript.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

struct SyncState {
    session_id: SessionId,
    last_event_index: usize,
    seen_message_ids: HashSet<String>,
    poller: Option<JoinHandle<()>>,
}

struct TaskRecord {
    description: String,
    task_type: amux_protocol::TaskType,
    name: Option<String>,
    adapter: Option<String>,
    background: bool,
    status: TaskStatus,
    exit_code: Option<i32>,
    logs: Vec<String>,
    handle: Option<AdapterHandle>,
    last_assistant_id: Option<String>,
    sync: Option<SyncState>,
    on_stop: Option<oneshot::Sender<()>>,
}

impl TaskRecord {
    fn to_info(&self, task_id: &str) -> TaskInfo {
        TaskInfo {
            task_id: task_id.to_string(),
            description: self.description.clone(),
            task_type: self.task_type,
            name: self.name.clone(),
            adapter: self.adapter.clone(),
            background: self.background,
            status: self.status,
            exit_code: self.exit_code,
            logs: self.logs.clone(),
        }
    }
}

/// Moves a running record to a terminal status. Sticky: only the first
/// caller wins, later calls (second stop, duplicate exit) are no-ops.
/// Dropping the stored handle reaps the adapter process.
fn finalize(
    record: &mut TaskRecord,
    task_id: &str,
    status: TaskStatus,
    exit_code: Option<i32>,
) -> bool {
    if record.status != TaskStatus::Running {
        return false;
    }
    record.status = status;
    record.exit_code = exit_code;
    record.handle = None;
    if let Some(sync) = record.sync.as_mut() {
        if let Some(poller) = sync.poller.take() {
            poller.abort();
        }
    }
    if let Some(tx) = record.on_stop.take() {
        let _ = tx.send(());
    }
    info!(task_id = %task_id, status = ?status, exit_code = ?exit_code, "task finished");
    true
}

fn session_status(status: TaskStatus) -> SessionStatus {
    match status {
        TaskStatus::Running => SessionStatus::Running,
        TaskStatus::Completed => SessionStatus::Completed,
        TaskStatus::Failed => SessionStatus::Failed,
    }
}

pub struct TaskManager {
    registry: Arc<SessionRegistry>,
    spawner: Arc<dyn AdapterSpawner>,
    tasks: Mutex<HashMap<String, TaskRecord>>,
    poll_interval: Duration,
}

impl TaskManager {
    pub fn new(registry: Arc<SessionRegistry>, spawner: Arc<dyn AdapterSpawner>) -> Self {
        Self {
            registry,
            spawner,
            tasks: Mutex::new(HashMap::new()),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Shorter interval for tests.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Start a task session. Tasks are always fresh spawns, resume never
    /// applies. The description is injected as the first input turn. With
    /// `background` false the call blocks until the record leaves `running`;
    /// otherwise it returns the running snapshot right away. Passing
    /// `sync_session` enables server sync against that parent.
    ///
    /// On spawn failure the record is kept, marked failed with the error in
    /// its logs, and the error is returned so batch starts can report
    /// per-task outcomes.
    pub async fn start_task(
        self: &Arc<Self>,
        spec: TaskSpec,
        sync_session: Option<SessionId>,
    ) -> Result<TaskInfo, AmuxError> {
        let task_id = uuid::Uuid::new_v4().to_string();
        let (stop_tx, stop_rx) = oneshot::channel();

        {
            let mut tasks = self.tasks.lock().await;
            tasks.insert(
                task_id.clone(),
                TaskRecord {
                    description: spec.description.clone(),
                    task_type: spec.task_type,
                    name: spec.name.clone(),
                    adapter: spec.adapter.clone(),
                    background: spec.background,
                    status: TaskStatus::Running,
                    exit_code: None,
                    logs: Vec::new(),
                    handle: None,
                    last_assistant_id: None,
                    sync: None,
                    on_stop: Some(stop_tx),
                },
            );
        }

        let meta = SessionMeta {
            id: task_id.clone(),
            kind: SessionKind::Task,
            status: SessionStatus::Running,
            adapter: spec
                .adapter
                .clone()
                .unwrap_or_else(|| DEFAULT_ADAPTER_NAME.to_string()),
            title: spec.name.clone(),
            created_at_epoch_ms: now_epoch_ms(),
            updated_at_epoch_ms: now_epoch_ms(),
        };
        if let Err(e) = self.registry.store().save_session(&meta) {
            warn!(task_id = %task_id, error = %e, "persist task session");
        }
        self.registry.publish_session_meta(&task_id);

        let options = SpawnOptions {
            adapter: spec.adapter.clone(),
            prompt_addendum: None,
        };
        let mut handle = match self.spawner.spawn(&task_id, SpawnMode::Create, &options) {
            Ok(handle) => handle,
            Err(e) => {
                self.fail_to_start(&task_id, &e).await;
                return Err(e);
            }
        };
        let mut events = match handle.take_events() {
            Some(events) => events,
            None => {
                let e = AmuxError::SpawnFailure(
                    task_id.clone(),
                    "spawner returned a handle without an event stream".to_string(),
                );
                self.fail_to_start(&task_id, &e).await;
                return Err(e);
            }
        };
        info!(task_id = %task_id, background = spec.background, "task started");

        // The description is both the first transcript entry and the first turn.
        let first_turn = ChatMessage::user(spec.description.clone(), None);
        if let Err(e) = self.registry.store().persist_message(&task_id, &first_turn) {
            warn!(task_id = %task_id, error = %e, "persist task description");
        }
        self.registry
            .post_event(&task_id, to_server_event(first_turn))
            .await;
        if let Err(e) = handle.emit(InputTurn::new(spec.description.clone(), None)) {
            warn!(task_id = %task_id, error = %e, "send task description");
        }

        let sync_installed = {
            let mut tasks = self.tasks.lock().await;
            match tasks.get_mut(&task_id) {
                Some(record) if record.status == TaskStatus::Running => {
                    record.handle = Some(handle);
                    if let Some(parent) = sync_session {
                        let start_index = match self.registry.store().fetch_history(&parent) {
                            Ok(history) => history.len(),
                            Err(e) => {
                                record.logs.push(
                                    AmuxError::SyncRelayFailure(parent.clone(), e.to_string())
                                        .to_string(),
                                );
                                0
                            }
                        };
                        record.sync = Some(SyncState {
                            session_id: parent,
                            last_event_index: start_index,
                            seen_message_ids: HashSet::new(),
                            poller: None,
                        });
                        true
                    } else {
                        false
                    }
                }
                // Stopped while starting; reap the fresh process.
                _ => {
                    if let Err(e) = handle.kill() {
                        debug!(task_id = %task_id, error = %e, "kill during startup race");
                    }
                    false
                }
            }
        };

        let pump = Arc::clone(self);
        let pump_id = task_id.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                pump.handle_event(&pump_id, event).await;
            }
            debug!(task_id = %pump_id, "task event stream closed");
        });

        if sync_installed {
            let manager = Arc::clone(self);
            let poll_id = task_id.clone();
            let poller = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(manager.poll_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    if !manager.sync_parent_turns(&poll_id).await {
                        break;
                    }
                }
                debug!(task_id = %poll_id, "server sync stopped");
            });
            let mut tasks = self.tasks.lock().await;
            match tasks.get_mut(&task_id).and_then(|record| record.sync.as_mut()) {
                Some(sync) => sync.poller = Some(poller),
                // Finalized between the two lock sections.
                None => poller.abort(),
            }
        }

        if !spec.background {
            let _ = stop_rx.await;
        }
        self.get_task(&task_id)
            .await
            .ok_or_else(|| AmuxError::SessionNotActive(task_id))
    }

    pub async fn get_task(&self, task_id: &str) -> Option<TaskInfo> {
        self.tasks
            .lock()
            .await
            .get(task_id)
            .map(|record| record.to_info(task_id))
    }

    pub async fn all_tasks(&self) -> Vec<TaskInfo> {
        self.tasks
            .lock()
            .await
            .iter()
            .map(|(task_id, record)| record.to_info(task_id))
            .collect()
    }

    /// Kill the handle if one is live and finalize the record as failed.
    /// Returns whether a running task was actually stopped.
    pub async fn stop_task(&self, task_id: &str) -> bool {
        let stopped = {
            let mut tasks = self.tasks.lock().await;
            let Some(record) = tasks.get_mut(task_id) else {
                return false;
            };
            if record.status != TaskStatus::Running {
                return false;
            }
            if let Some(mut handle) = record.handle.take() {
                if let Err(e) = handle.kill() {
                    warn!(task_id = %task_id, error = %e, "stop task");
                    record.logs.push(e.to_string());
                }
            }
            finalize(record, task_id, TaskStatus::Failed, None)
        };
        if stopped {
            self.persist_task_status(task_id, TaskStatus::Failed);
        }
        stopped
    }

    async fn fail_to_start(&self, task_id: &str, error: &AmuxError) {
        warn!(task_id = %task_id, error = %error, "task spawn failed");
        {
            let mut tasks = self.tasks.lock().await;
            if let Some(record) = tasks.get_mut(task_id) {
                record.logs.push(error.to_string());
                finalize(record, task_id, TaskStatus::Failed, None);
            }
        }
        self.persist_task_status(task_id, TaskStatus::Failed);
    }

    async fn handle_event(&self, task_id: &str, event: AdapterEvent) {
        let finished = {
            let mut tasks = self.tasks.lock().await;
            let Some(record) = tasks.get_mut(task_id) else {
                return;
            };
            match event {
                AdapterEvent::Init { .. } => {
                    debug!(task_id = %task_id, "task adapter ready");
                    None
                }
                AdapterEvent::Message { message } => {
                    record.logs.push(message.content.clone());
                    if message.role == Role::Assistant {
                        record.last_assistant_id = Some(message.id.clone());
                    }
                    if let Err(e) = self.registry.store().persist_message(task_id, &message) {
                        warn!(task_id = %task_id, error = %e, "persist task message");
                    }
                    // Mirror output into the parent transcript when synced.
                    // Relay failures go into the task logs, never abort it.
                    if let Some(parent) = record.sync.as_ref().map(|s| s.session_id.clone()) {
                        if let Err(e) = self.registry.store().persist_message(&parent, &message) {
                            let failure =
                                AmuxError::SyncRelayFailure(parent.clone(), e.to_string());
                            warn!(task_id = %task_id, error = %failure, "mirror task output");
                            record.logs.push(failure.to_string());
                        }
                        self.registry
                            .post_event(&parent, to_server_event(message.clone()))
                            .await;
                    }
                    self.registry
                        .post_event(task_id, to_server_event(message))
                        .await;
                    None
                }
                AdapterEvent::Summary { summary } => {
                    if let Err(e) = self.registry.store().set_title(task_id, &summary) {
                        warn!(task_id = %task_id, error = %e, "persist task title");
                    }
                    self.registry.publish_session_meta(task_id);
                    None
                }
                AdapterEvent::Stop => {
                    finalize(record, task_id, TaskStatus::Completed, None).then_some(None)
                }
                AdapterEvent::Exit { exit_code } => {
                    let status = if exit_code == Some(0) {
                        TaskStatus::Completed
                    } else {
                        TaskStatus::Failed
                    };
                    finalize(record, task_id, status, exit_code).then_some(exit_code)
                }
            }
        };
        // Outside the lock: persistence and viewer notification.
        if let Some(exit_code) = finished {
            let status = self
                .get_task(task_id)
                .await
                .map(|task| task.status)
                .unwrap_or(TaskStatus::Failed);
            self.persist_task_status(task_id, status);
            if let Some(exit_code) = exit_code {
                let (code, message) = AmuxError::ProcessExit {
                    session_id: task_id.to_string(),
                    exit_code: Some(exit_code),
                }
                .to_error_code();
                self.registry
                    .post_event(task_id, ServerEvent::error(message, code))
                    .await;
            }
        }
    }

    fn persist_task_status(&self, task_id: &str, status: TaskStatus) {
        if let Err(e) = self
            .registry
            .store()
            .update_status(task_id, session_status(status))
        {
            warn!(task_id = %task_id, error = %e, "persist task status");
        }
        self.registry.publish_session_meta(task_id);
    }

    /// One server-sync pass. Returns false when polling should end.
    async fn sync_parent_turns(&self, task_id: &str) -> bool {
        let mut tasks = self.tasks.lock().await;
        let Some(record) = tasks.get_mut(task_id) else {
            return false;
        };
        if record.status != TaskStatus::Running {
            return false;
        }
        let TaskRecord {
            sync,
            handle,
            logs,
            last_assistant_id,
            ..
        } = record;
        let (Some(sync), Some(handle)) = (sync.as_mut(), handle.as_ref()) else {
            return false;
        };
        let history = match self.registry.store().fetch_history(&sync.session_id) {
            Ok(history) => history,
            Err(e) => {
                let failure = AmuxError::SyncRelayFailure(sync.session_id.clone(), e.to_string());
                warn!(task_id = %task_id, error = %failure, "server sync read");
                logs.push(failure.to_string());
                return true;
            }
        };
        if history.len() <= sync.last_event_index {
            return true;
        }
        for message in &history[sync.last_event_index..] {
            if message.role != Role::User
                || message.content.trim().is_empty()
                || !sync.seen_message_ids.insert(message.id.clone())
            {
                continue;
            }
            if let Err(e) = handle.emit(InputTurn::new(
                message.content.clone(),
                last_assistant_id.clone(),
            )) {
                let failure = AmuxError::SyncRelayFailure(sync.session_id.clone(), e.to_string());
                warn!(task_id = %task_id, error = %failure, "server sync inject");
                logs.push(failure.to_string());
            }
        }
        sync.last_event_index = history.len();
        true
    }
}
