use crate::error::AmuxError;
use amux_protocol::{AdapterCommand, AdapterEvent, SessionId};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Capacity of the command and event channels between the core and one
/// adapter process. A full command queue means the adapter stopped
/// reading stdin, which is treated the same as a dead session.
const ADAPTER_CHANNEL_CAPACITY: usize = 256;

/// One inbound turn for an adapter, threaded to the message it answers.
#[derive(Debug, Clone)]
pub struct InputTurn {
    pub text: String,
    pub parent_id: Option<String>,
}

impl InputTurn {
    pub fn new(text: impl Into<String>, parent_id: Option<String>) -> Self {
        Self {
            text: text.into(),
            parent_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnMode {
    Create,
    Resume,
}

/// Per-spawn options. `prompt_addendum` is merged with the spawner's own
/// addendum once, at start; it never appears on the per-event path.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub adapter: Option<String>,
    pub prompt_addendum: Option<String>,
}

/// Starts adapter processes. The registry and the task manager only know
/// this seam, so tests swap in a scripted implementation.
pub trait AdapterSpawner: Send + Sync {
    fn spawn(
        &self,
        session_id: &SessionId,
        mode: SpawnMode,
        options: &SpawnOptions,
    ) -> Result<AdapterHandle, AmuxError>;
}

/// The single live handle for one adapter process.
///
/// Commands flow through a bounded channel to the process; events are
/// yielded on a receiver taken exactly once by the owning event pump.
/// Dropping the handle closes the adapter's stdin.
#[derive(Debug)]
pub struct AdapterHandle {
    session_id: SessionId,
    pid: Option<u32>,
    command_tx: mpsc::Sender<AdapterCommand>,
    kill_tx: Option<oneshot::Sender<()>>,
    events: Option<mpsc::Receiver<AdapterEvent>>,
}

impl AdapterHandle {
    pub fn new(
        session_id: SessionId,
        pid: Option<u32>,
        command_tx: mpsc::Sender<AdapterCommand>,
        kill_tx: oneshot::Sender<()>,
        events: mpsc::Receiver<AdapterEvent>,
    ) -> Self {
        Self {
            session_id,
            pid,
            command_tx,
            kill_tx: Some(kill_tx),
            events: Some(events),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Send one input turn to the adapter.
    pub fn emit(&self, turn: InputTurn) -> Result<(), AmuxError> {
        self.send_command(AdapterCommand::Turn {
            text: turn.text,
            parent_id: turn.parent_id,
        })
    }

    /// Ask the adapter to abort its current turn.
    pub fn interrupt(&self) -> Result<(), AmuxError> {
        self.send_command(AdapterCommand::Interrupt)
    }

    fn send_command(&self, command: AdapterCommand) -> Result<(), AmuxError> {
        self.command_tx
            .try_send(command)
            .map_err(|_| AmuxError::SessionNotActive(self.session_id.clone()))
    }

    /// Terminate the process. Idempotent: a second call is a no-op. An
    /// already-reaped process yields `SignalDeliveryFailure`, which
    /// callers report and ignore.
    pub fn kill(&mut self) -> Result<(), AmuxError> {
        match self.kill_tx.take() {
            Some(tx) => tx.send(()).map_err(|_| {
                AmuxError::SignalDeliveryFailure(
                    self.session_id.clone(),
                    "process already gone".to_string(),
                )
            }),
            None => Ok(()),
        }
    }

    /// The event stream, yielded once to whoever pumps this handle.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<AdapterEvent>> {
        self.events.take()
    }
}

/// Spawns the configured adapter command with JSON-lines stdio.
///
/// stdin carries [`AdapterCommand`] lines, stdout yields [`AdapterEvent`]
/// lines; unparseable output is logged and skipped. A monitor task always
/// emits a final `exit` event with the real process status, so the event
/// stream terminates even when the adapter crashes without saying goodbye.
pub struct ProcessSpawner {
    command: String,
    args: Vec<String>,
    prompt_addendum: Option<String>,
}

impl ProcessSpawner {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            prompt_addendum: None,
        }
    }

    pub fn with_prompt_addendum(mut self, addendum: impl Into<String>) -> Self {
        self.prompt_addendum = Some(addendum.into());
        self
    }

    fn merged_addendum(&self, options: &SpawnOptions) -> Option<String> {
        match (&self.prompt_addendum, &options.prompt_addendum) {
            (Some(base), Some(extra)) => Some(format!("{base}\n\n{extra}")),
            (Some(base), None) => Some(base.clone()),
            (None, Some(extra)) => Some(extra.clone()),
            (None, None) => None,
        }
    }
}

impl AdapterSpawner for ProcessSpawner {
    fn spawn(
        &self,
        session_id: &SessionId,
        mode: SpawnMode,
        options: &SpawnOptions,
    ) -> Result<AdapterHandle, AmuxError> {
        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            .arg("--session-id")
            .arg(session_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if mode == SpawnMode::Resume {
            command.arg("--resume");
        }
        if let Some(adapter) = &options.adapter {
            command.arg("--adapter").arg(adapter);
        }
        if let Some(addendum) = self.merged_addendum(options) {
            command.env("AMUX_PROMPT_ADDENDUM", addendum);
        }

        let mut child = command
            .spawn()
            .map_err(|e| AmuxError::SpawnFailure(session_id.clone(), e.to_string()))?;
        let pid = child.id();
        let stdin = child.stdin.take().ok_or_else(|| {
            AmuxError::SpawnFailure(session_id.clone(), "stdin not captured".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            AmuxError::SpawnFailure(session_id.clone(), "stdout not captured".to_string())
        })?;

        let (command_tx, mut command_rx) = mpsc::channel::<AdapterCommand>(ADAPTER_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel::<AdapterEvent>(ADAPTER_CHANNEL_CAPACITY);
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();

        // stdin writer: one JSON line per command, until the handle drops.
        let writer_session = session_id.clone();
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(cmd) = command_rx.recv().await {
                let mut line = match serde_json::to_string(&cmd) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(session_id = %writer_session, error = %e, "dropping unserializable command");
                        continue;
                    }
                };
                line.push('\n');
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    debug!(session_id = %writer_session, "adapter stdin closed");
                    break;
                }
            }
        });

        // stdout reader: parse event lines, skip garbage.
        let reader_session = session_id.clone();
        let reader_tx = event_tx.clone();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<AdapterEvent>(line) {
                    Ok(event) => {
                        if reader_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(session_id = %reader_session, error = %e, "skipping unparseable adapter line");
                    }
                }
            }
        });

        // Monitor: reap the child (or kill it on request), drain the
        // reader, then close the stream with the authoritative exit code.
        let monitor_session = session_id.clone();
        tokio::spawn(async move {
            let exit_code = tokio::select! {
                status = child.wait() => status.ok().and_then(|s| s.code()),
                _ = &mut kill_rx => {
                    if let Err(e) = child.kill().await {
                        warn!(session_id = %monitor_session, error = %e, "kill failed");
                    }
                    child.wait().await.ok().and_then(|s| s.code())
                }
            };
            let _ = reader.await;
            debug!(session_id = %monitor_session, exit_code = ?exit_code, "adapter process exited");
            let _ = event_tx.send(AdapterEvent::Exit { exit_code }).await;
        });

        Ok(AdapterHandle::new(
            session_id.clone(),
            pid,
            command_tx,
            kill_tx,
            event_rx,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handle_emit_then_kill_is_idempotent() {
        let (command_tx, mut command_rx) = mpsc::channel(8);
        let (kill_tx, mut kill_rx) = oneshot::channel();
        let (_event_tx, event_rx) = mpsc::channel(8);
        let mut handle =
            AdapterHandle::new("s1".to_string(), Some(42), command_tx, kill_tx, event_rx);

        handle
            .emit(InputTurn::new("hello", Some("m0".to_string())))
            .unwrap();
        match command_rx.recv().await.unwrap() {
            AdapterCommand::Turn { text, parent_id } => {
                assert_eq!(text, "hello");
                assert_eq!(parent_id.as_deref(), Some("m0"));
            }
            other => panic!("unexpected command: {other:?}"),
        }

        handle.kill().unwrap();
        kill_rx.try_recv().unwrap();
        // Second kill is a no-op, not an error.
        handle.kill().unwrap();
    }

    #[tokio::test]
    async fn handle_kill_after_monitor_gone_is_reported() {
        let (command_tx, _command_rx) = mpsc::channel(8);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (_event_tx, event_rx) = mpsc::channel(8);
        let mut handle = AdapterHandle::new("s1".to_string(), None, command_tx, kill_tx, event_rx);

        drop(kill_rx);
        let err = handle.kill().unwrap_err();
        assert!(matches!(err, AmuxError::SignalDeliveryFailure(..)));
    }

    #[tokio::test]
    async fn emit_to_closed_adapter_fails_as_not_active() {
        let (command_tx, command_rx) = mpsc::channel(8);
        let (kill_tx, _kill_rx) = oneshot::channel();
        let (_event_tx, event_rx) = mpsc::channel(8);
        let handle = AdapterHandle::new("s1".to_string(), None, command_tx, kill_tx, event_rx);

        drop(command_rx);
        let err = handle.emit(InputTurn::new("hi", None)).unwrap_err();
        assert!(matches!(err, AmuxError::SessionNotActive(_)));
    }

    #[test]
    fn addendum_merge_prefers_both_halves() {
        let spawner = ProcessSpawner::new("adapter", vec![]).with_prompt_addendum("base");
        let merged = spawner
            .merged_addendum(&SpawnOptions {
                adapter: None,
                prompt_addendum: Some("extra".to_string()),
            })
            .unwrap();
        assert_eq!(merged, "base\n\nextra");

        let merged = spawner.merged_addendum(&SpawnOptions::default()).unwrap();
        assert_eq!(merged, "base");
    }
}
