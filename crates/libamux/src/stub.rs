//! Deterministic scripted implementation of the [`AdapterSpawner`] seam.
//!
//! No process is started: tests (and local dry runs) push adapter events by
//! hand and inspect the commands a handle received. Kept as a regular
//! module so integration tests in other crates can drive it too.

use crate::adapter::{AdapterHandle, AdapterSpawner, SpawnMode, SpawnOptions};
use crate::error::AmuxError;
use amux_protocol::{AdapterCommand, AdapterEvent, SessionId};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::{mpsc, oneshot};

const SCRIPT_CHANNEL_CAPACITY: usize = 256;

#[derive(Default)]
pub struct ScriptedSpawner {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    fail_next: Option<String>,
    controls: HashMap<SessionId, Control>,
    spawns: Vec<(SessionId, SpawnMode)>,
}

struct Control {
    event_tx: mpsc::Sender<AdapterEvent>,
    command_rx: mpsc::Receiver<AdapterCommand>,
    kill_rx: Option<oneshot::Receiver<()>>,
    killed: bool,
}

impl ScriptedSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `spawn` call fail with the given message.
    pub fn fail_next(&self, message: impl Into<String>) {
        self.lock().fail_next = Some(message.into());
    }

    /// Deliver an adapter event to the session's pump. Returns false once
    /// the handle side is gone (evicted record, finished pump).
    pub fn push_event(&self, session_id: &str, event: AdapterEvent) -> bool {
        let tx = match self.lock().controls.get(session_id) {
            Some(control) => control.event_tx.clone(),
            None => return false,
        };
        tx.try_send(event).is_ok()
    }

    /// Drain and return every command the handle emitted so far.
    pub fn sent_commands(&self, session_id: &str) -> Vec<AdapterCommand> {
        let mut inner = self.lock();
        let mut out = Vec::new();
        if let Some(control) = inner.controls.get_mut(session_id) {
            while let Ok(cmd) = control.command_rx.try_recv() {
                out.push(cmd);
            }
        }
        out
    }

    /// Text of every `turn` command emitted so far, in order.
    pub fn sent_turns(&self, session_id: &str) -> Vec<String> {
        self.sent_commands(session_id)
            .into_iter()
            .filter_map(|cmd| match cmd {
                AdapterCommand::Turn { text, .. } => Some(text),
                AdapterCommand::Interrupt => None,
            })
            .collect()
    }

    pub fn was_killed(&self, session_id: &str) -> bool {
        let mut inner = self.lock();
        let Some(control) = inner.controls.get_mut(session_id) else {
            return false;
        };
        if control.killed {
            return true;
        }
        if let Some(rx) = control.kill_rx.as_mut() {
            match rx.try_recv() {
                Ok(()) => {
                    control.killed = true;
                    control.kill_rx = None;
                }
                Err(oneshot::error::TryRecvError::Closed) => {
                    control.kill_rx = None;
                }
                Err(oneshot::error::TryRecvError::Empty) => {}
            }
        }
        control.killed
    }

    /// Total spawn calls for one session id.
    pub fn spawn_count(&self, session_id: &str) -> usize {
        self.lock()
            .spawns
            .iter()
            .filter(|(id, _)| id == session_id)
            .count()
    }

    /// Mode of the most recent spawn for a session id.
    pub fn last_spawn_mode(&self, session_id: &str) -> Option<SpawnMode> {
        self.lock()
            .spawns
            .iter()
            .rev()
            .find(|(id, _)| id == session_id)
            .map(|(_, mode)| *mode)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl AdapterSpawner for ScriptedSpawner {
    fn spawn(
        &self,
        session_id: &SessionId,
        mode: SpawnMode,
        _options: &SpawnOptions,
    ) -> Result<AdapterHandle, AmuxError> {
        let mut inner = self.lock();
        if let Some(message) = inner.fail_next.take() {
            return Err(AmuxError::SpawnFailure(session_id.clone(), message));
        }

        let (command_tx, command_rx) = mpsc::channel(SCRIPT_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(SCRIPT_CHANNEL_CAPACITY);
        let (kill_tx, kill_rx) = oneshot::channel();

        inner.spawns.push((session_id.clone(), mode));
        inner.controls.insert(
            session_id.clone(),
            Control {
                event_tx,
                command_rx,
                kill_rx: Some(kill_rx),
                killed: false,
            },
        );

        Ok(AdapterHandle::new(
            session_id.clone(),
            None,
            command_tx,
            kill_tx,
            event_rx,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::InputTurn;

    #[tokio::test]
    async fn scripted_handle_records_turns_and_kill() {
        let spawner = ScriptedSpawner::new();
        let mut handle = spawner
            .spawn(
                &"s1".to_string(),
                SpawnMode::Create,
                &SpawnOptions::default(),
            )
            .unwrap();

        handle.emit(InputTurn::new("first", None)).unwrap();
        handle.emit(InputTurn::new("second", None)).unwrap();
        assert_eq!(spawner.sent_turns("s1"), vec!["first", "second"]);
        assert!(!spawner.was_killed("s1"));

        handle.kill().unwrap();
        assert!(spawner.was_killed("s1"));
        assert_eq!(spawner.spawn_count("s1"), 1);
        assert_eq!(spawner.last_spawn_mode("s1"), Some(SpawnMode::Create));
    }

    #[tokio::test]
    async fn scripted_events_reach_the_taken_receiver() {
        let spawner = ScriptedSpawner::new();
        let mut handle = spawner
            .spawn(
                &"s1".to_string(),
                SpawnMode::Resume,
                &SpawnOptions::default(),
            )
            .unwrap();
        let mut events = handle.take_events().unwrap();

        assert!(spawner.push_event("s1", AdapterEvent::Stop));
        assert!(matches!(events.recv().await, Some(AdapterEvent::Stop)));
        assert_eq!(spawner.last_spawn_mode("s1"), Some(SpawnMode::Resume));
    }

    #[test]
    fn forced_failure_applies_once() {
        let spawner = ScriptedSpawner::new();
        spawner.fail_next("boom");
        let err = spawner
            .spawn(
                &"s1".to_string(),
                SpawnMode::Create,
                &SpawnOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(err, AmuxError::SpawnFailure(..)));

        assert!(
            spawner
                .spawn(
                    &"s1".to_string(),
                    SpawnMode::Create,
                    &SpawnOptions::default(),
                )
                .is_ok()
        );
    }
}
