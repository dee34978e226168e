use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, oneshot};
use tracing::debug;

use amux_protocol::{InteractionAnswer, InteractionPayload, ServerEvent};

use crate::error::AmuxError;
use crate::registry::{OpenInteraction, SessionRegistry};

/// How long a question may stay unanswered before the caller gets a
/// timeout instead.
pub const DEFAULT_INTERACTION_TIMEOUT: Duration = Duration::from_secs(300);

/// Bounded request/response between a session and whoever watches it.
///
/// `request` blocks its caller until an answer is routed back in through
/// `resolve`, or the bound elapses. The pending table is the
/// single-resolution guard: whichever side removes an entry first wins,
/// the other becomes a no-op.
pub struct InteractionCoordinator {
    registry: Arc<SessionRegistry>,
    pending: Mutex<HashMap<String, oneshot::Sender<InteractionAnswer>>>,
    timeout: Duration,
}

impl InteractionCoordinator {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            pending: Mutex::new(HashMap::new()),
            timeout: DEFAULT_INTERACTION_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Pose a question on a session and wait for the answer.
    ///
    /// Fails immediately with `SessionNotActive` when nobody is attached:
    /// a question nobody can see would only ever time out. A second
    /// request while one is open overwrites the session's marker; the
    /// older request keeps its own clock and its cleanup is id-checked,
    /// so it cannot disturb the newer one.
    pub async fn request(
        &self,
        session_id: &str,
        payload: InteractionPayload,
    ) -> Result<InteractionAnswer, AmuxError> {
        if self.registry.connection_count(session_id).await == 0 {
            return Err(AmuxError::SessionNotActive(session_id.to_string()));
        }

        let interaction_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .await
            .insert(interaction_id.clone(), tx);

        if let Err(e) = self
            .registry
            .open_interaction(
                session_id,
                OpenInteraction {
                    id: interaction_id.clone(),
                    payload,
                },
            )
            .await
        {
            self.pending.lock().await.remove(&interaction_id);
            return Err(e);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(answer)) => Ok(answer),
            Ok(Err(_)) => {
                // Sender dropped without an answer: cleared elsewhere.
                self.registry
                    .clear_interaction(session_id, &interaction_id)
                    .await;
                Err(AmuxError::InteractionTimeout(interaction_id))
            }
            Err(_) => {
                self.pending.lock().await.remove(&interaction_id);
                self.registry
                    .clear_interaction(session_id, &interaction_id)
                    .await;
                debug!(session_id = %session_id, interaction_id = %interaction_id, "interaction timed out");
                Err(AmuxError::InteractionTimeout(interaction_id))
            }
        }
    }

    /// Route an answer back to a waiting request. The session status is
    /// restored to running before the waiting caller observes the
    /// answer, and the response is rebroadcast so every observer sees
    /// it. Returns whether a waiting request was actually resolved; a
    /// late answer after timeout is a no-op.
    pub async fn resolve(
        &self,
        session_id: &str,
        interaction_id: &str,
        data: InteractionAnswer,
    ) -> bool {
        let pending_tx = self.pending.lock().await.remove(interaction_id);
        let cleared = self
            .registry
            .clear_interaction(session_id, interaction_id)
            .await;

        let response = ServerEvent::InteractionResponse {
            id: interaction_id.to_string(),
            data: data.clone(),
        };
        match pending_tx {
            Some(tx) => {
                self.registry.post_event(session_id, response).await;
                let _ = tx.send(data);
                true
            }
            None => {
                // No local waiter. If the marker was still set the
                // question was mirrored from elsewhere: clear it and let
                // the other observers see the answer anyway.
                if cleared {
                    self.registry.post_event(session_id, response).await;
                }
                false
            }
        }
    }

    /// Idempotent removal of a pending interaction and its marker.
    pub async fn clear(&self, session_id: &str, interaction_id: &str) -> bool {
        self.pending.lock().await.remove(interaction_id);
        self.registry
            .clear_interaction(session_id, interaction_id)
            .await
    }
}
