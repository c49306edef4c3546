use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use waypoint_core::config::{AppConfig, SessionConfig};
use waypoint_core::error::{Result, WaypointError};
use waypoint_core::event::EventBus;
use waypoint_core::state::{Checkpoint, ConversationTurn, RunState};
use waypoint_core::traits::{CheckpointStore, ConversationStore};
use waypoint_core::types::{EngineEvent, Request, Response, SessionId};

use crate::classifier::WorkflowClassifier;
use crate::graph::GraphCoordinator;
use crate::run_log::RunLogger;

type SessionLock = Arc<tokio::sync::Mutex<()>>;

const LOG_FLUSH_WAIT: Duration = Duration::from_secs(2);

/// Entry point for requests.
///
/// Serializes requests per session, loads or creates the run state, drives
/// the coordinator to a terminal node under the caller's deadline, and turns
/// the result into a `Response`. Requests for different sessions never wait
/// on each other.
pub struct SessionManager {
    classifier: WorkflowClassifier,
    coordinator: Arc<GraphCoordinator>,
    conversations: Option<Arc<dyn ConversationStore>>,
    locks: Mutex<HashMap<SessionId, SessionLock>>,
    config: SessionConfig,
    event_bus: Arc<EventBus>,
    run_log: Option<(PathBuf, u8)>,
}

impl SessionManager {
    pub fn new(
        classifier: WorkflowClassifier,
        coordinator: GraphCoordinator,
        event_bus: Arc<EventBus>,
        config: &AppConfig,
    ) -> Self {
        let run_log = config
            .log
            .enabled
            .then(|| (config.log_dir(), config.log.level));
        Self {
            classifier,
            coordinator: Arc::new(coordinator),
            conversations: None,
            locks: Mutex::new(HashMap::new()),
            config: config.session.clone(),
            event_bus,
            run_log,
        }
    }

    /// Keep cross-turn memory in `store`, expiring after the configured TTL.
    pub fn with_conversations(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.conversations = Some(store);
        self
    }

    pub fn coordinator(&self) -> &GraphCoordinator {
        &self.coordinator
    }

    /// Handle one request to a terminal node.
    ///
    /// A request without a session handle gets a new one. Review outcomes
    /// are a response status, not an error.
    pub async fn handle(&self, request: Request) -> Result<Response> {
        let session = request.session_handle.clone().unwrap_or_default();
        self.handle_session(session, &request).await
    }

    /// Like [`handle`](Self::handle), but every failure becomes a response
    /// carrying the session handle.
    pub async fn respond(&self, request: Request) -> Response {
        let session = request.session_handle.clone().unwrap_or_default();
        match self.handle_session(session.clone(), &request).await {
            Ok(response) => response,
            Err(e) => {
                let handle = e.session().cloned().unwrap_or(session);
                Response::from_error(handle, &e)
            }
        }
    }

    /// Every checkpoint of a session, ascending by step.
    pub async fn history(&self, session: &SessionId) -> Result<Vec<Checkpoint>> {
        self.coordinator.store().history(session).await
    }

    /// The run state at `step`, or the latest.
    pub async fn inspect(&self, session: &SessionId, step: Option<u64>) -> Result<RunState> {
        self.coordinator.store().load(session, step).await
    }

    async fn handle_session(&self, session: SessionId, request: &Request) -> Result<Response> {
        let lock = self.lock_for(&session);
        let guard = match self.acquire(&session, lock.clone()).await {
            Ok(guard) => guard,
            Err(e) => {
                drop(lock);
                self.release(&session);
                return Err(e);
            }
        };

        let result = self.drive(&session, request).await;

        drop(guard);
        drop(lock);
        self.release(&session);

        result.map(|state| Response::from_state(&state))
    }

    async fn drive(&self, session: &SessionId, request: &Request) -> Result<RunState> {
        let cancel = CancellationToken::new();
        let timer = request.deadline.map(|deadline| {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                cancel.cancel();
            })
        });

        let result = match self.prepare(session, request).await {
            Ok(state) => {
                let log_cancel = CancellationToken::new();
                let logger = self.run_log.as_ref().map(|(dir, level)| {
                    RunLogger::new(dir.clone(), *level).start(
                        &self.event_bus,
                        session.clone(),
                        log_cancel.clone(),
                    )
                });

                let result = self.coordinator.run(state, &cancel).await;
                if let Err(ref e) = result {
                    self.report_failure(session, e);
                }
                if let Some(logger) = logger {
                    self.finish_log(session, logger, log_cancel).await;
                }
                result
            }
            Err(e) => {
                self.report_failure(session, &e);
                Err(e)
            }
        };

        if let Ok(ref state) = result {
            self.remember(state).await;
        }

        if let Some(timer) = timer {
            timer.abort();
        }
        result
    }

    fn report_failure(&self, session: &SessionId, e: &WaypointError) {
        if matches!(e, WaypointError::Cancelled { .. }) {
            return;
        }
        error!(session_id = %session, error = %e, "Request failed");
        self.event_bus.publish(EngineEvent::RunError {
            session_id: session.clone(),
            error: e.to_string(),
        });
    }

    /// Wait for the run log to write the run's terminal entry.
    async fn finish_log(
        &self,
        session: &SessionId,
        mut logger: JoinHandle<()>,
        log_cancel: CancellationToken,
    ) {
        if tokio::time::timeout(LOG_FLUSH_WAIT, &mut logger).await.is_err() {
            warn!(session_id = %session, "Run log did not finish in time, closing it");
            log_cancel.cancel();
            let _ = logger.await;
        }
    }

    /// Load the session's latest state, or start a new one.
    async fn prepare(&self, session: &SessionId, request: &Request) -> Result<RunState> {
        let latest = match self.coordinator.store().load(session, None).await {
            Ok(state) => Some(state),
            Err(WaypointError::CheckpointNotFound { .. }) => None,
            Err(e) => return Err(e),
        };

        match latest {
            Some(state) if !state.is_finished() => {
                info!(
                    session_id = %session,
                    node = %state.current_node,
                    step = state.step,
                    "Resuming unfinished run"
                );
                Ok(state)
            }
            Some(mut state) => {
                let c = self.classifier.classify_or_fallback(request);
                state.begin_turn(request, c.workflow, c.roles, c.complexity);
                info!(
                    session_id = %session,
                    workflow = %state.workflow,
                    turn = state.turn,
                    "Starting follow-up turn"
                );
                Ok(state)
            }
            None => {
                let c = self.classifier.classify_or_fallback(request);
                let mut state =
                    RunState::new(session.clone(), request, c.workflow, c.roles, c.complexity);
                state.conversation = self.recall(session).await;
                info!(
                    session_id = %session,
                    workflow = %state.workflow,
                    complexity = state.complexity,
                    "Starting new session"
                );
                Ok(state)
            }
        }
    }

    /// Prior turns from the conversation store, if any are still live.
    async fn recall(&self, session: &SessionId) -> Vec<ConversationTurn> {
        let Some(store) = &self.conversations else {
            return vec![];
        };
        match store.get(session.as_str()).await {
            Ok(Some(value)) => serde_json::from_value(value).unwrap_or_else(|e| {
                warn!(session_id = %session, error = %e, "Discarding unreadable conversation");
                vec![]
            }),
            Ok(None) => vec![],
            Err(e) => {
                warn!(session_id = %session, error = %e, "Conversation store unavailable");
                vec![]
            }
        }
    }

    async fn remember(&self, state: &RunState) {
        let Some(store) = &self.conversations else {
            return;
        };
        let value = match serde_json::to_value(&state.conversation) {
            Ok(v) => v,
            Err(e) => {
                warn!(session_id = %state.session_id, error = %e, "Failed to encode conversation");
                return;
            }
        };
        let ttl = Duration::from_secs(self.config.conversation_ttl_secs);
        if let Err(e) = store.set(state.session_id.as_str(), value, ttl).await {
            warn!(session_id = %state.session_id, error = %e, "Failed to store conversation");
        }
    }

    fn lock_for(&self, session: &SessionId) -> SessionLock {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(session.clone()).or_default().clone()
    }

    async fn acquire(&self, session: &SessionId, lock: SessionLock) -> Result<OwnedMutexGuard<()>> {
        let acquired = if self.config.lock_wait_ms == 0 {
            lock.try_lock_owned().ok()
        } else {
            let wait = Duration::from_millis(self.config.lock_wait_ms);
            tokio::time::timeout(wait, lock.lock_owned()).await.ok()
        };

        acquired.ok_or_else(|| {
            warn!(session_id = %session, "Session busy");
            WaypointError::SessionBusy(session.clone())
        })
    }

    /// Drop the session's lock entry once nobody else holds or waits on it.
    fn release(&self, session: &SessionId) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.get(session).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(session);
            debug!(session_id = %session, "Session lock released");
        }
    }

    #[cfg(test)]
    fn tracked_sessions(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
