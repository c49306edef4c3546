use std::time::Duration;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::state::{AuditRecord, Checkpoint, RunState};
use crate::types::{AgentReply, AgentRequest, SessionId};

/// External worker agent reachable by role name.
pub trait Agent: Send + Sync + 'static {
    /// Role this agent serves (e.g. "essay-guidance").
    fn role(&self) -> &str;

    /// Perform one call. Transport failures surface as `AgentTimeout` or
    /// `AgentUnavailable`; anything the agent itself reports goes in the reply.
    fn invoke(&self, request: AgentRequest) -> BoxFuture<'_, Result<AgentReply>>;
}

/// Append-only checkpoint persistence keyed by (session, step).
pub trait CheckpointStore: Send + Sync + 'static {
    /// Durably write a checkpoint. Rejects a key that already exists.
    fn save(&self, checkpoint: &Checkpoint) -> BoxFuture<'_, Result<()>>;

    /// Load the state at `step`, or the latest when `step` is `None`.
    fn load(&self, session: &SessionId, step: Option<u64>) -> BoxFuture<'_, Result<RunState>>;

    /// Every checkpoint for a session, ascending by step.
    fn history(&self, session: &SessionId) -> BoxFuture<'_, Result<Vec<Checkpoint>>>;

    /// All sessions with at least one checkpoint.
    fn sessions(&self) -> BoxFuture<'_, Result<Vec<SessionId>>>;
}

/// Cross-turn memory with expiry.
pub trait ConversationStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<serde_json::Value>>>;

    fn set(&self, key: &str, value: serde_json::Value, ttl: Duration)
        -> BoxFuture<'_, Result<()>>;

    fn expire(&self, key: &str) -> BoxFuture<'_, Result<()>>;
}

/// Sink for compliance audit records.
pub trait AuditSink: Send + Sync + 'static {
    fn record(&self, record: &AuditRecord) -> BoxFuture<'_, Result<()>>;
}
