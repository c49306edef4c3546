use thiserror::Error;

use crate::types::SessionId;

#[derive(Debug, Error)]
pub enum WaypointError {
    // Classification errors
    #[error("Request classification ambiguous (best score {best_score})")]
    ClassificationAmbiguous { best_score: u32 },

    // Agent errors
    #[error("Agent timeout after {timeout_ms}ms: {role}")]
    AgentTimeout { role: String, timeout_ms: u64 },

    #[error("Agent unavailable: {role}: {reason}")]
    AgentUnavailable { role: String, reason: String },

    #[error("No agent registered for role: {0}")]
    AgentNotRegistered(String),

    // Compliance errors
    #[error("Unknown compliance rule: {0}")]
    UnknownRule(String),

    // Checkpoint errors
    #[error("Checkpoint write failed for session {session} at step {step}: {reason}")]
    CheckpointWriteFailed {
        session: SessionId,
        step: u64,
        reason: String,
    },

    #[error("No checkpoint for session {session}{}", .step.map(|s| format!(" at step {}", s)).unwrap_or_default())]
    CheckpointNotFound {
        session: SessionId,
        step: Option<u64>,
    },

    // Session errors
    #[error("Session busy: {0}")]
    SessionBusy(SessionId),

    #[error("Run cancelled for session {session}")]
    Cancelled { session: SessionId },

    // Workflow errors
    #[error("Workflow error: {0}")]
    Workflow(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Conversation store error: {0}")]
    ConversationStore(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WaypointError {
    /// Session handle carried by this error, if any.
    pub fn session(&self) -> Option<&SessionId> {
        match self {
            Self::CheckpointWriteFailed { session, .. }
            | Self::CheckpointNotFound { session, .. }
            | Self::Cancelled { session } => Some(session),
            Self::SessionBusy(session) => Some(session),
            _ => None,
        }
    }

    /// Whether an agent call that failed with this error may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::AgentTimeout { .. } | Self::AgentUnavailable { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, WaypointError>;
