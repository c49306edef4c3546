use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::WaypointError;
use crate::state::{ComplianceViolation, RunPhase, RunState};

/// Unique session identifier. Doubles as the session handle returned to callers.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Supported pipelines. Selected once per run by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowType {
    General,
    UserQuery,
    PlatformChange,
    ComplianceSensitive,
    DataCollection,
    Maintenance,
}

impl WorkflowType {
    pub const ALL: [WorkflowType; 6] = [
        Self::General,
        Self::UserQuery,
        Self::PlatformChange,
        Self::ComplianceSensitive,
        Self::DataCollection,
        Self::Maintenance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::General => "general",
            Self::UserQuery => "user-query",
            Self::PlatformChange => "platform-change",
            Self::ComplianceSensitive => "compliance-sensitive",
            Self::DataCollection => "data-collection",
            Self::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('_', "-");
        Self::ALL
            .iter()
            .find(|w| w.as_str() == normalized)
            .copied()
            .ok_or_else(|| format!("unknown workflow type: {}", s))
    }
}

/// Name of an agent role (e.g. "essay-guidance").
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentRole(pub String);

impl AgentRole {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentRole {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AgentRole {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Inbound request. Never mutated after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub requester_id: String,
    pub query: String,
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    #[serde(default)]
    pub session_handle: Option<SessionId>,
    #[serde(default)]
    pub deadline: Option<Duration>,
}

impl Request {
    pub fn new(requester_id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            requester_id: requester_id.into(),
            query: query.into(),
            context: BTreeMap::new(),
            session_handle: None,
            deadline: None,
        }
    }

    /// Add a context entry.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Continue an existing session.
    pub fn with_session(mut self, session: SessionId) -> Self {
        self.session_handle = Some(session);
        self
    }

    /// Set a caller deadline for the whole request.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// A single agent invocation. Transient: its result is folded into the run state.
#[derive(Debug, Clone)]
pub struct AgentCall {
    pub role: AgentRole,
    pub payload: serde_json::Value,
    pub timeout: Duration,
    /// Extra attempts allowed after a transient failure.
    pub retries: u32,
}

impl AgentCall {
    pub fn new(role: impl Into<AgentRole>, payload: serde_json::Value) -> Self {
        Self {
            role: role.into(),
            payload,
            timeout: Duration::from_secs(30),
            retries: 1,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Wire request sent to the external agent.
    pub fn to_request(&self) -> AgentRequest {
        AgentRequest {
            role: self.role.0.clone(),
            payload: self.payload.clone(),
            timeout_ms: self.timeout.as_millis() as u64,
        }
    }
}

/// Outbound wire request to a worker agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    pub role: String,
    pub payload: serde_json::Value,
    pub timeout_ms: u64,
}

/// Wire response from a worker agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentReply {
    pub success: bool,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error_kind: Option<String>,
}

impl AgentReply {
    pub fn ok(result: serde_json::Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error_kind: None,
        }
    }

    pub fn error(kind: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error_kind: Some(kind.into()),
        }
    }
}

/// Why an agent result is a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentFailureKind {
    Timeout,
    Unavailable,
    Malformed,
    Rejected,
    /// Output produced but discarded by the compliance gate.
    Withheld,
}

impl fmt::Display for AgentFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Timeout => "timeout",
            Self::Unavailable => "unavailable",
            Self::Malformed => "malformed",
            Self::Rejected => "rejected",
            Self::Withheld => "withheld",
        };
        f.write_str(s)
    }
}

/// Last known result for an agent role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AgentResult {
    Success { payload: serde_json::Value },
    Failure { kind: AgentFailureKind, message: String },
}

impl AgentResult {
    pub fn failure(kind: AgentFailureKind, message: impl Into<String>) -> Self {
        Self::Failure {
            kind,
            message: message.into(),
        }
    }

    /// Fold a gateway error into a failed result.
    pub fn from_error(err: &WaypointError) -> Self {
        let kind = match err {
            WaypointError::AgentTimeout { .. } => AgentFailureKind::Timeout,
            _ => AgentFailureKind::Unavailable,
        };
        Self::failure(kind, err.to_string())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Human-readable output text of a successful result.
    ///
    /// Looks for a `text`, `output`, `response` or `content` string field
    /// before falling back to the serialized payload.
    pub fn text(&self) -> Option<String> {
        let Self::Success { payload } = self else {
            return None;
        };
        if let Some(s) = payload.as_str() {
            return Some(s.to_string());
        }
        if let Some(obj) = payload.as_object() {
            for key in ["text", "output", "response", "content"] {
                if let Some(s) = obj.get(key).and_then(|v| v.as_str()) {
                    return Some(s.to_string());
                }
            }
        }
        Some(payload.to_string())
    }
}

/// Status reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Completed,
    HumanReviewRequired,
    Cancelled,
    Error,
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Completed => "completed",
            Self::HumanReviewRequired => "human_review_required",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Response returned from the session manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub session: SessionId,
    pub status: ResponseStatus,
    pub body: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<ComplianceViolation>,
    #[serde(default)]
    pub degraded: bool,
    pub steps: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<WorkflowType>,
}

impl Response {
    /// Build the response for a run that reached a terminal node.
    pub fn from_state(state: &RunState) -> Self {
        let status = if state.human_review || state.phase == RunPhase::Suspended {
            ResponseStatus::HumanReviewRequired
        } else {
            ResponseStatus::Completed
        };
        Self {
            session: state.session_id.clone(),
            status,
            body: state.final_response.clone().unwrap_or_default(),
            violations: state.violations.clone(),
            degraded: state.degraded,
            steps: state.step,
            workflow: Some(state.workflow),
        }
    }

    /// Build the response for a run that ended in an error.
    pub fn from_error(session: SessionId, err: &WaypointError) -> Self {
        let status = match err {
            WaypointError::Cancelled { .. } => ResponseStatus::Cancelled,
            _ => ResponseStatus::Error,
        };
        Self {
            session,
            status,
            body: err.to_string(),
            violations: vec![],
            degraded: false,
            steps: 0,
            workflow: None,
        }
    }
}

/// Engine event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A run (new or resumed) started.
    RunStarted {
        session_id: SessionId,
        workflow: WorkflowType,
        turn: u32,
    },
    /// A node finished and its state was committed.
    StepCompleted {
        session_id: SessionId,
        node: String,
        step: u64,
    },
    /// An agent call returned (successfully or not).
    AgentCalled {
        session_id: SessionId,
        role: AgentRole,
        succeeded: bool,
        elapsed_ms: u64,
    },
    /// The compliance gate recorded a violation.
    ViolationRecorded {
        session_id: SessionId,
        step: u64,
        violation: ComplianceViolation,
    },
    /// The human-review flag was raised.
    HumanReviewFlagged { session_id: SessionId, step: u64 },
    /// A run reached a terminal node.
    RunFinished {
        session_id: SessionId,
        status: ResponseStatus,
        steps: u64,
    },
    /// A run was cancelled before reaching a terminal node.
    RunCancelled { session_id: SessionId, step: u64 },
    /// A run failed.
    RunError { session_id: SessionId, error: String },
}

impl EngineEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::RunStarted { session_id, .. }
            | Self::StepCompleted { session_id, .. }
            | Self::AgentCalled { session_id, .. }
            | Self::ViolationRecorded { session_id, .. }
            | Self::HumanReviewFlagged { session_id, .. }
            | Self::RunFinished { session_id, .. }
            | Self::RunCancelled { session_id, .. }
            | Self::RunError { session_id, .. } => session_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_parse_and_display() {
        assert_eq!(
            "compliance-sensitive".parse::<WorkflowType>().unwrap(),
            WorkflowType::ComplianceSensitive
        );
        assert_eq!(
            "Platform_Change".parse::<WorkflowType>().unwrap(),
            WorkflowType::PlatformChange
        );
        assert!("essay".parse::<WorkflowType>().is_err());
        assert_eq!(WorkflowType::UserQuery.to_string(), "user-query");
    }

    #[test]
    fn workflow_serde_is_kebab_case() {
        let json = serde_json::to_string(&WorkflowType::DataCollection).unwrap();
        assert_eq!(json, "\"data-collection\"");
        let parsed: WorkflowType = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, WorkflowType::DataCollection);
    }

    #[test]
    fn agent_result_text_extraction() {
        let r = AgentResult::Success {
            payload: serde_json::json!({"text": "hello", "score": 3}),
        };
        assert_eq!(r.text().as_deref(), Some("hello"));

        let r = AgentResult::Success {
            payload: serde_json::json!("plain"),
        };
        assert_eq!(r.text().as_deref(), Some("plain"));

        let r = AgentResult::Success {
            payload: serde_json::json!({"rows": 2}),
        };
        assert_eq!(r.text().as_deref(), Some(r#"{"rows":2}"#));

        let r = AgentResult::failure(AgentFailureKind::Timeout, "slow");
        assert!(r.text().is_none());
        assert!(!r.is_success());
    }

    #[test]
    fn agent_result_from_gateway_error() {
        let err = WaypointError::AgentTimeout {
            role: "knowledge".into(),
            timeout_ms: 10,
        };
        assert!(matches!(
            AgentResult::from_error(&err),
            AgentResult::Failure {
                kind: AgentFailureKind::Timeout,
                ..
            }
        ));

        let err = WaypointError::AgentNotRegistered("ghost".into());
        assert!(matches!(
            AgentResult::from_error(&err),
            AgentResult::Failure {
                kind: AgentFailureKind::Unavailable,
                ..
            }
        ));
    }

    #[test]
    fn agent_call_to_wire_request() {
        let call = AgentCall::new("essay-guidance", serde_json::json!({"query": "q"}))
            .with_timeout(Duration::from_millis(1500))
            .with_retries(2);
        let req = call.to_request();
        assert_eq!(req.role, "essay-guidance");
        assert_eq!(req.timeout_ms, 1500);
        assert_eq!(call.retries, 2);
    }

    #[test]
    fn agent_reply_defaults() {
        let reply: AgentReply = serde_json::from_str(r#"{"success": false}"#).unwrap();
        assert!(!reply.success);
        assert!(reply.result.is_none());
        assert!(reply.error_kind.is_none());
    }

    #[test]
    fn request_builder() {
        let sid = SessionId::from_string("abc");
        let req = Request::new("user-1", "optimize my application text")
            .with_context("workflow", "compliance-sensitive")
            .with_session(sid.clone())
            .with_deadline(Duration::from_secs(5));
        assert_eq!(req.context.get("workflow").unwrap(), "compliance-sensitive");
        assert_eq!(req.session_handle, Some(sid));
        assert_eq!(req.deadline, Some(Duration::from_secs(5)));
    }

    #[test]
    fn response_from_cancel_error() {
        let sid = SessionId::from_string("s");
        let err = WaypointError::Cancelled {
            session: sid.clone(),
        };
        let resp = Response::from_error(sid.clone(), &err);
        assert_eq!(resp.status, ResponseStatus::Cancelled);
        assert_eq!(resp.session, sid);

        let resp = Response::from_error(sid, &WaypointError::Workflow("x".into()));
        assert_eq!(resp.status, ResponseStatus::Error);
    }
}
