use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{AgentFailureKind, AgentResult, AgentRole, Request, SessionId, WorkflowType};

/// Initial node of every workflow.
pub const CLASSIFY: &str = "classify";
/// Terminal node producing the final response.
pub const FINALIZE: &str = "finalize";
/// Terminal node parking the run for manual inspection.
pub const SUSPEND_FOR_REVIEW: &str = "suspend-for-review";

/// Whether a node name is terminal.
pub fn is_terminal(node: &str) -> bool {
    node == FINALIZE || node == SUSPEND_FOR_REVIEW
}

/// Severity of a compliance violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Informational,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Informational => write!(f, "informational"),
            Self::Warning => write!(f, "warning"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// A single rule finding against an agent output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceViolation {
    pub rule_id: String,
    pub severity: Severity,
    /// Offending text (or a short description of what is missing).
    pub span: String,
    /// Field the finding refers to, when it is not a text span.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// Role whose output triggered the finding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<AgentRole>,
    pub detected_at: DateTime<Utc>,
}

impl ComplianceViolation {
    pub fn new(
        rule_id: impl Into<String>,
        severity: Severity,
        span: impl Into<String>,
        detected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            rule_id: rule_id.into(),
            severity,
            span: span.into(),
            field: None,
            role: None,
            detected_at,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_role(mut self, role: AgentRole) -> Self {
        self.role = Some(role);
        self
    }

    pub fn is_critical(&self) -> bool {
        self.severity == Severity::Critical
    }
}

/// One completed request/response exchange on a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub query: String,
    pub response: String,
    pub at: DateTime<Utc>,
}

/// Lifecycle phase of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Running,
    Finalized,
    Suspended,
}

/// The mutable state that flows through the workflow graph.
///
/// Owned by the coordinator during a run. A copy is checkpointed after every
/// step. The step counter only moves forward, and the human-review flag is
/// never cleared within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub session_id: SessionId,
    pub workflow: WorkflowType,
    pub requester_id: String,
    pub query: String,
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    /// Agent roles selected by the classifier for this run.
    pub roles: Vec<AgentRole>,
    pub completed_steps: Vec<String>,
    pub results: BTreeMap<AgentRole, AgentResult>,
    pub violations: Vec<ComplianceViolation>,
    pub human_review: bool,
    pub final_response: Option<String>,
    /// Latest agent output eligible to become the response.
    #[serde(default)]
    pub draft: Option<String>,
    pub step: u64,
    /// Step counter value when the current turn began.
    #[serde(default)]
    pub turn_base_step: u64,
    /// Next node to execute.
    pub current_node: String,
    pub phase: RunPhase,
    #[serde(default)]
    pub turn: u32,
    #[serde(default)]
    pub degraded: bool,
    #[serde(default)]
    pub blocked: bool,
    #[serde(default)]
    pub complexity: u32,
    #[serde(default)]
    pub conversation: Vec<ConversationTurn>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunState {
    /// Fresh state for a new session, positioned at the classify node.
    pub fn new(
        session_id: SessionId,
        request: &Request,
        workflow: WorkflowType,
        roles: Vec<AgentRole>,
        complexity: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            workflow,
            requester_id: request.requester_id.clone(),
            query: request.query.clone(),
            context: request.context.clone(),
            roles,
            completed_steps: vec![],
            results: BTreeMap::new(),
            violations: vec![],
            human_review: false,
            final_response: None,
            draft: None,
            step: 0,
            turn_base_step: 0,
            current_node: CLASSIFY.to_string(),
            phase: RunPhase::Running,
            turn: 1,
            degraded: false,
            blocked: false,
            complexity,
            conversation: vec![],
            created_at: now,
            updated_at: now,
        }
    }

    /// Start a follow-up run on a finished session.
    ///
    /// Per-run fields are reset; the step counter and conversation carry over
    /// so checkpoint keys keep increasing across the session.
    pub fn begin_turn(
        &mut self,
        request: &Request,
        workflow: WorkflowType,
        roles: Vec<AgentRole>,
        complexity: u32,
    ) {
        self.workflow = workflow;
        self.requester_id = request.requester_id.clone();
        self.query = request.query.clone();
        self.context = request.context.clone();
        self.roles = roles;
        self.completed_steps.clear();
        self.results.clear();
        self.violations.clear();
        self.human_review = false;
        self.final_response = None;
        self.draft = None;
        self.turn_base_step = self.step;
        self.current_node = CLASSIFY.to_string();
        self.phase = RunPhase::Running;
        self.turn += 1;
        self.degraded = false;
        self.blocked = false;
        self.complexity = complexity;
        self.updated_at = Utc::now();
    }

    /// Mark `node` as completed and bump the step counter.
    pub fn advance(&mut self, node: &str) -> u64 {
        self.step += 1;
        self.completed_steps.push(node.to_string());
        self.updated_at = Utc::now();
        self.step
    }

    /// Raise the human-review flag. There is deliberately no way to lower it.
    pub fn flag_for_review(&mut self) {
        self.human_review = true;
    }

    pub fn record_result(&mut self, role: AgentRole, result: AgentResult) {
        self.results.insert(role, result);
    }

    pub fn record_violation(&mut self, violation: ComplianceViolation) {
        self.violations.push(violation);
    }

    pub fn result(&self, role: &AgentRole) -> Option<&AgentResult> {
        self.results.get(role)
    }

    /// Whether the role was selected for this run.
    pub fn has_role(&self, role: &AgentRole) -> bool {
        self.roles.contains(role)
    }

    pub fn is_finished(&self) -> bool {
        self.phase != RunPhase::Running
    }

    /// Steps taken in the current turn.
    pub fn turn_steps(&self) -> u64 {
        self.step.saturating_sub(self.turn_base_step)
    }

    /// Roles whose call failed. Output withheld by the compliance gate does
    /// not count as a failed call.
    pub fn failed_roles(&self) -> Vec<&AgentRole> {
        self.results
            .iter()
            .filter(|(_, r)| {
                matches!(r, AgentResult::Failure { kind, .. } if *kind != AgentFailureKind::Withheld)
            })
            .map(|(role, _)| role)
            .collect()
    }

    pub fn has_critical_violation(&self) -> bool {
        self.violations.iter().any(|v| v.is_critical())
    }
}

/// Durable snapshot of a run state, keyed by (session, step).
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub session_id: SessionId,
    pub step_index: u64,
    pub workflow_type: WorkflowType,
    /// `serde_json` encoding of the `RunState`.
    pub state_blob: Vec<u8>,
    pub written_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Snapshot a run state at its current step.
    pub fn capture(state: &RunState) -> Result<Self> {
        Ok(Self {
            session_id: state.session_id.clone(),
            step_index: state.step,
            workflow_type: state.workflow,
            state_blob: serde_json::to_vec(state)?,
            written_at: Utc::now(),
        })
    }

    /// Decode the stored run state.
    pub fn state(&self) -> Result<RunState> {
        Ok(serde_json::from_slice(&self.state_blob)?)
    }
}

/// One audit line per compliance violation, consumed by external tooling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub session_id: String,
    pub step_index: u64,
    pub rule_id: String,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    pub fn from_violation(session: &SessionId, step: u64, violation: &ComplianceViolation) -> Self {
        Self {
            session_id: session.0.clone(),
            step_index: step,
            rule_id: violation.rule_id.clone(),
            severity: violation.severity,
            timestamp: violation.detected_at,
        }
    }
}
