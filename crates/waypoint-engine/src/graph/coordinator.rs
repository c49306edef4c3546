use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use waypoint_core::config::{AppConfig, EngineConfig};
use waypoint_core::error::{Result, WaypointError};
use waypoint_core::event::EventBus;
use waypoint_core::state::{
    is_terminal, AuditRecord, Checkpoint, ComplianceViolation, ConversationTurn, RunPhase,
    RunState, Severity, CLASSIFY, FINALIZE, SUSPEND_FOR_REVIEW,
};
use waypoint_core::traits::{AuditSink, CheckpointStore};
use waypoint_core::types::{
    AgentFailureKind, AgentResult, AgentRole, EngineEvent, Response, WorkflowType,
};
use waypoint_gateway::AgentGateway;

use super::edge::{routing_context, StepOutcome};
use super::node::{Dispatch, Node};
use super::workflow::WorkflowGraph;
use crate::compliance::{ComplianceEngine, GateVerdict, RuleContext};

/// One finished agent call of a step.
struct CallOutcome {
    role: AgentRole,
    result: Result<AgentResult>,
    elapsed_ms: u64,
}

/// Walks a run state through its workflow graph.
///
/// Each worker step calls its agents through the gateway, folds the results
/// into the state, runs the compliance gate over every new output, routes,
/// and commits a checkpoint before the next step starts. The coordinator
/// holds no per-run state; everything lives in the `RunState` it is given.
pub struct GraphCoordinator {
    gateway: Arc<AgentGateway>,
    compliance: Arc<ComplianceEngine>,
    store: Arc<dyn CheckpointStore>,
    audit: Option<Arc<dyn AuditSink>>,
    event_bus: Arc<EventBus>,
    graphs: HashMap<WorkflowType, WorkflowGraph>,
    config: EngineConfig,
    write_timeout: Duration,
}

impl GraphCoordinator {
    pub fn new(
        gateway: Arc<AgentGateway>,
        compliance: Arc<ComplianceEngine>,
        store: Arc<dyn CheckpointStore>,
        event_bus: Arc<EventBus>,
        config: &AppConfig,
    ) -> Self {
        Self {
            gateway,
            compliance,
            store,
            audit: None,
            event_bus,
            graphs: WorkflowGraph::builtins(),
            config: config.engine.clone(),
            write_timeout: Duration::from_secs(config.checkpoint.write_timeout_secs),
        }
    }

    /// Write one audit record per compliance violation to `sink`.
    pub fn with_audit(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    /// Replace the graph used for one workflow type.
    pub fn with_graph(mut self, graph: WorkflowGraph) -> Result<Self> {
        graph.validate()?;
        self.graphs.insert(graph.workflow, graph);
        Ok(self)
    }

    pub fn graph(&self, workflow: WorkflowType) -> Result<&WorkflowGraph> {
        self.graphs
            .get(&workflow)
            .ok_or_else(|| WaypointError::Workflow(format!("no graph for workflow {}", workflow)))
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Drive `state` from its current node to a terminal node.
    ///
    /// Returns the terminal state, which is already checkpointed. On
    /// cancellation the last committed checkpoint stays the resumable state.
    pub async fn run(&self, mut state: RunState, cancel: &CancellationToken) -> Result<RunState> {
        let graph = self.graph(state.workflow)?;

        info!(
            session_id = %state.session_id,
            workflow = %state.workflow,
            node = %state.current_node,
            step = state.step,
            "Run started"
        );
        self.event_bus.publish(EngineEvent::RunStarted {
            session_id: state.session_id.clone(),
            workflow: state.workflow,
            turn: state.turn,
        });

        loop {
            if cancel.is_cancelled() {
                return Err(self.cancelled(&state));
            }

            let node_name = state.current_node.clone();

            if is_terminal(&node_name) {
                if node_name == SUSPEND_FOR_REVIEW {
                    self.suspend(&mut state);
                } else {
                    self.finalize(&mut state, graph);
                }
                state.advance(&node_name);
                self.commit(&state).await?;

                let status = Response::from_state(&state).status;
                info!(
                    session_id = %state.session_id,
                    node = %node_name,
                    step = state.step,
                    status = %status,
                    "Run finished"
                );
                self.event_bus.publish(EngineEvent::RunFinished {
                    session_id: state.session_id.clone(),
                    status,
                    steps: state.step,
                });
                return Ok(state);
            }

            if state.turn_steps() >= self.config.max_steps {
                warn!(
                    session_id = %state.session_id,
                    node = %node_name,
                    max_steps = self.config.max_steps,
                    "Step limit reached, finalizing with partial results"
                );
                state.degraded = true;
                state.current_node = FINALIZE.to_string();
                continue;
            }

            if node_name == CLASSIFY {
                state.advance(CLASSIFY);
                let outcome = StepOutcome::ok(state.human_review);
                let ctx = routing_context(&state, CLASSIFY, &outcome);
                state.current_node = graph.route(CLASSIFY, &outcome, &ctx);
                self.commit(&state).await?;
                self.step_completed(&state, CLASSIFY);
                continue;
            }

            let node = graph.node(&node_name).ok_or_else(|| {
                WaypointError::Workflow(format!(
                    "node '{}' not found in {} graph",
                    node_name, state.workflow
                ))
            })?;
            self.execute_node(&mut state, graph, node, cancel).await?;
        }
    }

    /// Write a checkpoint for the state's current step.
    ///
    /// Each attempt is bounded by the write timeout; one failed attempt is
    /// retried, a second aborts with `CheckpointWriteFailed`.
    pub async fn commit(&self, state: &RunState) -> Result<()> {
        let checkpoint = Checkpoint::capture(state)?;
        let mut reason = String::new();

        for attempt in 1..=2u32 {
            match tokio::time::timeout(self.write_timeout, self.store.save(&checkpoint)).await {
                Ok(Ok(())) => {
                    debug!(session_id = %state.session_id, step = state.step, "Step committed");
                    return Ok(());
                }
                Ok(Err(e)) => reason = e.to_string(),
                Err(_) => {
                    reason = format!("write timed out after {}ms", self.write_timeout.as_millis())
                }
            }
            warn!(
                session_id = %state.session_id,
                step = state.step,
                attempt,
                error = %reason,
                "Checkpoint write failed"
            );
        }

        error!(session_id = %state.session_id, step = state.step, "Giving up on checkpoint write");
        Err(WaypointError::CheckpointWriteFailed {
            session: state.session_id.clone(),
            step: state.step,
            reason,
        })
    }

    async fn execute_node(
        &self,
        state: &mut RunState,
        graph: &WorkflowGraph,
        node: &Node,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let roles = node.active_roles(&state.roles);
        let payload = base_payload(state);

        debug!(
            session_id = %state.session_id,
            node = %node.name,
            roles = roles.len(),
            dispatch = ?node.dispatch,
            "Dispatching node"
        );

        let dispatch = async {
            match node.dispatch {
                Dispatch::Parallel => self.dispatch_parallel(&roles, &payload).await,
                Dispatch::Sequential => self.dispatch_sequential(&roles, &payload).await,
            }
        };

        // In-flight calls are dropped on cancellation; nothing from this
        // step reaches the state or the store.
        let calls = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(self.cancelled(state)),
            calls = dispatch => calls,
        };

        let step = state.advance(&node.name);
        let mut succeeded = true;
        let mut mandatory_failed = false;
        let mut outputs: Vec<(AgentRole, String)> = Vec::new();

        for call in calls {
            let result = match call.result {
                Ok(result) => result,
                Err(e) => {
                    warn!(session_id = %state.session_id, role = %call.role, error = %e, "Agent call failed");
                    AgentResult::from_error(&e)
                }
            };

            self.event_bus.publish(EngineEvent::AgentCalled {
                session_id: state.session_id.clone(),
                role: call.role.clone(),
                succeeded: result.is_success(),
                elapsed_ms: call.elapsed_ms,
            });

            match result.text() {
                Some(text) => outputs.push((call.role.clone(), text)),
                None => {
                    succeeded = false;
                    if node.mandatory {
                        mandatory_failed = true;
                    }
                }
            }
            state.record_result(call.role, result);
        }

        let mut audit = Vec::new();
        let verdict = self.gate(state, step, &outputs, &mut audit)?;

        match verdict {
            Gate::Blocked(roles) => {
                for role in roles {
                    state.record_result(
                        role,
                        AgentResult::failure(
                            AgentFailureKind::Withheld,
                            "output withheld by compliance gate",
                        ),
                    );
                }
                warn!(
                    session_id = %state.session_id,
                    node = %node.name,
                    step,
                    "Critical violation, answering with fallback"
                );
                state.blocked = true;
                state.final_response = Some(self.config.fallback_response.clone());
                self.flag(state);
                state.current_node = FINALIZE.to_string();
            }
            Gate::Passed { flagged } => {
                if flagged {
                    self.flag(state);
                }
                if !outputs.is_empty() {
                    let fragment = outputs
                        .iter()
                        .map(|(_, text)| text.as_str())
                        .collect::<Vec<_>>()
                        .join("\n\n");
                    state.draft = Some(match state.draft.take() {
                        Some(prev) => format!("{}\n\n{}", prev, fragment),
                        None => fragment,
                    });
                }

                let outcome = StepOutcome {
                    succeeded,
                    mandatory_failed,
                    needs_review: state.human_review,
                };
                let ctx = routing_context(state, &node.name, &outcome);
                state.current_node = graph.route(&node.name, &outcome, &ctx);
            }
        }

        self.commit(state).await?;
        self.write_audit(audit).await;
        self.step_completed(state, &node.name);
        Ok(())
    }

    async fn dispatch_parallel(
        &self,
        roles: &[AgentRole],
        payload: &serde_json::Value,
    ) -> Vec<CallOutcome> {
        let calls = roles.iter().map(|role| async move {
            let started = Instant::now();
            let result = self
                .gateway
                .invoke(self.gateway.call(role, payload.clone()))
                .await;
            CallOutcome {
                role: role.clone(),
                result,
                elapsed_ms: started.elapsed().as_millis() as u64,
            }
        });
        futures::future::join_all(calls).await
    }

    async fn dispatch_sequential(
        &self,
        roles: &[AgentRole],
        payload: &serde_json::Value,
    ) -> Vec<CallOutcome> {
        let mut outcomes = Vec::with_capacity(roles.len());
        let mut previous: Vec<serde_json::Value> = Vec::new();

        for role in roles {
            let mut payload = payload.clone();
            payload["previous"] = serde_json::Value::Array(previous.clone());

            let started = Instant::now();
            let result = self.gateway.invoke(self.gateway.call(role, payload)).await;

            previous.push(match &result {
                Ok(r @ AgentResult::Success { .. }) => serde_json::json!({
                    "role": role.as_str(),
                    "output": r.text(),
                }),
                Ok(AgentResult::Failure { kind, .. }) => serde_json::json!({
                    "role": role.as_str(),
                    "error": kind.to_string(),
                }),
                Err(e) => serde_json::json!({
                    "role": role.as_str(),
                    "error": e.to_string(),
                }),
            });

            outcomes.push(CallOutcome {
                role: role.clone(),
                result,
                elapsed_ms: started.elapsed().as_millis() as u64,
            });
        }
        outcomes
    }

    /// Run the compliance gate over this step's outputs and record findings.
    ///
    /// Audit records are collected into `audit` and written only once the
    /// step is committed, so a step that is re-run after a failed commit is
    /// audited once.
    fn gate(
        &self,
        state: &mut RunState,
        step: u64,
        outputs: &[(AgentRole, String)],
        audit: &mut Vec<AuditRecord>,
    ) -> Result<Gate> {
        let rule_ids = self.compliance.rules_for(state.workflow);
        let mut blocked = Vec::new();
        let mut flagged = false;

        for (role, text) in outputs {
            let violations = {
                let ctx = RuleContext::new(state.workflow, &state.context).with_role(role);
                self.compliance.evaluate(&rule_ids, &state.query, text, &ctx)?
            };

            match GateVerdict::from_violations(&violations) {
                GateVerdict::Block => blocked.push(role.clone()),
                GateVerdict::Flag => flagged = true,
                GateVerdict::Pass => {}
            }

            for violation in violations {
                audit.push(AuditRecord::from_violation(&state.session_id, step, &violation));
                self.record_violation(state, step, violation);
            }
        }

        Ok(if blocked.is_empty() {
            Gate::Passed { flagged }
        } else {
            Gate::Blocked(blocked)
        })
    }

    fn record_violation(&self, state: &mut RunState, step: u64, violation: ComplianceViolation) {
        match violation.severity {
            Severity::Critical => warn!(
                session_id = %state.session_id,
                step,
                rule_id = %violation.rule_id,
                span = %violation.span,
                "Critical compliance violation"
            ),
            _ => info!(
                session_id = %state.session_id,
                step,
                rule_id = %violation.rule_id,
                severity = %violation.severity,
                "Compliance violation"
            ),
        }

        self.event_bus.publish(EngineEvent::ViolationRecorded {
            session_id: state.session_id.clone(),
            step,
            violation: violation.clone(),
        });
        state.record_violation(violation);
    }

    async fn write_audit(&self, records: Vec<AuditRecord>) {
        let Some(ref sink) = self.audit else {
            return;
        };
        for record in records {
            if let Err(e) = sink.record(&record).await {
                error!(
                    session_id = %record.session_id,
                    step = record.step_index,
                    error = %e,
                    "Failed to write audit record"
                );
            }
        }
    }

    /// Raise the review flag, announcing the transition once.
    fn flag(&self, state: &mut RunState) {
        if state.human_review {
            return;
        }
        state.flag_for_review();
        info!(session_id = %state.session_id, step = state.step, "Human review flagged");
        self.event_bus.publish(EngineEvent::HumanReviewFlagged {
            session_id: state.session_id.clone(),
            step: state.step,
        });
    }

    fn finalize(&self, state: &mut RunState, graph: &WorkflowGraph) {
        if !state.blocked {
            match state.draft.clone() {
                Some(draft) => state.final_response = Some(draft),
                None => {
                    state.degraded = true;
                    state.final_response = Some(self.config.degraded_response.clone());
                }
            }
        }

        let mandatory = graph.mandatory_roles();
        let failed_mandatory = state
            .failed_roles()
            .into_iter()
            .any(|role| mandatory.contains(&role));
        if failed_mandatory {
            self.flag(state);
        }

        self.close_turn(state, RunPhase::Finalized);
    }

    fn suspend(&self, state: &mut RunState) {
        self.flag(state);
        if state.final_response.is_none() {
            state.final_response = Some(self.config.fallback_response.clone());
        }
        self.close_turn(state, RunPhase::Suspended);
    }

    fn close_turn(&self, state: &mut RunState, phase: RunPhase) {
        state.conversation.push(ConversationTurn {
            query: state.query.clone(),
            response: state.final_response.clone().unwrap_or_default(),
            at: Utc::now(),
        });
        state.phase = phase;
    }

    fn step_completed(&self, state: &RunState, node: &str) {
        self.event_bus.publish(EngineEvent::StepCompleted {
            session_id: state.session_id.clone(),
            node: node.to_string(),
            step: state.step,
        });
    }

    fn cancelled(&self, state: &RunState) -> WaypointError {
        info!(
            session_id = %state.session_id,
            node = %state.current_node,
            step = state.step,
            "Run cancelled"
        );
        self.event_bus.publish(EngineEvent::RunCancelled {
            session_id: state.session_id.clone(),
            step: state.step,
        });
        WaypointError::Cancelled {
            session: state.session_id.clone(),
        }
    }
}

enum Gate {
    Passed { flagged: bool },
    Blocked(Vec<AgentRole>),
}

/// Payload shared by every call of a step.
fn base_payload(state: &RunState) -> serde_json::Value {
    let prior: serde_json::Map<String, serde_json::Value> = state
        .results
        .iter()
        .filter_map(|(role, r)| r.text().map(|t| (role.0.clone(), serde_json::Value::String(t))))
        .collect();
    let conversation: Vec<serde_json::Value> = state
        .conversation
        .iter()
        .map(|t| serde_json::json!({ "query": t.query, "response": t.response }))
        .collect();

    serde_json::json!({
        "query": state.query,
        "context": state.context,
        "workflow": state.workflow.as_str(),
        "session_id": state.session_id.as_str(),
        "turn": state.turn,
        "prior_results": prior,
        "conversation": conversation,
    })
}
