use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::state::{is_terminal, CLASSIFY, FINALIZE, SUSPEND_FOR_REVIEW};
use waypoint_core::types::{AgentRole, WorkflowType};

use super::edge::{Edge, StepOutcome};
use super::node::Node;

/// Node and edge table for one workflow type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowGraph {
    pub workflow: WorkflowType,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

impl WorkflowGraph {
    pub fn new(workflow: WorkflowType, nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        Self {
            workflow,
            nodes,
            edges,
        }
    }

    /// Built-in pipeline for a workflow type.
    pub fn for_workflow(workflow: WorkflowType) -> Self {
        match workflow {
            WorkflowType::General => Self::new(
                workflow,
                vec![Node::new("respond", &["general"])],
                vec![Edge::always(CLASSIFY, "respond"), Edge::always("respond", FINALIZE)],
            ),
            WorkflowType::UserQuery => Self::new(
                workflow,
                vec![Node::new("answer", &["knowledge", "research"])],
                vec![Edge::always(CLASSIFY, "answer"), Edge::always("answer", FINALIZE)],
            ),
            WorkflowType::PlatformChange => Self::new(
                workflow,
                vec![
                    Node::new("assess", &["platform-analyst", "change-planner"])
                        .sequential()
                        .mandatory(),
                    Node::new("security", &["security-review"]),
                ],
                vec![
                    Edge::always(CLASSIFY, "assess"),
                    Edge::mandatory_failed("assess", SUSPEND_FOR_REVIEW),
                    Edge::conditional("assess", "security", r#"roles contains "security-review""#),
                    Edge::always("assess", FINALIZE),
                    Edge::always("security", FINALIZE),
                ],
            ),
            WorkflowType::ComplianceSensitive => Self::new(
                workflow,
                vec![
                    Node::new("guidance", &["essay-guidance"]).mandatory(),
                    Node::new("policy", &["policy-review"]),
                ],
                vec![
                    Edge::always(CLASSIFY, "guidance"),
                    Edge::mandatory_failed("guidance", SUSPEND_FOR_REVIEW),
                    Edge::conditional("guidance", "policy", r#"roles contains "policy-review""#),
                    Edge::always("guidance", FINALIZE),
                    Edge::always("policy", FINALIZE),
                ],
            ),
            WorkflowType::DataCollection => Self::new(
                workflow,
                vec![
                    Node::new("collect", &["data-collector"]),
                    Node::new("validate", &["data-validator"]),
                ],
                vec![
                    Edge::always(CLASSIFY, "collect"),
                    Edge::conditional("collect", "validate", r#"roles contains "data-validator""#),
                    Edge::always("collect", FINALIZE),
                    Edge::always("validate", FINALIZE),
                ],
            ),
            WorkflowType::Maintenance => Self::new(
                workflow,
                vec![Node::new("maintain", &["maintenance"]).mandatory()],
                vec![
                    Edge::always(CLASSIFY, "maintain"),
                    Edge::mandatory_failed("maintain", SUSPEND_FOR_REVIEW),
                    Edge::always("maintain", FINALIZE),
                ],
            ),
        }
    }

    /// Built-in graphs for every workflow type.
    pub fn builtins() -> HashMap<WorkflowType, WorkflowGraph> {
        WorkflowType::ALL
            .iter()
            .map(|w| (*w, Self::for_workflow(*w)))
            .collect()
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Roles of every mandatory node.
    pub fn mandatory_roles(&self) -> Vec<&AgentRole> {
        self.nodes
            .iter()
            .filter(|n| n.mandatory)
            .flat_map(|n| n.roles.iter())
            .collect()
    }

    /// Next node after `from`: the first matching outgoing edge, else `finalize`.
    pub fn route(
        &self,
        from: &str,
        outcome: &StepOutcome,
        context: &HashMap<String, serde_json::Value>,
    ) -> String {
        self.edges
            .iter()
            .filter(|e| e.from == from)
            .find(|e| e.matches(outcome, context))
            .map(|e| e.to.clone())
            .unwrap_or_else(|| FINALIZE.to_string())
    }

    /// Check that every edge connects known nodes.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for node in &self.nodes {
            if node.name == CLASSIFY || is_terminal(&node.name) {
                return Err(WaypointError::Workflow(format!(
                    "{}: node name '{}' is reserved",
                    self.workflow, node.name
                )));
            }
            if !names.insert(node.name.as_str()) {
                return Err(WaypointError::Workflow(format!(
                    "{}: duplicate node '{}'",
                    self.workflow, node.name
                )));
            }
        }

        for edge in &self.edges {
            if edge.from != CLASSIFY && !names.contains(edge.from.as_str()) {
                return Err(WaypointError::Workflow(format!(
                    "{}: edge from unknown node '{}'",
                    self.workflow, edge.from
                )));
            }
            if !is_terminal(&edge.to) && !names.contains(edge.to.as_str()) {
                return Err(WaypointError::Workflow(format!(
                    "{}: edge to unknown node '{}'",
                    self.workflow, edge.to
                )));
            }
        }
        Ok(())
    }
}
