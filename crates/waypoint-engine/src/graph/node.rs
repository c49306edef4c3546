use serde::{Deserialize, Serialize};

use waypoint_core::types::AgentRole;

/// How a node dispatches its agent calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dispatch {
    /// All calls run concurrently; the node waits for every one.
    #[default]
    Parallel,
    /// Calls run one at a time, each seeing the earlier outputs.
    Sequential,
}

/// A worker node in a workflow graph.
///
/// Only roles the classifier selected for the run are called; a node whose
/// roles were all left out completes without calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub roles: Vec<AgentRole>,
    #[serde(default)]
    pub dispatch: Dispatch,
    /// A failed call from a mandatory node must not end in a completed run.
    #[serde(default)]
    pub mandatory: bool,
}

impl Node {
    pub fn new(name: impl Into<String>, roles: &[&str]) -> Self {
        Self {
            name: name.into(),
            roles: roles.iter().map(|r| AgentRole::from(*r)).collect(),
            dispatch: Dispatch::Parallel,
            mandatory: false,
        }
    }

    pub fn sequential(mut self) -> Self {
        self.dispatch = Dispatch::Sequential;
        self
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    /// Roles to call, in declaration order, given the run's selected roles.
    pub fn active_roles(&self, selected: &[AgentRole]) -> Vec<AgentRole> {
        self.roles
            .iter()
            .filter(|r| selected.contains(r))
            .cloned()
            .collect()
    }
}
