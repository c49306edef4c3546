use std::collections::HashMap;
use std::sync::Arc;

use waypoint_core::traits::Agent;

/// Registry of agents keyed by role.
///
/// New agents are added by registering an implementation; the coordinator
/// only ever looks roles up by name.
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: HashMap::new(),
        }
    }

    /// Register an agent under its own role, replacing any previous one.
    pub fn register(&mut self, agent: impl Agent) {
        let role = agent.role().to_string();
        self.agents.insert(role, Arc::new(agent));
    }

    /// Register an already shared agent.
    pub fn register_arc(&mut self, agent: Arc<dyn Agent>) {
        let role = agent.role().to_string();
        self.agents.insert(role, agent);
    }

    pub fn unregister(&mut self, role: &str) -> bool {
        self.agents.remove(role).is_some()
    }

    pub fn get(&self, role: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(role).cloned()
    }

    pub fn contains(&self, role: &str) -> bool {
        self.agents.contains_key(role)
    }

    /// Registered roles, sorted.
    pub fn roles(&self) -> Vec<&str> {
        let mut roles: Vec<&str> = self.agents.keys().map(|s| s.as_str()).collect();
        roles.sort_unstable();
        roles
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
