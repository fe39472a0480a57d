//! Named agent definitions.

use crate::agent::AgentSpec;
use crate::error::WeftError;
use std::collections::HashMap;
use std::sync::Arc;

/// In-memory map from agent name to definition.
///
/// Registering an agent registers its whole tree (sub-agents and merge
/// agents). The tree goes in completely or not at all.
#[derive(Debug, Default, Clone)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<AgentSpec>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, agent: Arc<AgentSpec>) -> Result<(), WeftError> {
        let mut tree = Vec::new();
        collect_tree(&agent, &mut tree);

        let mut pending: HashMap<&str, &Arc<AgentSpec>> = HashMap::new();
        for spec in &tree {
            if spec.name.trim().is_empty() {
                return Err(WeftError::ArgumentValidation {
                    target: "agent".into(),
                    reason: "agent names must not be empty".into(),
                });
            }
            if self.agents.contains_key(&spec.name) {
                return Err(WeftError::duplicate("agent", &spec.name));
            }
            // The same Arc reachable twice is one agent, not a clash.
            match pending.get(spec.name.as_str()) {
                Some(other) if !Arc::ptr_eq(other, spec) => {
                    return Err(WeftError::duplicate("agent", &spec.name));
                }
                Some(_) => {}
                None => {
                    pending.insert(spec.name.as_str(), spec);
                }
            }
        }

        for spec in &tree {
            self.agents
                .entry(spec.name.clone())
                .or_insert_with(|| spec.clone());
        }
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<AgentSpec>, WeftError> {
        self.agents
            .get(name)
            .cloned()
            .ok_or_else(|| WeftError::not_found("agent", name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

fn collect_tree(agent: &Arc<AgentSpec>, out: &mut Vec<Arc<AgentSpec>>) {
    out.push(agent.clone());
    for child in agent.children() {
        collect_tree(child, out);
    }
}
