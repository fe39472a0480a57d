//! Agent definitions: a model-driven agent or a composition of agents.
//!
//! Specs are plain data built with `with_*` setters and shared as
//! `Arc<AgentSpec>` once complete; nothing mutates them afterwards.
//!
//! ```rust,no_run
//! use weft::agent::AgentSpec;
//! use weft::tools::exit_loop;
//! use std::sync::Arc;
//!
//! let writer = AgentSpec::llm("writer")
//!     .with_instruction("Write a short story about {topic}.")
//!     .with_output_key("draft");
//! let critic = AgentSpec::llm("critic")
//!     .with_instruction("Critique this draft: {draft}")
//!     .with_tool(exit_loop());
//! let refine = AgentSpec::loop_of("refine", vec![Arc::new(writer), Arc::new(critic)])
//!     .with_max_iterations(3);
//! ```

use crate::callbacks::Callbacks;
use crate::tools::ToolSpec;
use serde_json::Value;
use std::sync::Arc;

/// Ends a loop when `agent`'s final text contains `phrase`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionSignal {
    pub agent: String,
    pub phrase: String,
}

impl CompletionSignal {
    pub fn new(agent: impl Into<String>, phrase: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            phrase: phrase.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum AgentKind {
    /// Talks to a model; `sub_agents` are delegation targets.
    Llm,
    /// Runs `sub_agents` in order.
    Sequential,
    /// Runs `sub_agents` concurrently, then the optional merge agent.
    Parallel { merge: Option<Arc<AgentSpec>> },
    /// Repeats `sub_agents` in order until escalation, the completion
    /// signal, or `max_iterations`.
    Loop {
        max_iterations: Option<usize>,
        completion: Option<CompletionSignal>,
    },
}

#[derive(Debug, Clone)]
pub struct AgentSpec {
    pub name: String,
    pub description: String,
    /// Model name; empty means the run's default model.
    pub model: String,
    /// System instruction; `{key}` placeholders are filled from state.
    pub instruction: String,
    pub tools: Vec<ToolSpec>,
    pub sub_agents: Vec<Arc<AgentSpec>>,
    pub callbacks: Callbacks,
    /// State key that receives the agent's final text.
    pub output_key: Option<String>,
    /// JSON schema the final answer must satisfy. The answer is parsed as
    /// JSON and stored under `output_key` as a value, not as text.
    pub output_schema: Option<Value>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub kind: AgentKind,
}

impl AgentSpec {
    fn with_kind(name: impl Into<String>, kind: AgentKind) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            model: String::new(),
            instruction: String::new(),
            tools: Vec::new(),
            sub_agents: Vec::new(),
            callbacks: Callbacks::default(),
            output_key: None,
            output_schema: None,
            temperature: None,
            max_tokens: None,
            kind,
        }
    }

    pub fn llm(name: impl Into<String>) -> Self {
        Self::with_kind(name, AgentKind::Llm)
    }

    pub fn sequential(name: impl Into<String>, children: Vec<Arc<AgentSpec>>) -> Self {
        Self::with_kind(name, AgentKind::Sequential).with_sub_agents(children)
    }

    pub fn parallel(name: impl Into<String>, children: Vec<Arc<AgentSpec>>) -> Self {
        Self::with_kind(name, AgentKind::Parallel { merge: None }).with_sub_agents(children)
    }

    pub fn loop_of(name: impl Into<String>, children: Vec<Arc<AgentSpec>>) -> Self {
        Self::with_kind(
            name,
            AgentKind::Loop {
                max_iterations: None,
                completion: None,
            },
        )
        .with_sub_agents(children)
    }

    // -- Builder-style setters --

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = instruction.into();
        self
    }

    pub fn with_tool(mut self, tool: ToolSpec) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools.extend(tools);
        self
    }

    pub fn with_sub_agent(mut self, agent: Arc<AgentSpec>) -> Self {
        self.sub_agents.push(agent);
        self
    }

    pub fn with_sub_agents(mut self, agents: Vec<Arc<AgentSpec>>) -> Self {
        self.sub_agents.extend(agents);
        self
    }

    pub fn with_callbacks(mut self, callbacks: Callbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn with_output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = Some(key.into());
        self
    }

    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    /// Only meaningful on a loop; ignored otherwise.
    pub fn with_max_iterations(mut self, max: usize) -> Self {
        if let AgentKind::Loop { max_iterations, .. } = &mut self.kind {
            *max_iterations = Some(max);
        }
        self
    }

    /// Only meaningful on a loop; ignored otherwise.
    pub fn with_completion_signal(mut self, signal: CompletionSignal) -> Self {
        if let AgentKind::Loop { completion, .. } = &mut self.kind {
            *completion = Some(signal);
        }
        self
    }

    /// Only meaningful on a parallel composition; ignored otherwise.
    pub fn with_merge(mut self, agent: Arc<AgentSpec>) -> Self {
        if let AgentKind::Parallel { merge } = &mut self.kind {
            *merge = Some(agent);
        }
        self
    }

    pub fn is_llm(&self) -> bool {
        matches!(self.kind, AgentKind::Llm)
    }

    /// Depth-first search of this agent's tree (itself included), through
    /// sub-agents and merge agents.
    pub fn find_agent(self: &Arc<Self>, name: &str) -> Option<Arc<AgentSpec>> {
        if self.name == name {
            return Some(self.clone());
        }
        self.children().find_map(|child| child.find_agent(name))
    }

    /// Sub-agents followed by the merge agent, if any.
    pub fn children(&self) -> impl Iterator<Item = &Arc<AgentSpec>> {
        let merge = match &self.kind {
            AgentKind::Parallel { merge } => merge.as_ref(),
            _ => None,
        };
        self.sub_agents.iter().chain(merge)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_agent_searches_merge_agents() {
        let a = Arc::new(AgentSpec::llm("a"));
        let merger = Arc::new(AgentSpec::llm("merger"));
        let root = Arc::new(
            AgentSpec::sequential(
                "root",
                vec![Arc::new(AgentSpec::parallel("fan", vec![a]).with_merge(merger))],
            ),
        );
        let found = root.find_agent("merger").map(|m| m.name.clone());
        assert_eq!(found.as_deref(), Some("merger"));
        assert!(root.find_agent("a").is_some());
        assert!(root.find_agent("ghost").is_none());
    }

    #[test]
    fn test_kind_specific_setters_ignore_other_kinds() {
        let llm = AgentSpec::llm("x").with_max_iterations(3);
        assert!(llm.is_llm());
        let looped = AgentSpec::loop_of("l", vec![])
            .with_max_iterations(3)
            .with_completion_signal(CompletionSignal::new("critic", "DONE"));
        match looped.kind {
            AgentKind::Loop {
                max_iterations,
                completion,
            } => {
                assert_eq!(max_iterations, Some(3));
                assert_eq!(completion.map(|c| c.phrase).as_deref(), Some("DONE"));
            }
            _ => panic!("expected loop"),
        }
    }
}
