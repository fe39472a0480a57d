//! Tools: what they are, how their names reach the model, how they run.

pub mod builtin;
pub mod context;
pub mod dispatcher;

pub use builtin::{exit_loop, load_artifacts, transfer_to_agent};
pub use context::{NestedRunner, ToolContext};
pub use dispatcher::ToolDispatcher;

use crate::agent::AgentSpec;
use crate::error::ToolError;
use crate::provider::ToolDefinition;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Longest tool name most model APIs accept.
pub const MAX_TOOL_NAME_LEN: usize = 64;

pub type ToolFuture = BoxFuture<'static, Result<Value, ToolError>>;
pub type LocalToolFn = Arc<dyn Fn(Value, ToolContext) -> ToolFuture + Send + Sync>;

/// An external-service adapter (MCP server, OpenAPI operation, ...).
#[async_trait]
pub trait RemoteTool: Send + Sync {
    /// Short label of the backing service, for logs.
    fn service(&self) -> &str;

    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError>;
}

/// What a tool call ends up running.
#[derive(Clone)]
pub enum ToolTarget {
    Local(LocalToolFn),
    /// An agent exposed as a tool; its final text is the result.
    Delegate(Arc<AgentSpec>),
    Remote(Arc<dyn RemoteTool>),
}

impl fmt::Debug for ToolTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(_) => f.write_str("Local"),
            Self::Delegate(agent) => write!(f, "Delegate({})", agent.name),
            Self::Remote(remote) => write!(f, "Remote({})", remote.service()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object.
    pub parameters: Value,
    pub target: ToolTarget,
    /// Returns an initial result and finishes out of band.
    pub long_running: bool,
}

impl ToolSpec {
    /// An async local tool.
    ///
    /// ```rust,no_run
    /// use weft::tools::ToolSpec;
    /// use serde_json::json;
    ///
    /// let add = ToolSpec::function(
    ///     "add",
    ///     "Add two integers",
    ///     json!({
    ///         "type": "object",
    ///         "properties": { "a": {"type": "integer"}, "b": {"type": "integer"} },
    ///         "required": ["a", "b"]
    ///     }),
    ///     |args, _ctx| async move {
    ///         Ok(json!(args["a"].as_i64().unwrap_or(0) + args["b"].as_i64().unwrap_or(0)))
    ///     },
    /// );
    /// ```
    pub fn function<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        f: F,
    ) -> Self
    where
        F: Fn(Value, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        let body: LocalToolFn = Arc::new(move |args, ctx| Box::pin(f(args, ctx)));
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            target: ToolTarget::Local(body),
            long_running: false,
        }
    }

    /// A local tool whose body never awaits.
    pub fn sync_function<F>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        f: F,
    ) -> Self
    where
        F: Fn(Value, &ToolContext) -> Result<Value, ToolError> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self::function(name, description, parameters, move |args, ctx| {
            let f = f.clone();
            async move { f(args, &ctx) }
        })
    }

    /// Expose `agent` as a tool taking one `request` string.
    pub fn agent(agent: Arc<AgentSpec>) -> Self {
        let description = if agent.description.is_empty() {
            format!("Delegate a request to the '{}' agent", agent.name)
        } else {
            agent.description.clone()
        };
        Self {
            name: agent.name.clone(),
            description,
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "request": {
                        "type": "string",
                        "description": "The request to hand to this agent"
                    }
                },
                "required": ["request"]
            }),
            target: ToolTarget::Delegate(agent),
            long_running: false,
        }
    }

    pub fn remote(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        adapter: Arc<dyn RemoteTool>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            target: ToolTarget::Remote(adapter),
            long_running: false,
        }
    }

    /// Mark the tool as long-running.
    pub fn long_running(mut self) -> Self {
        self.long_running = true;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }
}

/// Check `value` against a JSON schema. The error lists every violation.
pub fn validate_against_schema(schema: &Value, value: &Value) -> Result<(), String> {
    let validator =
        jsonschema::Validator::new(schema).map_err(|e| format!("invalid schema: {}", e))?;
    if validator.is_valid(value) {
        return Ok(());
    }
    let errors: Vec<String> = validator.iter_errors(value).map(|e| e.to_string()).collect();
    Err(errors.join("; "))
}

/// Make `name` acceptable to model APIs. Idempotent.
pub fn sanitize_tool_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() {
        out.push('_');
    }
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out.truncate(MAX_TOOL_NAME_LEN);
    out
}

/// Sanitize every name and resolve collisions by suffixing `_2`, `_3`, ...
/// in list order. The first tool keeps the plain name.
pub(crate) fn expose_tools(tools: &[ToolSpec]) -> Vec<ToolSpec> {
    let mut taken = HashSet::new();
    tools
        .iter()
        .map(|tool| {
            let base = sanitize_tool_name(&tool.name);
            let mut name = base.clone();
            let mut n = 2;
            while !taken.insert(name.clone()) {
                let suffix = format!("_{}", n);
                let keep = MAX_TOOL_NAME_LEN.saturating_sub(suffix.len()).min(base.len());
                name = format!("{}{}", &base[..keep], suffix);
                n += 1;
            }
            tool.clone().with_name(name)
        })
        .collect()
}
