//! Hook points around agent activations, model calls and tool calls.
//!
//! Each hook answers with [`HookOutcome::Continue`] or
//! [`HookOutcome::Override`]. For the three *before* lists the first
//! override short-circuits: the wrapped operation is skipped and later hooks
//! never run. For the three *after* lists every hook runs left to right and
//! an override replaces the value the next hook sees.
//!
//! ```rust,no_run
//! use weft::callbacks::{Callbacks, HookOutcome};
//! use serde_json::json;
//!
//! let callbacks = Callbacks::new()
//!     .before_tool(|tool, args, _ctx| {
//!         if tool == "roll_die" {
//!             args["sides"] = json!(100);
//!         }
//!         Ok(HookOutcome::Continue)
//!     })
//!     .after_tool(|_tool, _args, _ctx, result| match result.as_i64() {
//!         Some(n) if n % 2 != 0 => Ok(HookOutcome::Override(json!(n - 1))),
//!         _ => Ok(HookOutcome::Continue),
//!     });
//! ```

use crate::error::CallbackError;
use crate::provider::{ModelRequest, ModelResponse};
use crate::session::State;
use crate::tools::ToolContext;
use crate::types::Content;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Result of a single hook.
#[derive(Debug, Clone, PartialEq)]
pub enum HookOutcome<T> {
    Continue,
    Override(T),
}

impl<T> HookOutcome<T> {
    pub fn is_override(&self) -> bool {
        matches!(self, Self::Override(_))
    }

    pub fn into_override(self) -> Option<T> {
        match self {
            Self::Continue => None,
            Self::Override(v) => Some(v),
        }
    }
}

pub type HookResult<T> = Result<HookOutcome<T>, CallbackError>;

pub type BeforeAgentFn = Arc<dyn Fn(&CallbackContext) -> HookResult<String> + Send + Sync>;
/// Receives the agent's final text, if it produced one.
pub type AfterAgentFn =
    Arc<dyn Fn(&CallbackContext, Option<&str>) -> HookResult<String> + Send + Sync>;
pub type BeforeModelFn =
    Arc<dyn Fn(&CallbackContext, &mut ModelRequest) -> HookResult<ModelResponse> + Send + Sync>;
pub type AfterModelFn =
    Arc<dyn Fn(&CallbackContext, &mut ModelResponse) -> HookResult<ModelResponse> + Send + Sync>;
pub type BeforeToolFn =
    Arc<dyn Fn(&str, &mut Value, &ToolContext) -> HookResult<Value> + Send + Sync>;
/// Receives the tool name, the arguments it ran with and its current result.
pub type AfterToolFn =
    Arc<dyn Fn(&str, &Value, &ToolContext, &Value) -> HookResult<Value> + Send + Sync>;

/// What agent and model hooks can see: identity plus read/write state.
#[derive(Debug, Clone)]
pub struct CallbackContext {
    pub agent_name: String,
    pub invocation_id: String,
    /// The message that started this run.
    pub user_content: Vec<Content>,
    pub state: State,
}

impl CallbackContext {
    pub fn user_text(&self) -> Option<String> {
        crate::types::joined_text(&self.user_content)
    }
}

/// The six hook lists of one agent.
#[derive(Clone, Default)]
pub struct Callbacks {
    before_agent: Vec<BeforeAgentFn>,
    after_agent: Vec<AfterAgentFn>,
    before_model: Vec<BeforeModelFn>,
    after_model: Vec<AfterModelFn>,
    before_tool: Vec<BeforeToolFn>,
    after_tool: Vec<AfterToolFn>,
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("before_agent", &self.before_agent.len())
            .field("after_agent", &self.after_agent.len())
            .field("before_model", &self.before_model.len())
            .field("after_model", &self.after_model.len())
            .field("before_tool", &self.before_tool.len())
            .field("after_tool", &self.after_tool.len())
            .finish()
    }
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn before_agent(
        mut self,
        f: impl Fn(&CallbackContext) -> HookResult<String> + Send + Sync + 'static,
    ) -> Self {
        self.before_agent.push(Arc::new(f));
        self
    }

    pub fn after_agent(
        mut self,
        f: impl Fn(&CallbackContext, Option<&str>) -> HookResult<String> + Send + Sync + 'static,
    ) -> Self {
        self.after_agent.push(Arc::new(f));
        self
    }

    pub fn before_model(
        mut self,
        f: impl Fn(&CallbackContext, &mut ModelRequest) -> HookResult<ModelResponse>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.before_model.push(Arc::new(f));
        self
    }

    pub fn after_model(
        mut self,
        f: impl Fn(&CallbackContext, &mut ModelResponse) -> HookResult<ModelResponse>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.after_model.push(Arc::new(f));
        self
    }

    pub fn before_tool(
        mut self,
        f: impl Fn(&str, &mut Value, &ToolContext) -> HookResult<Value> + Send + Sync + 'static,
    ) -> Self {
        self.before_tool.push(Arc::new(f));
        self
    }

    pub fn after_tool(
        mut self,
        f: impl Fn(&str, &Value, &ToolContext, &Value) -> HookResult<Value> + Send + Sync + 'static,
    ) -> Self {
        self.after_tool.push(Arc::new(f));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.before_agent.is_empty()
            && self.after_agent.is_empty()
            && self.before_model.is_empty()
            && self.after_model.is_empty()
            && self.before_tool.is_empty()
            && self.after_tool.is_empty()
    }

    // -- runners ------------------------------------------------------------

    /// `Some(text)` when a hook asked to skip the agent.
    pub fn run_before_agent(&self, ctx: &CallbackContext) -> Result<Option<String>, CallbackError> {
        for hook in &self.before_agent {
            if let HookOutcome::Override(text) = hook(ctx)? {
                return Ok(Some(text));
            }
        }
        Ok(None)
    }

    /// `Some(text)` when any hook replaced the agent's output; the value is
    /// the last replacement.
    pub fn run_after_agent(
        &self,
        ctx: &CallbackContext,
        output: Option<&str>,
    ) -> Result<Option<String>, CallbackError> {
        let mut replaced: Option<String> = None;
        for hook in &self.after_agent {
            let current = replaced.as_deref().or(output);
            if let HookOutcome::Override(text) = hook(ctx, current)? {
                replaced = Some(text);
            }
        }
        Ok(replaced)
    }

    /// `Some(response)` when a hook answered in place of the model.
    pub fn run_before_model(
        &self,
        ctx: &CallbackContext,
        request: &mut ModelRequest,
    ) -> Result<Option<ModelResponse>, CallbackError> {
        for hook in &self.before_model {
            if let HookOutcome::Override(response) = hook(ctx, request)? {
                return Ok(Some(response));
            }
        }
        Ok(None)
    }

    pub fn run_after_model(
        &self,
        ctx: &CallbackContext,
        response: &mut ModelResponse,
    ) -> Result<(), CallbackError> {
        for hook in &self.after_model {
            if let HookOutcome::Override(replacement) = hook(ctx, response)? {
                *response = replacement;
            }
        }
        Ok(())
    }

    /// `Some(result)` when a hook answered in place of the tool.
    pub fn run_before_tool(
        &self,
        tool: &str,
        args: &mut Value,
        ctx: &ToolContext,
    ) -> Result<Option<Value>, CallbackError> {
        for hook in &self.before_tool {
            if let HookOutcome::Override(result) = hook(tool, args, ctx)? {
                return Ok(Some(result));
            }
        }
        Ok(None)
    }

    /// Final result after every after-tool hook has seen it.
    pub fn run_after_tool(
        &self,
        tool: &str,
        args: &Value,
        ctx: &ToolContext,
        result: Value,
    ) -> Result<Value, CallbackError> {
        let mut result = result;
        for hook in &self.after_tool {
            if let HookOutcome::Override(replacement) = hook(tool, args, ctx, &result)? {
                result = replacement;
            }
        }
        Ok(result)
    }
}
