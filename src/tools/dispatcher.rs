//! Resolves a tool name and runs it between the before- and after-tool hooks.

use super::{expose_tools, validate_against_schema, ToolContext, ToolSpec, ToolTarget};
use crate::callbacks::Callbacks;
use crate::error::{ToolError, WeftError};
use crate::provider::ToolDefinition;
use serde_json::Value;
use tracing::debug;

/// The tools of one agent, under the names the model sees, plus that
/// agent's callbacks.
#[derive(Debug, Clone)]
pub struct ToolDispatcher {
    tools: Vec<ToolSpec>,
    callbacks: Callbacks,
}

impl ToolDispatcher {
    /// Names are sanitized and de-duplicated here, once.
    pub fn new(tools: &[ToolSpec], callbacks: Callbacks) -> Self {
        Self {
            tools: expose_tools(tools),
            callbacks,
        }
    }

    pub fn tools(&self) -> &[ToolSpec] {
        &self.tools
    }

    pub fn declarations(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(ToolSpec::definition).collect()
    }

    pub fn find(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub async fn invoke_by_name(
        &self,
        name: &str,
        args: Value,
        ctx: &ToolContext,
    ) -> Result<Value, WeftError> {
        let tool = self
            .find(name)
            .ok_or_else(|| WeftError::not_found("tool", name))?;
        self.invoke(tool, args, ctx).await
    }

    /// Validate, run before-tool hooks, run the target unless a hook
    /// answered for it, then run after-tool hooks on the result.
    pub async fn invoke(
        &self,
        tool: &ToolSpec,
        args: Value,
        ctx: &ToolContext,
    ) -> Result<Value, WeftError> {
        validate_against_schema(&tool.parameters, &args).map_err(|reason| {
            WeftError::ArgumentValidation {
                target: tool.name.clone(),
                reason,
            }
        })?;

        let mut args = args;
        let original = args.clone();
        let result = match self.callbacks.run_before_tool(&tool.name, &mut args, ctx)? {
            Some(result) => {
                debug!(tool = %tool.name, "before-tool hook answered, body skipped");
                result
            }
            None => {
                if args != original {
                    validate_against_schema(&tool.parameters, &args).map_err(|reason| {
                        WeftError::ArgumentValidation {
                            target: tool.name.clone(),
                            reason: format!("after before-tool hook: {}", reason),
                        }
                    })?;
                }
                run_target(tool, args.clone(), ctx)
                    .await
                    .map_err(|e| classify(&tool.name, e))?
            }
        };

        Ok(self
            .callbacks
            .run_after_tool(&tool.name, &args, ctx, result)?)
    }
}

async fn run_target(tool: &ToolSpec, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
    if ctx.cancel.is_cancelled() {
        return Err(ToolError::Cancelled);
    }
    debug!(tool = %tool.name, target = ?tool.target, "invoking tool");
    let call = async {
        match &tool.target {
            ToolTarget::Local(body) => body(args, ctx.clone()).await,
            ToolTarget::Delegate(agent) => {
                let request = match args.get("request").and_then(Value::as_str) {
                    Some(text) => text.to_string(),
                    None => args.to_string(),
                };
                let runner = ctx.nested_runner().ok_or_else(|| {
                    ToolError::Failed(format!(
                        "agent tool '{}' needs a running invocation",
                        agent.name
                    ))
                })?;
                runner
                    .run_nested(agent.clone(), request, ctx)
                    .await
                    .map(Value::String)
            }
            ToolTarget::Remote(remote) => remote.call(args, ctx).await,
        }
    };
    tokio::select! {
        result = call => result,
        _ = ctx.cancel.cancelled() => Err(ToolError::Cancelled),
    }
}

fn classify(tool: &str, err: ToolError) -> WeftError {
    match err {
        ToolError::UnknownAgent(name) => WeftError::Delegation(name),
        ToolError::InvalidArgs(reason) => WeftError::ArgumentValidation {
            target: tool.to_string(),
            reason,
        },
        source => WeftError::ToolExecution {
            tool: tool.to_string(),
            source,
        },
    }
}
