//! The model-driven agent: call the model, run the tools it asks for, feed
//! the results back, until it answers in plain text.

use super::compose::{run_agent, Outcome};
use super::history::render_instruction;
use super::invocation::Invocation;
use super::ErrorPolicy;
use crate::agent::AgentSpec;
use crate::callbacks::CallbackContext;
use crate::error::WeftError;
use crate::provider::{ModelRequest, ModelResponse, ProviderError, StreamEvent};
use crate::retry::with_retry;
use crate::tools::{transfer_to_agent, validate_against_schema, ToolDispatcher};
use crate::types::*;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub(crate) async fn run_llm(agent: &AgentSpec, inv: &Invocation) -> Outcome {
    let mut tools = agent.tools.clone();
    if !agent.sub_agents.is_empty() {
        tools.push(transfer_to_agent(
            agent.sub_agents.iter().map(|a| a.name.clone()).collect(),
        ));
    }
    let dispatcher = ToolDispatcher::new(&tools, agent.callbacks.clone());
    let mut last_text: Option<String> = None;

    loop {
        if inv.cancel.is_cancelled() {
            debug!(agent = %agent.name, "cancelled before model call");
            return Outcome::Failed;
        }
        let ctx = inv.callback_context(agent);

        let instruction = match build_instruction(agent, &ctx) {
            Ok(instruction) => instruction,
            Err(e) => return fail(inv, agent, &ctx, e),
        };
        let mut request = ModelRequest::new(&agent.name, model_name(agent, inv));
        request.system_instruction = instruction;
        request.messages = inv.messages_for(agent);
        request.tools = dispatcher.declarations();
        request.temperature = agent.temperature;
        request.max_tokens = agent.max_tokens;
        request.output_schema = agent.output_schema.clone();

        let answered = match agent.callbacks.run_before_model(&ctx, &mut request) {
            Ok(answered) => answered,
            Err(e) => return fail(inv, agent, &ctx, e.into()),
        };
        let mut response = match answered {
            Some(response) => {
                debug!(agent = %agent.name, "before-model hook answered, model skipped");
                response
            }
            None => {
                let calls = inv.llm_calls.fetch_add(1, Ordering::SeqCst) + 1;
                if calls > inv.config.max_llm_calls {
                    let err = WeftError::LimitExceeded(format!(
                        "more than {} model calls in one run",
                        inv.config.max_llm_calls
                    ));
                    return fail(inv, agent, &ctx, err);
                }
                match call_model(agent, inv, request).await {
                    Ok(response) => response,
                    Err(ProviderError::Cancelled) => return Outcome::Failed,
                    Err(e) => {
                        warn!(agent = %agent.name, error = %e, "model call failed");
                        return fail(inv, agent, &ctx, e.into());
                    }
                }
            }
        };
        if let Err(e) = agent.callbacks.run_after_model(&ctx, &mut response) {
            return fail(inv, agent, &ctx, e.into());
        }

        let text = response.joined_text();
        if text.is_some() {
            last_text = text.clone();
        }
        let calls: Vec<(String, String, Value)> = response
            .content
            .iter()
            .filter_map(|c| match c {
                Content::ToolCall {
                    id,
                    name,
                    arguments,
                } => Some((id.clone(), name.clone(), arguments.clone())),
                _ => None,
            })
            .collect();

        let mut rejected = None;
        if calls.is_empty() {
            let output = match &agent.output_schema {
                Some(schema) => match parse_structured(schema, text.as_deref()) {
                    Ok(value) => Some(value),
                    Err(reason) => {
                        rejected = Some(WeftError::ArgumentValidation {
                            target: agent.name.clone(),
                            reason,
                        });
                        None
                    }
                },
                None => text.clone().map(Value::String),
            };
            if let (Some(key), Some(output)) = (&agent.output_key, output) {
                ctx.state.set(key.clone(), output);
            }
        }
        let mut event = inv.event(&agent.name).with_content(response.content);
        event.usage = Some(response.usage);
        event.actions.state_delta = ctx.state.take_delta();
        event.is_final = calls.is_empty() && rejected.is_none();
        inv.sink.emit(event);

        if let Some(err) = rejected {
            return fail(inv, agent, &ctx, err);
        }
        if calls.is_empty() {
            return Outcome::Completed { output: text };
        }

        let step = run_tools(agent, inv, &dispatcher, calls).await;
        let actions = step.actions.clone();
        let halt = step.error.as_ref().is_some_and(|e| {
            inv.config.error_policy == ErrorPolicy::Halt
                || matches!(e.kind(), ErrorKind::Dependency | ErrorKind::LimitExceeded)
        });
        let paused = !step.long_running.is_empty();

        let mut event = inv.event(&agent.name).with_content(step.responses);
        event.actions = step.actions;
        event.long_running_tool_ids = step.long_running;
        if let Some(err) = &step.error {
            event.error = Some(EventError {
                kind: err.kind(),
                message: err.to_string(),
            });
        }
        event.is_final = halt || actions.escalate || paused;
        inv.sink.emit(event);

        if halt {
            return Outcome::Failed;
        }
        if let Some(target) = &actions.transfer_to_agent {
            let Some(next) = agent.sub_agents.iter().find(|a| &a.name == target) else {
                let err = WeftError::Delegation(target.clone());
                return fail(inv, agent, &ctx, err);
            };
            debug!(from = %agent.name, to = %next.name, "transferring");
            return run_agent(next.clone(), inv.clone()).await;
        }
        if actions.escalate {
            return Outcome::Escalated { output: last_text };
        }
        if paused {
            debug!(agent = %agent.name, "waiting on long-running tool");
            return Outcome::Paused;
        }
    }
}

/// Rendered instruction plus, for agents with sub-agents, who they can
/// hand the conversation to.
fn build_instruction(agent: &AgentSpec, ctx: &CallbackContext) -> Result<String, WeftError> {
    let mut instruction = render_instruction(&agent.instruction, &ctx.state.to_map())
        .map_err(|key| WeftError::not_found("instruction placeholder", key))?;
    if !agent.sub_agents.is_empty() {
        instruction.push_str(
            "\n\nYou can hand the conversation to one of these agents with the \
             `transfer_to_agent` tool when it is better suited to answer:",
        );
        for sub in &agent.sub_agents {
            instruction.push_str(&format!("\n- {}: {}", sub.name, sub.description));
        }
    }
    Ok(instruction)
}

/// A structured final answer: JSON, optionally inside a fenced block, that
/// satisfies `schema`.
fn parse_structured(schema: &Value, text: Option<&str>) -> Result<Value, String> {
    let raw = text.unwrap_or_default().trim();
    let raw = raw
        .strip_prefix("```json")
        .or_else(|| raw.strip_prefix("```"))
        .and_then(|body| body.strip_suffix("```"))
        .map_or(raw, str::trim);
    let value: Value =
        serde_json::from_str(raw).map_err(|e| format!("output is not JSON: {}", e))?;
    validate_against_schema(schema, &value)
        .map_err(|e| format!("output does not match schema: {}", e))?;
    Ok(value)
}

fn model_name(agent: &AgentSpec, inv: &Invocation) -> String {
    if agent.model.is_empty() {
        inv.config.default_model.clone()
    } else {
        agent.model.clone()
    }
}

/// One provider call with retries. In streaming mode text deltas are
/// forwarded as partial events while the call runs.
///
/// Once an attempt has forwarded a partial event the call is no longer
/// retried: the caller already holds that text, and a second attempt would
/// stream it again.
async fn call_model(
    agent: &AgentSpec,
    inv: &Invocation,
    request: ModelRequest,
) -> Result<ModelResponse, ProviderError> {
    let streamed = AtomicBool::new(false);
    with_retry(&inv.config.retry, &inv.cancel, || {
        let request = request.clone();
        let streamed = &streamed;
        async move {
            let (tx, rx) = mpsc::unbounded_channel();
            let generate = inv.provider.generate(request, tx, inv.cancel.clone());
            let (result, ()) = tokio::join!(generate, forward_deltas(agent, inv, rx, streamed));
            match result {
                Err(e) if e.is_retryable() && streamed.load(Ordering::SeqCst) => {
                    warn!(agent = %agent.name, error = %e, "stream broke after partial output");
                    Err(ProviderError::Other(format!(
                        "stream interrupted after partial output: {}",
                        e
                    )))
                }
                other => other,
            }
        }
    })
    .await
}

async fn forward_deltas(
    agent: &AgentSpec,
    inv: &Invocation,
    mut rx: mpsc::UnboundedReceiver<StreamEvent>,
    streamed: &AtomicBool,
) {
    while let Some(event) = rx.recv().await {
        if !inv.config.streaming {
            continue;
        }
        if let StreamEvent::TextDelta { delta } = event {
            let mut partial = inv.event(&agent.name).with_text(delta);
            partial.partial = true;
            inv.sink.emit(partial);
            streamed.store(true, Ordering::SeqCst);
        }
    }
}

struct ToolStep {
    responses: Vec<Content>,
    actions: EventActions,
    long_running: Vec<String>,
    /// First failure among the calls.
    error: Option<WeftError>,
}

/// Run the requested calls in order. Every call gets a response part, so
/// the model sees a result (or an error) for each id it issued.
async fn run_tools(
    agent: &AgentSpec,
    inv: &Invocation,
    dispatcher: &ToolDispatcher,
    calls: Vec<(String, String, Value)>,
) -> ToolStep {
    let mut step = ToolStep {
        responses: Vec::with_capacity(calls.len()),
        actions: EventActions::default(),
        long_running: Vec::new(),
        error: None,
    };
    for (id, name, arguments) in calls {
        let ctx = inv.tool_context(agent, &id);
        let result = dispatcher.invoke_by_name(&name, arguments, &ctx).await;
        step.actions.merge(ctx.take_actions());
        match result {
            Ok(response) => {
                if dispatcher.find(&name).is_some_and(|t| t.long_running) {
                    step.long_running.push(id.clone());
                }
                step.responses.push(Content::ToolResponse {
                    id,
                    name,
                    response,
                    is_error: false,
                });
            }
            Err(e) => {
                debug!(agent = %agent.name, tool = %name, error = %e, "tool call failed");
                step.responses.push(Content::ToolResponse {
                    id,
                    name,
                    response: json!({"error": e.to_string()}),
                    is_error: true,
                });
                if step.error.is_none() {
                    step.error = Some(e);
                }
            }
        }
    }
    step
}

/// Emit a final error event for `agent` and stop.
fn fail(inv: &Invocation, agent: &AgentSpec, ctx: &CallbackContext, err: WeftError) -> Outcome {
    debug!(agent = %agent.name, kind = %err.kind(), error = %err, "agent failed");
    inv.sink.emit(inv.error_event(&agent.name, &err, &ctx.state));
    Outcome::Failed
}
