//! Driving one agent activation: hooks around it and the composition
//! topologies (sequential, parallel, loop).

use super::invocation::Invocation;
use super::llm::run_llm;
use crate::agent::{AgentKind, AgentSpec, CompletionSignal};
use crate::error::WeftError;
use crate::session::State;
use crate::types::*;
use futures::future::{join_all, BoxFuture};
use std::sync::Arc;
use tracing::{debug, info};

/// How an agent activation ended.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Outcome {
    Completed { output: Option<String> },
    /// Asked the enclosing composition to stop.
    Escalated { output: Option<String> },
    /// An error event has been emitted; nothing after this runs.
    Failed,
    /// Waiting on a long-running tool; the caller resumes with a new message.
    Paused,
}

impl Outcome {
    pub fn output(&self) -> Option<&str> {
        match self {
            Self::Completed { output } | Self::Escalated { output } => output.as_deref(),
            Self::Failed | Self::Paused => None,
        }
    }

    fn replace_output(self, text: String) -> Self {
        match self {
            Self::Escalated { .. } => Self::Escalated { output: Some(text) },
            _ => Self::Completed { output: Some(text) },
        }
    }
}

/// Run `agent` with its before/after-agent hooks. Boxed because agents
/// nest: compositions, transfers and agent tools all come back here.
pub(crate) fn run_agent(agent: Arc<AgentSpec>, inv: Invocation) -> BoxFuture<'static, Outcome> {
    Box::pin(async move {
        debug!(agent = %agent.name, branch = ?inv.branch, "agent start");
        let ctx = inv.callback_context(&agent);

        match agent.callbacks.run_before_agent(&ctx) {
            Err(e) => {
                inv.sink
                    .emit(inv.error_event(&agent.name, &WeftError::from(e), &ctx.state));
                return Outcome::Failed;
            }
            Ok(Some(text)) => {
                debug!(agent = %agent.name, "before-agent hook answered, agent skipped");
                emit_replacement(&agent, &inv, &ctx.state, &text);
                return Outcome::Completed { output: Some(text) };
            }
            Ok(None) => emit_state_only(&agent, &inv, &ctx.state),
        }

        let outcome = match &agent.kind {
            AgentKind::Llm => run_llm(&agent, &inv).await,
            AgentKind::Sequential => run_sequential(&agent, &inv).await,
            AgentKind::Parallel { merge } => run_parallel(&agent, merge.clone(), &inv).await,
            AgentKind::Loop {
                max_iterations,
                completion,
            } => run_loop(&agent, *max_iterations, completion.as_ref(), &inv).await,
        };
        if matches!(outcome, Outcome::Failed | Outcome::Paused) {
            return outcome;
        }

        match agent.callbacks.run_after_agent(&ctx, outcome.output()) {
            Err(e) => {
                inv.sink
                    .emit(inv.error_event(&agent.name, &WeftError::from(e), &ctx.state));
                Outcome::Failed
            }
            Ok(Some(text)) => {
                emit_replacement(&agent, &inv, &ctx.state, &text);
                outcome.replace_output(text)
            }
            Ok(None) => {
                // Model-driven agents store their output as they produce it.
                if !agent.is_llm() {
                    if let (Some(key), Some(text)) = (&agent.output_key, outcome.output()) {
                        ctx.state.set(key.clone(), text);
                    }
                }
                emit_state_only(&agent, &inv, &ctx.state);
                outcome
            }
        }
    })
}

/// A final event standing in for (or replacing) the agent's own output.
fn emit_replacement(agent: &AgentSpec, inv: &Invocation, state: &State, text: &str) {
    if let Some(key) = &agent.output_key {
        state.set(key.clone(), text);
    }
    let mut event = inv.event(&agent.name).with_text(text).finalized();
    event.actions.state_delta = state.take_delta();
    inv.sink.emit(event);
}

/// Hooks that only touched state still leave a trace in the history.
fn emit_state_only(agent: &AgentSpec, inv: &Invocation, state: &State) {
    let delta = state.take_delta();
    if delta.is_empty() {
        return;
    }
    let mut event = inv.event(&agent.name);
    event.actions.state_delta = delta;
    inv.sink.emit(event);
}

/// Children in order; any outcome other than `Completed` stops the sequence
/// and is handed to the parent.
async fn run_sequential(agent: &AgentSpec, inv: &Invocation) -> Outcome {
    let mut last = None;
    for child in &agent.sub_agents {
        match run_agent(child.clone(), inv.clone()).await {
            Outcome::Completed { output } => last = output.or(last),
            halted => {
                debug!(sequence = %agent.name, child = %child.name, ?halted, "sequence halted");
                return halted;
            }
        }
    }
    Outcome::Completed { output: last }
}

/// Children concurrently, each on its own branch, then the merge agent.
///
/// Each child's output is taken from its single outcome, so it reaches the
/// merge step exactly once whatever the child emitted along the way.
async fn run_parallel(
    agent: &AgentSpec,
    merge: Option<Arc<AgentSpec>>,
    inv: &Invocation,
) -> Outcome {
    let fan_out = inv.child(&agent.name);
    let outcomes = join_all(
        agent
            .sub_agents
            .iter()
            .map(|child| run_agent(child.clone(), fan_out.child(&child.name))),
    )
    .await;

    if outcomes.iter().any(|o| *o == Outcome::Failed) {
        return Outcome::Failed;
    }
    // A paused child has no output yet; the merge waits for the resume.
    if outcomes.iter().any(|o| *o == Outcome::Paused) {
        debug!(parallel = %agent.name, "parallel child paused, merge deferred");
        return Outcome::Paused;
    }
    let escalated = outcomes
        .iter()
        .any(|o| matches!(o, Outcome::Escalated { .. }));

    let collected: Vec<(&str, &str)> = agent
        .sub_agents
        .iter()
        .zip(&outcomes)
        .filter_map(|(child, outcome)| outcome.output().map(|text| (child.name.as_str(), text)))
        .collect();
    debug!(parallel = %agent.name, outputs = collected.len(), "parallel children done");

    let Some(merge) = merge else {
        let output = (!collected.is_empty()).then(|| render_outputs(&collected));
        return if escalated {
            Outcome::Escalated { output }
        } else {
            Outcome::Completed { output }
        };
    };

    // The merge agent sits on the fan-out branch: it sees the conversation
    // up to the fan-out, not the children's own turns, plus their outputs.
    let mut merge_inv = fan_out;
    merge_inv.extra_input = vec![Message::user(render_outputs(&collected))];
    match run_agent(merge, merge_inv).await {
        Outcome::Completed { output } if escalated => Outcome::Escalated { output },
        other => other,
    }
}

fn render_outputs(outputs: &[(&str, &str)]) -> String {
    let mut text = String::from("Outputs from parallel agents:");
    for (name, output) in outputs {
        text.push_str(&format!("\n\n[{}] said: {}", name, output));
    }
    text
}

/// Children in order, repeatedly. Always finishes with a final event of
/// its own whose `escalate` tells converged apart from exhausted.
async fn run_loop(
    agent: &AgentSpec,
    max_iterations: Option<usize>,
    completion: Option<&CompletionSignal>,
    inv: &Invocation,
) -> Outcome {
    let mut iterations = 0;
    let mut converged = false;
    let mut last = None;

    'iterations: while max_iterations.map_or(true, |max| iterations < max) {
        iterations += 1;
        for child in &agent.sub_agents {
            if inv.cancel.is_cancelled() {
                return Outcome::Failed;
            }
            match run_agent(child.clone(), inv.clone()).await {
                Outcome::Escalated { output } => {
                    last = output.or(last);
                    converged = true;
                    break 'iterations;
                }
                Outcome::Completed { output } => {
                    let signalled = completion.is_some_and(|signal| {
                        signal.agent == child.name
                            && output.as_deref().is_some_and(|t| t.contains(&signal.phrase))
                    });
                    last = output.or(last);
                    if signalled {
                        converged = true;
                        break 'iterations;
                    }
                }
                halted => return halted,
            }
        }
        if agent.sub_agents.is_empty() {
            break;
        }
    }

    info!(
        loop_agent = %agent.name,
        iterations,
        converged,
        "loop finished"
    );
    let mut event = inv.event(&agent.name).finalized();
    event.actions.escalate = converged;
    inv.sink.emit(event);
    Outcome::Completed { output: last }
}
