use super::compose::{run_agent, Outcome};
use super::history::{build_messages, visible, ISOLATION_MARK};
use super::RunConfig;
use crate::agent::AgentSpec;
use crate::artifacts::ArtifactService;
use crate::callbacks::CallbackContext;
use crate::error::{ToolError, WeftError};
use crate::provider::ModelProvider;
use crate::session::{SessionKey, SharedState, State};
use crate::tools::{NestedRunner, ToolContext};
use crate::types::*;
use async_trait::async_trait;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// The run's single writer: every event goes through one lock, so the
/// history and the caller's stream see the same total order even when
/// parallel children emit at the same time.
#[derive(Clone)]
pub(crate) struct EventSink {
    history: Arc<Mutex<Vec<Event>>>,
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSink {
    pub fn new(history: Vec<Event>, tx: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            history: Arc::new(Mutex::new(history)),
            tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Event>> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append to history (unless partial) and stream to the caller.
    pub fn emit(&self, event: Event) {
        let mut history = self.lock();
        if !event.partial {
            history.push(event.clone());
        }
        // The caller may have dropped the stream; the run still finishes.
        let _ = self.tx.send(event);
    }

    /// Append to history without streaming.
    pub fn record(&self, event: Event) {
        self.lock().push(event);
    }

    pub fn history(&self) -> Vec<Event> {
        self.lock().clone()
    }

    /// Whether any event of `invocation_id` was final.
    pub fn has_final(&self, invocation_id: &str) -> bool {
        self.lock()
            .iter()
            .any(|e| e.invocation_id == invocation_id && e.is_final)
    }
}

/// Everything one agent activation needs. Cloned (cheaply) into children;
/// only `branch`, `scope` and `extra_input` differ between clones.
#[derive(Clone)]
pub(crate) struct Invocation {
    pub id: String,
    pub session: SessionKey,
    pub state: SharedState,
    pub user_content: Vec<Content>,
    pub provider: Arc<dyn ModelProvider>,
    pub artifacts: Option<Arc<dyn ArtifactService>>,
    pub config: Arc<RunConfig>,
    pub sink: EventSink,
    pub cancel: CancellationToken,
    pub llm_calls: Arc<AtomicUsize>,
    pub branch: Option<String>,
    /// Root of an isolated subtree (agents run as tools).
    pub scope: Option<String>,
    /// Messages appended after the visible history (merge inputs).
    pub extra_input: Vec<Message>,
}

impl Invocation {
    pub fn event(&self, author: &str) -> Event {
        Event::new(&self.id, author).with_branch(self.branch.clone())
    }

    /// A final error event carrying whatever state writes led up to it.
    pub fn error_event(&self, author: &str, err: &WeftError, state: &State) -> Event {
        let mut event = self
            .event(author)
            .with_error(err.kind(), err.to_string())
            .finalized();
        event.actions.state_delta = state.take_delta();
        event
    }

    pub fn callback_context(&self, agent: &AgentSpec) -> CallbackContext {
        CallbackContext {
            agent_name: agent.name.clone(),
            invocation_id: self.id.clone(),
            user_content: self.user_content.clone(),
            state: State::new(self.state.clone()),
        }
    }

    pub fn tool_context(&self, agent: &AgentSpec, tool_call_id: &str) -> ToolContext {
        let mut ctx = ToolContext::new(
            &agent.name,
            &self.id,
            tool_call_id,
            State::new(self.state.clone()),
        )
        .with_cancel(self.cancel.clone())
        .with_nested_runner(Arc::new(self.clone()));
        if let Some(artifacts) = &self.artifacts {
            ctx = ctx.with_artifacts(artifacts.clone(), self.session.clone());
        }
        ctx
    }

    /// The conversation `agent` sees from this branch.
    pub fn messages_for(&self, agent: &AgentSpec) -> Vec<Message> {
        let history = self.sink.history();
        let events: Vec<Event> = history
            .into_iter()
            .filter(|e| {
                visible(
                    e.branch.as_deref(),
                    self.branch.as_deref(),
                    self.scope.as_deref(),
                )
            })
            .collect();
        let mut messages = build_messages(&events, &agent.name);
        messages.extend(self.extra_input.iter().cloned());
        messages
    }

    /// A child invocation one branch level down.
    pub fn child(&self, segment: &str) -> Self {
        let mut child = self.clone();
        child.branch = Some(match &self.branch {
            Some(b) => format!("{}.{}", b, segment),
            None => segment.to_string(),
        });
        child.extra_input = Vec::new();
        child
    }
}

#[async_trait]
impl NestedRunner for Invocation {
    async fn run_nested(
        &self,
        agent: Arc<AgentSpec>,
        request: String,
        ctx: &ToolContext,
    ) -> Result<String, ToolError> {
        let subtree = format!("{}{}{}", agent.name, ISOLATION_MARK, ctx.tool_call_id);
        let mut nested = self.child(&subtree);
        nested.scope = nested.branch.clone();
        nested.sink.record(
            Event::new(&self.id, USER_AUTHOR)
                .with_branch(nested.branch.clone())
                .with_text(request),
        );
        match run_agent(agent.clone(), nested).await {
            Outcome::Completed { output } | Outcome::Escalated { output } => {
                Ok(output.unwrap_or_default())
            }
            Outcome::Paused => Err(ToolError::Failed(format!(
                "agent '{}' is waiting on a long-running tool",
                agent.name
            ))),
            Outcome::Failed => Err(ToolError::Failed(format!(
                "agent '{}' failed",
                agent.name
            ))),
        }
    }
}
