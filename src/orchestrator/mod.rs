//! Running an agent tree against a session.
//!
//! [`Runner::run`] loads (or creates) the session, records the caller's
//! message and drives the root agent on a spawned task. Events come back
//! through an [`EventStream`] in the order they were appended to the
//! session history; when the root agent is done the session is saved and
//! the stream ends.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use weft::{AgentSpec, MockProvider, RunConfig, Runner};
//!
//! # async fn demo() -> Result<(), weft::WeftError> {
//! let agent = Arc::new(AgentSpec::llm("greeter").with_instruction("Say hi."));
//! let runner = Runner::new(
//!     RunConfig::new("docs"),
//!     agent,
//!     Arc::new(MockProvider::text("hi")),
//! );
//! let events = runner.run_text("dev_user_01", "s1", "hello").await?.collect_all().await;
//! assert!(events.last().is_some_and(|e| e.is_final));
//! # Ok(())
//! # }
//! ```

mod compose;
mod history;
mod invocation;
mod llm;

use crate::agent::AgentSpec;
use crate::artifacts::ArtifactService;
use crate::error::WeftError;
use crate::provider::ModelProvider;
use crate::registry::AgentRegistry;
use crate::retry::RetryConfig;
use crate::session::{InMemorySessionService, SessionKey, SessionService, SharedState};
use crate::types::*;
use compose::{run_agent, Outcome};
use futures::Stream;
use invocation::{EventSink, Invocation};
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

/// What happens when a tool call fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Stop at the first failing tool call.
    #[default]
    Halt,
    /// Hand the failure back to the model as an error tool response.
    ReportToModel,
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub app_name: String,
    /// Used by agents that leave `model` empty.
    pub default_model: String,
    /// Upper bound on provider calls in one run.
    pub max_llm_calls: usize,
    pub error_policy: ErrorPolicy,
    /// Forward provider text deltas as partial events.
    pub streaming: bool,
    pub retry: RetryConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            app_name: "weft".into(),
            default_model: String::new(),
            max_llm_calls: 50,
            error_policy: ErrorPolicy::default(),
            streaming: false,
            retry: RetryConfig::default(),
        }
    }
}

impl RunConfig {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            ..Default::default()
        }
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    pub fn with_max_llm_calls(mut self, max: usize) -> Self {
        self.max_llm_calls = max;
        self
    }

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

/// Drives one agent tree for any number of sessions.
pub struct Runner {
    config: Arc<RunConfig>,
    root: Arc<AgentSpec>,
    provider: Arc<dyn ModelProvider>,
    sessions: Arc<dyn SessionService>,
    artifacts: Option<Arc<dyn ArtifactService>>,
    busy: Arc<Mutex<HashSet<SessionKey>>>,
}

impl Runner {
    /// A runner backed by an [`InMemorySessionService`].
    pub fn new(config: RunConfig, root: Arc<AgentSpec>, provider: Arc<dyn ModelProvider>) -> Self {
        Self {
            config: Arc::new(config),
            root,
            provider,
            sessions: Arc::new(InMemorySessionService::new()),
            artifacts: None,
            busy: Arc::default(),
        }
    }

    /// A runner whose root is looked up by name.
    pub fn from_registry(
        config: RunConfig,
        registry: &AgentRegistry,
        root: &str,
        provider: Arc<dyn ModelProvider>,
    ) -> Result<Self, WeftError> {
        Ok(Self::new(config, registry.resolve(root)?, provider))
    }

    pub fn with_session_service(mut self, sessions: Arc<dyn SessionService>) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn with_artifact_service(mut self, artifacts: Arc<dyn ArtifactService>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn session_service(&self) -> &Arc<dyn SessionService> {
        &self.sessions
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Start a run with `message` as the caller's turn.
    ///
    /// Fails up front only when the session cannot be loaded or already has
    /// a run in flight; everything that goes wrong later is reported as an
    /// error event on the stream. Dropping the stream cancels the run.
    pub async fn run(
        &self,
        user: &str,
        session: &str,
        message: Vec<Content>,
    ) -> Result<EventStream, WeftError> {
        let key = SessionKey::new(&self.config.app_name, user, session);
        let guard = BusyGuard::acquire(&self.busy, &key)?;
        let mut stored = self.sessions.get_or_create(&key).await?;

        let invocation_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(std::mem::take(&mut stored.events), tx);
        sink.record(Event::new(&invocation_id, USER_AUTHOR).with_content(message.clone()));

        let cancel = CancellationToken::new();
        let inv = Invocation {
            id: invocation_id,
            session: key,
            state: SharedState::new(std::mem::take(&mut stored.state)),
            user_content: message,
            provider: self.provider.clone(),
            artifacts: self.artifacts.clone(),
            config: self.config.clone(),
            sink,
            cancel: cancel.clone(),
            llm_calls: Arc::new(AtomicUsize::new(0)),
            branch: None,
            scope: None,
            extra_input: Vec::new(),
        };
        debug!(invocation = %inv.id, root = %self.root.name, "run start");

        let root = self.root.clone();
        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            let outcome = run_agent(root, inv.clone()).await;
            debug!(invocation = %inv.id, ?outcome, "run finished");

            if !inv.sink.has_final(&inv.id) {
                let mut last = inv.event(SYSTEM_AUTHOR).finalized();
                if outcome == Outcome::Failed && inv.cancel.is_cancelled() {
                    last = last.with_error(ErrorKind::Dependency, "run cancelled");
                }
                inv.sink.emit(last);
            }

            stored.events = inv.sink.history();
            stored.state = inv.state.snapshot();
            if let Err(e) = sessions.save(&stored).await {
                warn!(invocation = %inv.id, error = %e, "failed to save session");
                inv.sink.emit(
                    inv.event(SYSTEM_AUTHOR)
                        .with_error(e.kind(), e.to_string())
                        .finalized(),
                );
            }
            // The session is free again before the stream ends.
            drop(guard);
            drop(inv);
        });

        Ok(EventStream {
            inner: UnboundedReceiverStream::new(rx),
            _cancel: cancel.drop_guard(),
        })
    }

    /// [`run`](Self::run) with a plain text message.
    pub async fn run_text(
        &self,
        user: &str,
        session: &str,
        text: impl Into<String>,
    ) -> Result<EventStream, WeftError> {
        self.run(user, session, vec![Content::text(text)]).await
    }
}

/// Marks a session as running for as long as it lives.
struct BusyGuard {
    busy: Arc<Mutex<HashSet<SessionKey>>>,
    key: SessionKey,
}

impl BusyGuard {
    fn acquire(
        busy: &Arc<Mutex<HashSet<SessionKey>>>,
        key: &SessionKey,
    ) -> Result<Self, WeftError> {
        let mut running = busy.lock().unwrap_or_else(PoisonError::into_inner);
        if !running.insert(key.clone()) {
            return Err(WeftError::LimitExceeded(format!(
                "session '{}' already has a run in progress",
                key.session
            )));
        }
        Ok(Self {
            busy: busy.clone(),
            key: key.clone(),
        })
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.busy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// The events of one run, in history order. Finite: it ends once the run
/// has been saved.
pub struct EventStream {
    inner: UnboundedReceiverStream<Event>,
    _cancel: DropGuard,
}

impl EventStream {
    /// Drain the whole run.
    pub async fn collect_all(self) -> Vec<Event> {
        futures::StreamExt::collect(self).await
    }
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}
