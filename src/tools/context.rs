use crate::agent::AgentSpec;
use crate::artifacts::{Artifact, ArtifactService};
use crate::error::ToolError;
use crate::session::{SessionKey, State};
use crate::types::EventActions;
use async_trait::async_trait;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;

/// Runs an agent exposed as a tool. Implemented by the orchestrator so the
/// dispatcher does not need to know how agents are driven.
#[async_trait]
pub trait NestedRunner: Send + Sync {
    /// Run `agent` on `request` and return its final text.
    async fn run_nested(
        &self,
        agent: Arc<AgentSpec>,
        request: String,
        ctx: &ToolContext,
    ) -> Result<String, ToolError>;
}

/// Everything a tool body or tool hook can reach during one call.
#[derive(Clone)]
pub struct ToolContext {
    pub agent_name: String,
    pub invocation_id: String,
    pub tool_call_id: String,
    pub state: State,
    pub cancel: CancellationToken,
    actions: Arc<Mutex<EventActions>>,
    artifacts: Option<(Arc<dyn ArtifactService>, SessionKey)>,
    nested: Option<Arc<dyn NestedRunner>>,
}

impl fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolContext")
            .field("agent_name", &self.agent_name)
            .field("invocation_id", &self.invocation_id)
            .field("tool_call_id", &self.tool_call_id)
            .field("has_artifacts", &self.artifacts.is_some())
            .finish_non_exhaustive()
    }
}

impl ToolContext {
    pub fn new(
        agent_name: impl Into<String>,
        invocation_id: impl Into<String>,
        tool_call_id: impl Into<String>,
        state: State,
    ) -> Self {
        Self {
            agent_name: agent_name.into(),
            invocation_id: invocation_id.into(),
            tool_call_id: tool_call_id.into(),
            state,
            cancel: CancellationToken::new(),
            actions: Arc::new(Mutex::new(EventActions::default())),
            artifacts: None,
            nested: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_artifacts(mut self, service: Arc<dyn ArtifactService>, key: SessionKey) -> Self {
        self.artifacts = Some((service, key));
        self
    }

    pub fn with_nested_runner(mut self, runner: Arc<dyn NestedRunner>) -> Self {
        self.nested = Some(runner);
        self
    }

    pub(crate) fn nested_runner(&self) -> Option<&Arc<dyn NestedRunner>> {
        self.nested.as_ref()
    }

    fn with_actions<R>(&self, f: impl FnOnce(&mut EventActions) -> R) -> R {
        f(&mut self.actions.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Ask the enclosing loop or composition to stop.
    pub fn escalate(&self) {
        self.with_actions(|a| a.escalate = true);
    }

    /// Hand the rest of the turn to `agent`.
    pub fn transfer_to(&self, agent: impl Into<String>) {
        let agent = agent.into();
        self.with_actions(|a| a.transfer_to_agent = Some(agent));
    }

    /// Record that a credential is expected under `state_key`.
    pub fn request_auth(&self, state_key: impl Into<String>) {
        let key = state_key.into();
        self.with_actions(|a| a.requested_auth = Some(key));
    }

    /// Drain the actions requested so far, with the state writes made
    /// through `self.state` folded in.
    pub fn take_actions(&self) -> EventActions {
        let mut actions = self.with_actions(std::mem::take);
        actions.state_delta.extend(self.state.take_delta());
        actions
    }

    fn artifact_service(&self) -> Result<&(Arc<dyn ArtifactService>, SessionKey), ToolError> {
        self.artifacts
            .as_ref()
            .ok_or_else(|| ToolError::Failed("no artifact service configured".into()))
    }

    pub async fn save_artifact(
        &self,
        filename: &str,
        artifact: Artifact,
    ) -> Result<u64, ToolError> {
        let (service, key) = self.artifact_service()?;
        let version = service
            .save(key, filename, artifact)
            .await
            .map_err(|e| ToolError::Failed(e.to_string()))?;
        self.with_actions(|a| a.artifact_delta.insert(filename.to_string(), version));
        Ok(version)
    }

    pub async fn load_artifact(
        &self,
        filename: &str,
        version: Option<u64>,
    ) -> Result<Option<Artifact>, ToolError> {
        let (service, key) = self.artifact_service()?;
        service
            .load(key, filename, version)
            .await
            .map_err(|e| ToolError::Failed(e.to_string()))
    }

    pub async fn list_artifacts(&self) -> Result<Vec<String>, ToolError> {
        let (service, key) = self.artifact_service()?;
        service
            .list(key)
            .await
            .map_err(|e| ToolError::Failed(e.to_string()))
    }
}
