use crate::types::*;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Events emitted while a model response streams in
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Stream started
    Start,
    /// Text content delta
    TextDelta { delta: String },
    /// Tool call started
    ToolCallStart { id: String, name: String },
    /// Stream completed successfully
    Done,
}

/// Tool definition sent to the model (schema only, no target)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// One model call: instruction plus conversation in.
///
/// before-model hooks receive this mutably, so anything they change here is
/// what the provider sees.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    /// Agent on whose behalf the call is made.
    pub agent_name: String,
    pub model: String,
    pub system_instruction: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Schema for a structured final answer, when the agent declares one.
    pub output_schema: Option<serde_json::Value>,
}

impl ModelRequest {
    pub fn new(agent_name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            model: model.into(),
            system_instruction: String::new(),
            messages: Vec::new(),
            tools: Vec::new(),
            temperature: None,
            max_tokens: None,
            output_schema: None,
        }
    }

    /// Text of the most recent user message, if any.
    pub fn last_user_text(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|m| matches!(m, Message::User { .. }))
            .and_then(Message::text)
    }
}

/// Generated text and/or tool-call requests out.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelResponse {
    pub content: Vec<Content>,
    pub stop_reason: StopReason,
    pub usage: Usage,
    pub model: String,
}

impl ModelResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![Content::text(text)],
            ..Default::default()
        }
    }

    pub fn joined_text(&self) -> Option<String> {
        joined_text(&self.content)
    }

    pub fn has_tool_calls(&self) -> bool {
        self.content
            .iter()
            .any(|c| matches!(c, Content::ToolCall { .. }))
    }
}

/// The core provider trait. Implement this for each model backend.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Generate a completion, sending stream events through the channel.
    /// Returns the complete response.
    async fn generate(
        &self,
        request: ModelRequest,
        tx: mpsc::UnboundedSender<StreamEvent>,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Result<ModelResponse, ProviderError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("API error: {0}")]
    Api(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Auth error: {0}")]
    Auth(String),
    #[error("Rate limited, retry after {retry_after_ms:?}ms")]
    RateLimited { retry_after_ms: Option<u64> },
    #[error("Cancelled")]
    Cancelled,
    #[error("{0}")]
    Other(String),
}
