//! Mock provider for testing. No real API calls.

use super::traits::*;
use crate::types::*;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

/// A mock response: plain text, tool calls, or a provider failure
#[derive(Debug, Clone)]
pub enum MockResponse {
    Text(String),
    ToolCalls(Vec<MockToolCall>),
    Error(String),
}

impl MockResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    /// A single tool call.
    pub fn call(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self::ToolCalls(vec![MockToolCall::new(name, arguments)])
    }
}

#[derive(Debug, Clone)]
pub struct MockToolCall {
    pub name: String,
    pub arguments: serde_json::Value,
}

impl MockToolCall {
    pub fn new(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }
}

type ResponderFn = Arc<dyn Fn(&ModelRequest) -> MockResponse + Send + Sync>;

enum Script {
    Queue(Mutex<Vec<MockResponse>>),
    Responder(ResponderFn),
}

/// Mock model provider for tests. Supply a sequence of responses, or a
/// function that picks a response from the request.
pub struct MockProvider {
    script: Script,
    latency: Option<Duration>,
    requests: Mutex<Vec<ModelRequest>>,
    call_ids: AtomicUsize,
}

impl MockProvider {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self::with_script(Script::Queue(Mutex::new(responses)))
    }

    /// Convenience: provider that returns the same text once
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(vec![MockResponse::Text(text.into())])
    }

    /// Convenience: sequence of text responses
    pub fn texts(texts: Vec<impl Into<String>>) -> Self {
        Self::new(
            texts
                .into_iter()
                .map(|t| MockResponse::Text(t.into()))
                .collect(),
        )
    }

    /// Request-dependent replies, e.g. keyed on `request.agent_name`.
    pub fn from_fn(f: impl Fn(&ModelRequest) -> MockResponse + Send + Sync + 'static) -> Self {
        Self::with_script(Script::Responder(Arc::new(f)))
    }

    fn with_script(script: Script) -> Self {
        Self {
            script,
            latency: None,
            requests: Mutex::new(Vec::new()),
            call_ids: AtomicUsize::new(0),
        }
    }

    /// Sleep before answering, so concurrent callers overlap in time.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Every request received so far, in arrival order.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn next_response(&self, request: &ModelRequest) -> MockResponse {
        match &self.script {
            Script::Queue(queue) => {
                let mut responses = queue.lock().unwrap_or_else(PoisonError::into_inner);
                if responses.is_empty() {
                    MockResponse::Text("(no more mock responses)".into())
                } else {
                    responses.remove(0)
                }
            }
            Script::Responder(f) => f(request),
        }
    }
}

#[async_trait]
impl ModelProvider for MockProvider {
    async fn generate(
        &self,
        request: ModelRequest,
        tx: mpsc::UnboundedSender<StreamEvent>,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Result<ModelResponse, ProviderError> {
        let response = self.next_response(&request);
        let model = request.model.clone();
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);

        if let Some(latency) = self.latency {
            tokio::select! {
                _ = tokio::time::sleep(latency) => {}
                _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            }
        }
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }

        let _ = tx.send(StreamEvent::Start);

        let response = match response {
            MockResponse::Text(text) => {
                // Two deltas so streaming consumers see more than one chunk.
                let split = text
                    .char_indices()
                    .nth(text.chars().count() / 2)
                    .map(|(i, _)| i)
                    .unwrap_or(0);
                for delta in [&text[..split], &text[split..]] {
                    if !delta.is_empty() {
                        let _ = tx.send(StreamEvent::TextDelta {
                            delta: delta.to_string(),
                        });
                    }
                }
                ModelResponse {
                    content: vec![Content::Text { text }],
                    stop_reason: StopReason::Stop,
                    usage: Usage::default(),
                    model,
                }
            }
            MockResponse::ToolCalls(calls) => {
                let content: Vec<Content> = calls
                    .into_iter()
                    .map(|call| {
                        let id = format!(
                            "mock-tool-{}",
                            self.call_ids.fetch_add(1, Ordering::Relaxed)
                        );
                        let _ = tx.send(StreamEvent::ToolCallStart {
                            id: id.clone(),
                            name: call.name.clone(),
                        });
                        Content::ToolCall {
                            id,
                            name: call.name,
                            arguments: call.arguments,
                        }
                    })
                    .collect();
                ModelResponse {
                    content,
                    stop_reason: StopReason::ToolUse,
                    usage: Usage::default(),
                    model,
                }
            }
            MockResponse::Error(message) => return Err(ProviderError::Api(message)),
        };

        let _ = tx.send(StreamEvent::Done);
        Ok(response)
    }
}
