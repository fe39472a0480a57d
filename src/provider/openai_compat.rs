//! OpenAI Chat Completions compatible provider.
//!
//! Covers OpenAI and any other backend that speaks the Chat Completions
//! streaming API (Groq, OpenRouter, Ollama, vLLM, ...). Configuration is an
//! explicit [`OpenAiConfig`]; nothing is read from the environment unless
//! the caller asks for it with [`OpenAiConfig::from_env`].

use super::traits::*;
use crate::types::*;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest_eventsource::EventSource;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub api_key: String,
    /// Extra headers sent with every request.
    pub headers: Vec<(String, String)>,
}

impl OpenAiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.into(),
            api_key: api_key.into(),
            headers: Vec::new(),
        }
    }

    /// `OPENAI_API_KEY` (required) and `OPENAI_BASE_URL` (optional).
    pub fn from_env() -> Result<Self, ProviderError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| ProviderError::Auth("OPENAI_API_KEY is not set".into()))?;
        let mut config = Self::new(api_key);
        if let Ok(base_url) = std::env::var("OPENAI_BASE_URL") {
            config.base_url = base_url;
        }
        Ok(config)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

pub struct OpenAiCompatProvider {
    config: OpenAiConfig,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(config: OpenAiConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ModelProvider for OpenAiCompatProvider {
    async fn generate(
        &self,
        request: ModelRequest,
        tx: mpsc::UnboundedSender<StreamEvent>,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Result<ModelResponse, ProviderError> {
        let url = format!("{}/chat/completions", self.config.base_url);
        let body = build_request_body(&request);
        debug!("OpenAI compat request: model={} url={}", request.model, url);

        let mut builder = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {}", self.config.api_key));
        for (k, v) in &self.config.headers {
            builder = builder.header(k, v);
        }

        let mut es = EventSource::new(builder.json(&body))
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let mut text = String::new();
        let mut usage = Usage::default();
        let mut stop_reason = StopReason::Stop;
        let mut tool_call_buffers: Vec<ToolCallBuffer> = Vec::new();

        let _ = tx.send(StreamEvent::Start);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    es.close();
                    return Err(ProviderError::Cancelled);
                }
                event = es.next() => {
                    match event {
                        None => break,
                        Some(Ok(reqwest_eventsource::Event::Open)) => {}
                        Some(Ok(reqwest_eventsource::Event::Message(msg))) => {
                            if msg.data == "[DONE]" {
                                break;
                            }
                            let chunk: OpenAiChunk = match serde_json::from_str(&msg.data) {
                                Ok(c) => c,
                                Err(e) => {
                                    debug!(
                                        "Failed to parse OpenAI chunk: {} data={}",
                                        e, &msg.data
                                    );
                                    continue;
                                }
                            };

                            if let Some(u) = &chunk.usage {
                                usage.input = u.prompt_tokens;
                                usage.output = u.completion_tokens;
                                usage.total_tokens = u.total_tokens;
                            }

                            for choice in &chunk.choices {
                                let delta = &choice.delta;
                                if let Some(piece) = &delta.content {
                                    text.push_str(piece);
                                    let _ = tx.send(StreamEvent::TextDelta {
                                        delta: piece.clone(),
                                    });
                                }
                                for tc in delta.tool_calls.iter().flatten() {
                                    let tc_index = tc.index as usize;
                                    while tool_call_buffers.len() <= tc_index {
                                        tool_call_buffers.push(ToolCallBuffer::default());
                                    }
                                    let buf = &mut tool_call_buffers[tc_index];
                                    if let Some(id) = &tc.id {
                                        buf.id.clone_from(id);
                                    }
                                    if let Some(f) = &tc.function {
                                        if let Some(name) = &f.name {
                                            buf.name.clone_from(name);
                                            let _ = tx.send(StreamEvent::ToolCallStart {
                                                id: buf.id.clone(),
                                                name: name.clone(),
                                            });
                                        }
                                        if let Some(args) = &f.arguments {
                                            buf.arguments.push_str(args);
                                        }
                                    }
                                }
                                if let Some(reason) = &choice.finish_reason {
                                    stop_reason = match reason.as_str() {
                                        "length" => StopReason::Length,
                                        "tool_calls" => StopReason::ToolUse,
                                        _ => StopReason::Stop,
                                    };
                                }
                            }
                        }
                        Some(Err(reqwest_eventsource::Error::StreamEnded)) => break,
                        Some(Err(e)) => {
                            es.close();
                            let err = classify_error(e).await;
                            warn!("OpenAI SSE error: {}", err);
                            return Err(err);
                        }
                    }
                }
            }
        }
        es.close();

        let mut content = Vec::new();
        if !text.is_empty() {
            content.push(Content::Text { text });
        }
        for buf in tool_call_buffers {
            let arguments = serde_json::from_str(&buf.arguments)
                .unwrap_or(serde_json::Value::Object(Default::default()));
            content.push(Content::ToolCall {
                id: buf.id,
                name: buf.name,
                arguments,
            });
        }
        if content.iter().any(|c| matches!(c, Content::ToolCall { .. })) {
            stop_reason = StopReason::ToolUse;
        }

        let _ = tx.send(StreamEvent::Done);
        Ok(ModelResponse {
            content,
            stop_reason,
            usage,
            model: request.model,
        })
    }
}

async fn classify_error(e: reqwest_eventsource::Error) -> ProviderError {
    match e {
        reqwest_eventsource::Error::InvalidStatusCode(status, response) => {
            let retry_after_ms = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000);
            let body = response.text().await.unwrap_or_default();
            match status.as_u16() {
                401 | 403 => ProviderError::Auth(format!("{}: {}", status, body)),
                429 => ProviderError::RateLimited { retry_after_ms },
                500..=599 => ProviderError::Network(format!("{}: {}", status, body)),
                _ => ProviderError::Api(format!("{}: {}", status, body)),
            }
        }
        reqwest_eventsource::Error::Transport(e) => ProviderError::Network(e.to_string()),
        other => ProviderError::Other(other.to_string()),
    }
}

#[derive(Default)]
struct ToolCallBuffer {
    id: String,
    name: String,
    arguments: String,
}

fn build_request_body(request: &ModelRequest) -> serde_json::Value {
    let mut messages: Vec<serde_json::Value> = Vec::new();

    if !request.system_instruction.is_empty() {
        messages.push(serde_json::json!({
            "role": "system",
            "content": request.system_instruction,
        }));
    }

    for msg in &request.messages {
        match msg {
            Message::User { content, .. } => {
                messages.push(serde_json::json!({
                    "role": "user",
                    "content": joined_text(content).unwrap_or_default(),
                }));
            }
            Message::Assistant { content, .. } => {
                let tool_calls: Vec<serde_json::Value> = content
                    .iter()
                    .filter_map(|c| match c {
                        Content::ToolCall {
                            id,
                            name,
                            arguments,
                        } => Some(serde_json::json!({
                            "id": id,
                            "type": "function",
                            "function": {"name": name, "arguments": arguments.to_string()},
                        })),
                        _ => None,
                    })
                    .collect();

                let mut msg_obj = serde_json::json!({"role": "assistant"});
                if let Some(text) = joined_text(content) {
                    msg_obj["content"] = serde_json::json!(text);
                }
                if !tool_calls.is_empty() {
                    msg_obj["tool_calls"] = serde_json::json!(tool_calls);
                }
                messages.push(msg_obj);
            }
            Message::ToolResult {
                tool_call_id,
                response,
                ..
            } => {
                let content = match response {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                messages.push(serde_json::json!({
                    "role": "tool",
                    "tool_call_id": tool_call_id,
                    "content": content,
                }));
            }
        }
    }

    let mut body = serde_json::json!({
        "model": request.model,
        "stream": true,
        "stream_options": {"include_usage": true},
        "messages": messages,
    });

    if let Some(max) = request.max_tokens {
        body["max_tokens"] = serde_json::json!(max);
    }
    if let Some(temp) = request.temperature {
        body["temperature"] = serde_json::json!(temp);
    }
    if let Some(schema) = &request.output_schema {
        body["response_format"] = serde_json::json!({
            "type": "json_schema",
            "json_schema": {"name": request.agent_name, "schema": schema},
        });
    }

    if !request.tools.is_empty() {
        let tools: Vec<serde_json::Value> = request
            .tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();
        body["tools"] = serde_json::json!(tools);
    }

    body
}

// OpenAI streaming response types
#[derive(Deserialize)]
struct OpenAiChunk {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    delta: OpenAiDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct OpenAiDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAiToolCallDelta>>,
}

#[derive(Deserialize)]
struct OpenAiToolCallDelta {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<OpenAiFunctionDelta>,
}

#[derive(Deserialize)]
struct OpenAiFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}
