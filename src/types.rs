use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Flat key → value mapping used for session state and state deltas.
pub type StateMap = serde_json::Map<String, serde_json::Value>;

/// Author of events that originate from the caller.
pub const USER_AUTHOR: &str = "user";
/// Author of events that no agent owns (persistence failures and the like).
pub const SYSTEM_AUTHOR: &str = "system";

// ---------------------------------------------------------------------------
// Content parts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Content {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "toolCall")]
    ToolCall {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },
    #[serde(rename = "toolResponse")]
    ToolResponse {
        #[serde(rename = "toolCallId")]
        id: String,
        name: String,
        response: serde_json::Value,
        #[serde(rename = "isError", default)]
        is_error: bool,
    },
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// Join the text parts of a content list, or `None` when there are none.
pub fn joined_text(content: &[Content]) -> Option<String> {
    let texts: Vec<&str> = content.iter().filter_map(Content::as_text).collect();
    if texts.is_empty() {
        None
    } else {
        Some(texts.join("\n"))
    }
}

// ---------------------------------------------------------------------------
// Model conversation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role")]
pub enum Message {
    #[serde(rename = "user")]
    User {
        content: Vec<Content>,
        timestamp: u64,
    },
    #[serde(rename = "assistant")]
    Assistant {
        content: Vec<Content>,
        timestamp: u64,
    },
    #[serde(rename = "toolResult")]
    ToolResult {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        response: serde_json::Value,
        #[serde(rename = "isError")]
        is_error: bool,
        timestamp: u64,
    },
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self::User {
            content: vec![Content::text(text)],
            timestamp: now_ms(),
        }
    }

    pub fn role(&self) -> &str {
        match self {
            Self::User { .. } => "user",
            Self::Assistant { .. } => "assistant",
            Self::ToolResult { .. } => "toolResult",
        }
    }

    /// Text of a user or assistant message.
    pub fn text(&self) -> Option<String> {
        match self {
            Self::User { content, .. } | Self::Assistant { content, .. } => joined_text(content),
            Self::ToolResult { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Stop reasons & usage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum StopReason {
    #[default]
    Stop,
    Length,
    ToolUse,
    Error,
    Aborted,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stop => write!(f, "stop"),
            Self::Length => write!(f, "length"),
            Self::ToolUse => write!(f, "toolUse"),
            Self::Error => write!(f, "error"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Usage {
    pub input: u64,
    pub output: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Classification carried by error events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    ArgumentValidation,
    ToolExecution,
    Delegation,
    Dependency,
    LimitExceeded,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotFound => "not_found",
            Self::ArgumentValidation => "argument_validation",
            Self::ToolExecution => "tool_execution",
            Self::Delegation => "delegation",
            Self::Dependency => "dependency",
            Self::LimitExceeded => "limit_exceeded",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Control actions attached to an event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventActions {
    /// Terminate the enclosing loop or composition.
    #[serde(default)]
    pub escalate: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_to_agent: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub state_delta: StateMap,
    /// filename → version saved during this step.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub artifact_delta: BTreeMap<String, u64>,
    /// State key under which a credential is expected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_auth: Option<String>,
}

impl EventActions {
    pub fn is_empty(&self) -> bool {
        !self.escalate
            && self.transfer_to_agent.is_none()
            && self.state_delta.is_empty()
            && self.artifact_delta.is_empty()
            && self.requested_auth.is_none()
    }

    /// Fold `other` into `self`; later values win.
    pub fn merge(&mut self, other: EventActions) {
        self.escalate |= other.escalate;
        if other.transfer_to_agent.is_some() {
            self.transfer_to_agent = other.transfer_to_agent;
        }
        self.state_delta.extend(other.state_delta);
        self.artifact_delta.extend(other.artifact_delta);
        if other.requested_auth.is_some() {
            self.requested_auth = other.requested_auth;
        }
    }
}

/// One observable transition of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub invocation_id: String,
    pub author: String,
    /// Dotted path of the composition branch that produced the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default)]
    pub content: Vec<Content>,
    #[serde(default)]
    pub is_final: bool,
    /// Streaming delta; never persisted.
    #[serde(default)]
    pub partial: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<EventError>,
    #[serde(default)]
    pub actions: EventActions,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub long_running_tool_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    pub timestamp: u64,
}

impl Event {
    pub fn new(invocation_id: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            invocation_id: invocation_id.into(),
            author: author.into(),
            branch: None,
            content: Vec::new(),
            is_final: false,
            partial: false,
            error: None,
            actions: EventActions::default(),
            long_running_tool_ids: Vec::new(),
            usage: None,
            timestamp: now_ms(),
        }
    }

    pub fn with_branch(mut self, branch: Option<String>) -> Self {
        self.branch = branch;
        self
    }

    pub fn with_content(mut self, content: Vec<Content>) -> Self {
        self.content = content;
        self
    }

    pub fn with_text(self, text: impl Into<String>) -> Self {
        self.with_content(vec![Content::text(text)])
    }

    pub fn with_error(mut self, kind: ErrorKind, message: impl Into<String>) -> Self {
        self.error = Some(EventError {
            kind,
            message: message.into(),
        });
        self
    }

    pub fn finalized(mut self) -> Self {
        self.is_final = true;
        self
    }

    pub fn text(&self) -> Option<String> {
        joined_text(&self.content)
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = (&str, &str, &serde_json::Value)> {
        self.content.iter().filter_map(|c| match c {
            Content::ToolCall {
                id,
                name,
                arguments,
            } => Some((id.as_str(), name.as_str(), arguments)),
            _ => None,
        })
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls().next().is_some()
    }

    pub fn has_tool_responses(&self) -> bool {
        self.content
            .iter()
            .any(|c| matches!(c, Content::ToolResponse { .. }))
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_skips_empty_fields() {
        let event = Event::new("inv-1", "writer").with_text("draft").finalized();
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["author"], "writer");
        assert_eq!(json["is_final"], true);
        assert!(json.get("error").is_none());
        assert!(json.get("long_running_tool_ids").is_none());
        assert_eq!(json["content"][0]["type"], "text");
    }

    #[test]
    fn test_actions_merge() {
        let mut a = EventActions::default();
        a.state_delta.insert("x".into(), 1.into());
        let mut b = EventActions {
            escalate: true,
            ..Default::default()
        };
        b.state_delta.insert("y".into(), 2.into());
        a.merge(b);
        assert!(a.escalate);
        assert_eq!(a.state_delta.len(), 2);
        assert!(!a.is_empty());
        assert!(EventActions::default().is_empty());
    }

    #[test]
    fn test_joined_text_ignores_tool_parts() {
        let content = vec![
            Content::text("one"),
            Content::ToolCall {
                id: "c1".into(),
                name: "lookup".into(),
                arguments: serde_json::json!({}),
            },
            Content::text("two"),
        ];
        assert_eq!(joined_text(&content).as_deref(), Some("one\ntwo"));
        assert_eq!(joined_text(&[]), None);
    }
}
