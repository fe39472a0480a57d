//! Turning the shared event history into one agent's model conversation.

use crate::types::*;

/// Separates agent name and tool call id in the branch segment of an
/// agent running as a tool.
pub(crate) const ISOLATION_MARK: char = '@';

/// Whether an event on `event_branch` is visible from `branch`.
///
/// Events outside any branch are seen by everyone, and an agent outside
/// any branch sees everything. Otherwise branched events are seen from the
/// same branch and its descendants, never from siblings. `scope`
/// additionally hides everything outside an isolated subtree, and an
/// isolated subtree is never seen from outside it.
pub(crate) fn visible(
    event_branch: Option<&str>,
    branch: Option<&str>,
    scope: Option<&str>,
) -> bool {
    if let Some(scope) = scope {
        if !event_branch.is_some_and(|b| is_within(b, scope)) {
            return false;
        }
    }
    if let Some(isolated) = event_branch.and_then(isolated_root) {
        if !branch.is_some_and(|b| is_within(b, isolated)) {
            return false;
        }
    }
    match (event_branch, branch) {
        (None, _) | (_, None) => true,
        (Some(eb), Some(b)) => is_within(b, eb),
    }
}

/// Prefix of `branch` up to its first isolated segment (`agent@call_id`).
fn isolated_root(branch: &str) -> Option<&str> {
    let mut end = 0;
    for segment in branch.split('.') {
        end += segment.len();
        if segment.contains(ISOLATION_MARK) {
            return Some(&branch[..end]);
        }
        end += 1;
    }
    None
}

/// `branch` equals `ancestor` or sits below it.
fn is_within(branch: &str, ancestor: &str) -> bool {
    branch == ancestor
        || branch
            .strip_prefix(ancestor)
            .is_some_and(|rest| rest.starts_with('.'))
}

/// Build the conversation `agent` sees. Its own events become assistant
/// turns and tool results; the caller's become user turns; other agents'
/// are replayed as user turns prefixed with `For context:`.
pub(crate) fn build_messages(events: &[Event], agent: &str) -> Vec<Message> {
    let mut messages = Vec::new();
    for event in events {
        if event.partial || event.content.is_empty() {
            continue;
        }
        if event.author == agent || event.author == USER_AUTHOR {
            own_turns(event, &mut messages);
        } else {
            messages.push(Message::User {
                content: foreign_turn(event),
                timestamp: event.timestamp,
            });
        }
    }
    messages
}

fn own_turns(event: &Event, messages: &mut Vec<Message>) {
    let from_user = event.author == USER_AUTHOR;
    let mut spoken = Vec::new();
    for part in &event.content {
        match part {
            Content::ToolResponse {
                id,
                name,
                response,
                is_error,
            } => messages.push(Message::ToolResult {
                tool_call_id: id.clone(),
                tool_name: name.clone(),
                response: response.clone(),
                is_error: *is_error,
                timestamp: event.timestamp,
            }),
            Content::ToolCall { .. } if from_user => {}
            other => spoken.push(other.clone()),
        }
    }
    if spoken.is_empty() {
        return;
    }
    let message = if from_user {
        Message::User {
            content: spoken,
            timestamp: event.timestamp,
        }
    } else {
        Message::Assistant {
            content: spoken,
            timestamp: event.timestamp,
        }
    };
    messages.push(message);
}

fn foreign_turn(event: &Event) -> Vec<Content> {
    let mut content = vec![Content::text("For context:")];
    for part in &event.content {
        let line = match part {
            Content::Text { text } => format!("[{}] said: {}", event.author, text),
            Content::ToolCall {
                name, arguments, ..
            } => format!(
                "[{}] called tool `{}` with parameters: {}",
                event.author, name, arguments
            ),
            Content::ToolResponse { name, response, .. } => format!(
                "[{}] `{}` tool returned result: {}",
                event.author, name, response
            ),
        };
        content.push(Content::text(line));
    }
    content
}

/// Fill `{key}` placeholders from `state`. `{key?}` renders empty when the
/// key is absent; a missing plain `{key}` is an error naming the key.
/// Braces around anything that is not an identifier are kept as written.
pub(crate) fn render_instruction(template: &str, state: &StateMap) -> Result<String, String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            out.push_str(&rest[open..]);
            return Ok(out);
        };
        let inner = &after[..close];
        let (name, optional) = match inner.strip_suffix('?') {
            Some(name) => (name, true),
            None => (inner, false),
        };
        if is_placeholder(name) {
            match state.get(name) {
                Some(serde_json::Value::String(s)) => out.push_str(s),
                Some(serde_json::Value::Null) | None if optional => {}
                Some(other) => out.push_str(&other.to_string()),
                None => return Err(name.to_string()),
            }
        } else {
            out.push('{');
            out.push_str(inner);
            out.push('}');
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn is_placeholder(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}
