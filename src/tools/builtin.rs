//! Tools the orchestrator and applications get for free.

use super::{ToolContext, ToolSpec};
use crate::error::ToolError;
use serde_json::{json, Value};

pub const EXIT_LOOP: &str = "exit_loop";
pub const TRANSFER_TO_AGENT: &str = "transfer_to_agent";
pub const LOAD_ARTIFACTS: &str = "load_artifacts";

/// Escalates, which ends the enclosing loop after the current step.
pub fn exit_loop() -> ToolSpec {
    ToolSpec::sync_function(
        EXIT_LOOP,
        "Call this only when the work is complete and no further iterations are needed.",
        json!({"type": "object", "properties": {}}),
        |_args, ctx| {
            ctx.escalate();
            Ok(json!({"status": "loop exit requested"}))
        },
    )
}

/// Hands the turn to one of `targets`. Any other name fails with
/// [`ToolError::UnknownAgent`].
pub fn transfer_to_agent(targets: Vec<String>) -> ToolSpec {
    // Names are listed rather than enumerated so an unknown one reaches the
    // body and is reported as a delegation failure.
    let schema = json!({
        "type": "object",
        "properties": {
            "agent_name": {
                "type": "string",
                "description": format!(
                    "Name of the agent to hand the conversation to. One of: {}",
                    targets.join(", ")
                )
            }
        },
        "required": ["agent_name"]
    });
    ToolSpec::sync_function(
        TRANSFER_TO_AGENT,
        "Transfer the conversation to the agent best suited to answer it.",
        schema,
        move |args, ctx| {
            let name = args["agent_name"].as_str().unwrap_or_default();
            if !targets.iter().any(|t| t == name) {
                return Err(ToolError::UnknownAgent(name.to_string()));
            }
            ctx.transfer_to(name);
            Ok(json!({"transferred_to": name}))
        },
    )
}

/// Lists artifact names, or returns the named artifacts base64-encoded.
pub fn load_artifacts() -> ToolSpec {
    ToolSpec::function(
        LOAD_ARTIFACTS,
        "Load artifacts saved in this session. Without names, lists what is available.",
        json!({
            "type": "object",
            "properties": {
                "artifact_names": {"type": "array", "items": {"type": "string"}}
            }
        }),
        load_requested,
    )
}

async fn load_requested(args: Value, ctx: ToolContext) -> Result<Value, ToolError> {
    let names: Vec<String> = args
        .get("artifact_names")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_str).map(String::from).collect())
        .unwrap_or_default();
    if names.is_empty() {
        let available = ctx.list_artifacts().await?;
        return Ok(json!({"artifacts": available}));
    }
    let mut loaded = Vec::with_capacity(names.len());
    for name in names {
        match ctx.load_artifact(&name, None).await? {
            Some(artifact) => loaded.push(json!({
                "name": name,
                "mimeType": artifact.mime_type,
                "data": artifact.to_base64(),
            })),
            None => loaded.push(json!({"name": name, "found": false})),
        }
    }
    Ok(json!({"artifacts": loaded}))
}
