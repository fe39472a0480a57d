//! MCP server tools as weft [`ToolSpec`]s.

use super::client::McpClient;
use super::types::{McpError, McpToolInfo};
use crate::error::ToolError;
use crate::tools::{sanitize_tool_name, RemoteTool, ToolContext, ToolSpec};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

/// One server tool. Calls go out under the server's own name whatever the
/// tool is exposed as.
pub struct McpToolAdapter {
    client: Arc<McpClient>,
    tool: McpToolInfo,
    service: String,
}

impl McpToolAdapter {
    pub fn new(client: Arc<McpClient>, tool: McpToolInfo) -> Self {
        let service = match client.server_info() {
            Some(info) => format!("mcp:{}", info.name),
            None => "mcp".to_string(),
        };
        Self {
            client,
            tool,
            service,
        }
    }

    pub fn tool(&self) -> &McpToolInfo {
        &self.tool
    }
}

#[async_trait]
impl RemoteTool for McpToolAdapter {
    fn service(&self) -> &str {
        &self.service
    }

    async fn call(&self, args: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        let result = self
            .client
            .call_tool(&self.tool.name, args)
            .await
            .map_err(|e| ToolError::Failed(format!("MCP call failed: {}", e)))?;
        if result.is_error {
            return Err(ToolError::Failed(result.text()));
        }
        Ok(result.into_value())
    }
}

/// Loads every tool of a server as a remote [`ToolSpec`].
pub struct McpToolset;

impl McpToolset {
    /// With a `prefix`, tools are exposed as `{prefix}__{name}` so several
    /// servers can sit on one agent.
    pub async fn load(
        client: Arc<McpClient>,
        prefix: Option<&str>,
    ) -> Result<Vec<ToolSpec>, McpError> {
        let tools = client.list_tools().await?;
        Ok(tools
            .into_iter()
            .map(|tool| {
                let exposed = match prefix {
                    Some(prefix) => format!("{}__{}", prefix, tool.name),
                    None => tool.name.clone(),
                };
                let description = tool
                    .description
                    .clone()
                    .unwrap_or_else(|| format!("MCP tool '{}'", tool.name));
                let parameters = if tool.input_schema.is_object() {
                    tool.input_schema.clone()
                } else {
                    json!({"type": "object", "properties": {}})
                };
                let adapter = McpToolAdapter::new(client.clone(), tool);
                ToolSpec::remote(
                    sanitize_tool_name(&exposed),
                    description,
                    parameters,
                    Arc::new(adapter),
                )
            })
            .collect())
    }
}
