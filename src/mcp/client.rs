//! MCP client: handshake, tool listing and tool calls.

use super::transport::{HttpTransport, McpTransport, StdioTransport};
use super::types::*;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// A connection to one MCP server. Share it behind an `Arc`; every method
/// takes `&self`.
pub struct McpClient {
    transport: Box<dyn McpTransport>,
    next_id: AtomicU64,
    server_info: Option<ServerInfo>,
    capabilities: ServerCapabilities,
}

impl McpClient {
    /// Spawn a server process and complete the handshake.
    pub async fn connect_stdio(
        command: &str,
        args: &[&str],
        env: Option<HashMap<String, String>>,
    ) -> Result<Self, McpError> {
        let transport = StdioTransport::spawn(command, args, env)?;
        let mut client = Self::from_transport(Box::new(transport));
        client.initialize().await?;
        Ok(client)
    }

    /// Connect to a server over HTTP and complete the handshake.
    pub async fn connect_http(url: &str) -> Result<Self, McpError> {
        let mut client = Self::from_transport(Box::new(HttpTransport::new(url)));
        client.initialize().await?;
        Ok(client)
    }

    /// Wrap a transport without talking to the server yet.
    pub fn from_transport(transport: Box<dyn McpTransport>) -> Self {
        Self {
            transport,
            next_id: AtomicU64::new(1),
            server_info: None,
            capabilities: ServerCapabilities::default(),
        }
    }

    /// `initialize` request followed by the `initialized` notification.
    pub async fn initialize(&mut self) -> Result<ServerInfo, McpError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": ClientInfo::default()
        });
        let result: InitializeResult =
            serde_json::from_value(self.call("initialize", Some(params)).await?)?;
        debug!(
            server = %result.server_info.name,
            protocol = %result.protocol_version,
            "MCP server initialized"
        );
        self.transport
            .notify(JsonRpcRequest::notification(
                "notifications/initialized",
                None,
            ))
            .await?;

        self.server_info = Some(result.server_info.clone());
        self.capabilities = result.capabilities;
        Ok(result.server_info)
    }

    /// Every tool the server offers, following pagination cursors.
    pub async fn list_tools(&self) -> Result<Vec<McpToolInfo>, McpError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = match &cursor {
                Some(cursor) => json!({ "cursor": cursor }),
                None => json!({}),
            };
            let page: ToolsListResult =
                serde_json::from_value(self.call("tools/list", Some(params)).await?)?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(tools),
            }
        }
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
    ) -> Result<McpToolCallResult, McpError> {
        let params = json!({ "name": name, "arguments": arguments });
        Ok(serde_json::from_value(
            self.call("tools/call", Some(params)).await?,
        )?)
    }

    pub async fn close(&self) -> Result<(), McpError> {
        self.transport.close().await
    }

    /// Available after [`initialize`](Self::initialize).
    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server_info.as_ref()
    }

    pub fn capabilities(&self) -> &ServerCapabilities {
        &self.capabilities
    }

    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.transport
            .request(JsonRpcRequest::new(id, method, params))
            .await?
            .into_result()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    /// Answers each method from a table and records every message.
    pub(crate) struct ScriptedTransport {
        answers: HashMap<String, Vec<Value>>,
        pub sent: Arc<Mutex<Vec<JsonRpcRequest>>>,
    }

    impl ScriptedTransport {
        pub fn new() -> Self {
            Self {
                answers: HashMap::new(),
                sent: Arc::default(),
            }
        }

        /// Queue a result for `method`; repeated calls consume in order.
        pub fn answer(mut self, method: &str, result: Value) -> Self {
            self.answers
                .entry(method.to_string())
                .or_default()
                .push(result);
            self
        }
    }

    #[async_trait]
    impl McpTransport for ScriptedTransport {
        async fn request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, McpError> {
            let sent_before = {
                let mut sent = self.sent.lock().unwrap();
                sent.push(request.clone());
                sent.iter().filter(|r| r.method == request.method).count() - 1
            };
            let result = self
                .answers
                .get(&request.method)
                .and_then(|queue| queue.get(sent_before).or(queue.last()))
                .cloned()
                .ok_or(McpError::ConnectionClosed)?;
            Ok(JsonRpcResponse {
                jsonrpc: "2.0".into(),
                id: request.id,
                result: Some(result),
                error: None,
            })
        }

        async fn notify(&self, notification: JsonRpcRequest) -> Result<(), McpError> {
            self.sent.lock().unwrap().push(notification);
            Ok(())
        }

        async fn close(&self) -> Result<(), McpError> {
            Ok(())
        }
    }

    pub(crate) fn initialize_answer() -> Value {
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "time-server", "version": "0.3.1"}
        })
    }

    #[tokio::test]
    async fn test_handshake_sends_initialized_notification() {
        let transport = ScriptedTransport::new().answer("initialize", initialize_answer());
        let sent = transport.sent.clone();
        let mut client = McpClient::from_transport(Box::new(transport));

        let info = client.initialize().await.unwrap();
        assert_eq!(info.name, "time-server");
        assert!(client.capabilities().tools.is_some());

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].id, Some(1));
        assert_eq!(sent[1].method, "notifications/initialized");
        assert!(sent[1].is_notification());
    }

    #[tokio::test]
    async fn test_list_tools_follows_cursor() {
        let transport = ScriptedTransport::new()
            .answer(
                "tools/list",
                json!({"tools": [{"name": "get_time"}], "nextCursor": "page2"}),
            )
            .answer("tools/list", json!({"tools": [{"name": "convert_time"}]}));
        let sent = transport.sent.clone();
        let client = McpClient::from_transport(Box::new(transport));

        let tools = client.list_tools().await.unwrap();
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["get_time", "convert_time"]);
        let sent = sent.lock().unwrap();
        assert_eq!(sent[1].params.as_ref().unwrap()["cursor"], "page2");
        assert_ne!(sent[0].id, sent[1].id);
    }
}
