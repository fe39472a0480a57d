//! Model Context Protocol servers as tool providers.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use weft::mcp::{McpClient, McpToolset};
//! use weft::AgentSpec;
//!
//! # async fn example() -> Result<(), weft::mcp::McpError> {
//! let client = McpClient::connect_stdio("uvx", &["mcp-server-time"], None).await?;
//! let tools = McpToolset::load(Arc::new(client), Some("clock")).await?;
//! let agent = AgentSpec::llm("clock_agent").with_tools(tools);
//! # let _ = agent;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod tool_adapter;
pub mod transport;
pub mod types;

pub use client::McpClient;
pub use tool_adapter::{McpToolAdapter, McpToolset};
pub use transport::{HttpTransport, McpTransport, StdioTransport};
pub use types::{McpContent, McpError, McpToolCallResult, McpToolInfo, ServerInfo};
