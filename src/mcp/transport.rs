//! How JSON-RPC messages reach an MCP server: a child process's stdio or
//! HTTP POST.

use super::types::*;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex as StdMutex, PoisonError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::debug;

#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Send a request and wait for the response carrying its id.
    async fn request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, McpError>;

    /// Send a notification; nothing comes back.
    async fn notify(&self, notification: JsonRpcRequest) -> Result<(), McpError>;

    async fn close(&self) -> Result<(), McpError>;
}

// ---------------------------------------------------------------------------
// Stdio
// ---------------------------------------------------------------------------

/// Newline-delimited JSON over a child process's stdin/stdout.
pub struct StdioTransport {
    /// Writer and reader live under one lock so a response is always read
    /// by the caller that sent the matching request.
    io: Mutex<StdioPipes>,
    child: Mutex<Child>,
}

struct StdioPipes {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl StdioPipes {
    async fn write(&mut self, message: &JsonRpcRequest) -> Result<(), McpError> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| McpError::Transport(format!("write error: {}", e)))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| McpError::Transport(format!("flush error: {}", e)))
    }
}

impl StdioTransport {
    /// Spawn `command` with piped stdio.
    pub fn spawn(
        command: &str,
        args: &[&str],
        env: Option<HashMap<String, String>>,
    ) -> Result<Self, McpError> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);
        if let Some(env) = env {
            cmd.envs(env);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| McpError::Transport(format!("failed to spawn '{}': {}", command, e)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Transport("failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Transport("failed to capture stdout".into()))?;

        Ok(Self {
            io: Mutex::new(StdioPipes {
                stdin,
                stdout: BufReader::new(stdout),
            }),
            child: Mutex::new(child),
        })
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, McpError> {
        let mut io = self.io.lock().await;
        io.write(&request).await?;

        // Servers may interleave their own notifications; skip anything
        // that is not the response to this request.
        loop {
            let mut line = String::new();
            let read = io
                .stdout
                .read_line(&mut line)
                .await
                .map_err(|e| McpError::Transport(format!("read error: {}", e)))?;
            if read == 0 {
                return Err(McpError::ConnectionClosed);
            }
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<JsonRpcResponse>(line) {
                Ok(response) if response.id == request.id => return Ok(response),
                _ => debug!(message = %line, "skipping unrelated MCP message"),
            }
        }
    }

    async fn notify(&self, notification: JsonRpcRequest) -> Result<(), McpError> {
        self.io.lock().await.write(&notification).await
    }

    async fn close(&self) -> Result<(), McpError> {
        let mut child = self.child.lock().await;
        // Already exited is fine.
        let _ = child.kill().await;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

const SESSION_HEADER: &str = "mcp-session-id";

/// JSON-RPC over HTTP POST. A session id handed out by the server is sent
/// back on every later message.
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    headers: HashMap<String, String>,
    session_id: StdMutex<Option<String>>,
}

impl HttpTransport {
    pub fn new(url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.trim_end_matches('/').to_string(),
            headers: HashMap::new(),
            session_id: StdMutex::new(None),
        }
    }

    /// Extra header on every request (authorization, for example).
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn post(&self, message: &JsonRpcRequest) -> Result<reqwest::Response, McpError> {
        let mut builder = self
            .client
            .post(&self.url)
            .header("accept", "application/json")
            .json(message);
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let session = self
            .session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(session) = session {
            builder = builder.header(SESSION_HEADER, session);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| McpError::Transport(format!("HTTP error: {}", e)))?;
        if !response.status().is_success() {
            return Err(McpError::Transport(format!(
                "HTTP {} from server",
                response.status()
            )));
        }
        if let Some(id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self
                .session_id
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(id.to_string());
        }
        Ok(response)
    }
}

#[async_trait]
impl McpTransport for HttpTransport {
    async fn request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, McpError> {
        let response = self.post(&request).await?;
        let body: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| McpError::Transport(format!("response parse error: {}", e)))?;
        if body.id != request.id {
            return Err(McpError::Protocol(format!(
                "response id {:?} does not match request id {:?}",
                body.id, request.id
            )));
        }
        Ok(body)
    }

    async fn notify(&self, notification: JsonRpcRequest) -> Result<(), McpError> {
        self.post(&notification).await.map(|_| ())
    }

    async fn close(&self) -> Result<(), McpError> {
        Ok(())
    }
}
