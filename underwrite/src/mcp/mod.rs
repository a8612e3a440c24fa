//! Tool-server integration layer (C2): one logical MCP client per declared
//! server, shared across runs.
//!
//! Clients are created lazily on first use, perform a health check before
//! serving calls, and re-probe once the grace window has elapsed. Every
//! outbound tool call is scrubbed for government-identifier shapes before any
//! bytes leave the process, and carries the run's correlation id in the
//! JSON-RPC `_meta` envelope.

mod rpc;
mod session;

pub use session::HttpSession;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::{json, Value};
use thiserror::Error;

use crate::config::{ToolServerSpec, Transport};
use crate::pii;
use rpc::ResponseMessage;

/// Tool specification, aligned with the MCP `tools/list` result item.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
}

/// Result of a single tool call; text joined from MCP content blocks.
#[derive(Debug, Clone)]
pub struct ToolCallContent {
    pub text: String,
}

/// Errors from reaching or calling tool servers.
#[derive(Debug, Error)]
pub enum ToolServerError {
    #[error("tool server {0} is not declared")]
    Unknown(String),
    #[error("tool server {server} unavailable: {reason}")]
    Unavailable { server: String, reason: String },
    #[error("parameter scrubbed at {path}: government-identifier shape")]
    Scrubbed { path: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("JSON-RPC error: {0}")]
    JsonRpc(String),
    #[error("tool call timed out")]
    Timeout,
}

struct HealthState {
    healthy: bool,
    checked_at: Option<Instant>,
}

/// One logical client for one declared tool server. Lives in the pool and
/// outlives individual runs.
pub struct ServerClient {
    spec: ToolServerSpec,
    session: HttpSession,
    http: reqwest::Client,
    health: tokio::sync::Mutex<HealthState>,
}

impl std::fmt::Debug for ServerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerClient")
            .field("spec", &self.spec)
            .finish()
    }
}

impl ServerClient {
    fn new(spec: ToolServerSpec, session: HttpSession) -> Self {
        Self {
            spec,
            session,
            http: reqwest::Client::new(),
            health: tokio::sync::Mutex::new(HealthState {
                healthy: false,
                checked_at: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Health check on first use and again once the grace window has elapsed.
    /// An unhealthy client refuses calls until a later probe succeeds.
    pub async fn ensure_healthy(&self) -> Result<(), ToolServerError> {
        let mut health = self.health.lock().await;
        let grace = Duration::from_secs(self.spec.startup_grace_seconds);
        let fresh = health
            .checked_at
            .map(|at| at.elapsed() < grace)
            .unwrap_or(false);
        if fresh {
            return if health.healthy {
                Ok(())
            } else {
                Err(self.unavailable("health check failed"))
            };
        }
        let probe = self.probe().await;
        health.healthy = probe.is_ok();
        health.checked_at = Some(Instant::now());
        if let Err(e) = probe {
            tracing::warn!(server = %self.spec.name, error = %e, "tool server unhealthy");
            return Err(self.unavailable(&e.to_string()));
        }
        Ok(())
    }

    async fn probe(&self) -> Result<(), ToolServerError> {
        match &self.spec.health_path {
            Some(path) => {
                let base = reqwest::Url::parse(self.session.endpoint())
                    .map_err(|e| ToolServerError::Transport(e.to_string()))?;
                let url = base
                    .join(path)
                    .map_err(|e| ToolServerError::Transport(e.to_string()))?;
                let resp = self
                    .http
                    .get(url)
                    .send()
                    .await
                    .map_err(|e| ToolServerError::Transport(e.to_string()))?;
                if resp.status().is_success() {
                    Ok(())
                } else {
                    Err(ToolServerError::Transport(format!(
                        "health HTTP {}",
                        resp.status()
                    )))
                }
            }
            None => self
                .session
                .request("underwrite-health", "tools/list", json!({}))
                .await
                .map(|_| ()),
        }
    }

    pub async fn list_tools(
        &self,
        correlation_id: &str,
        timeout: Duration,
    ) -> Result<Vec<ToolSpec>, ToolServerError> {
        let params = json!({ "_meta": { "correlationId": correlation_id } });
        let resp = tokio::time::timeout(
            timeout,
            self.session
                .request("underwrite-tools-list", "tools/list", params),
        )
        .await
        .map_err(|_| ToolServerError::Timeout)??;
        parse_list_tools(resp)
    }

    /// Issues one `tools/call`. The caller has already scrubbed `arguments`.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
        correlation_id: &str,
        timeout: Duration,
    ) -> Result<ToolCallContent, ToolServerError> {
        let id = format!("underwrite-call-{}", tool);
        let params = json!({
            "name": tool,
            "arguments": arguments,
            "_meta": { "correlationId": correlation_id }
        });
        let resp = tokio::time::timeout(timeout, self.session.request(&id, "tools/call", params))
            .await
            .map_err(|_| ToolServerError::Timeout)??;
        parse_call_result(resp)
    }

    fn unavailable(&self, reason: &str) -> ToolServerError {
        ToolServerError::Unavailable {
            server: self.spec.name.clone(),
            reason: reason.to_string(),
        }
    }
}

/// Shared pool of tool-server clients (C2). Mutations go through the
/// concurrent map; reads are lock-free once a client exists.
pub struct ClientPool {
    specs: BTreeMap<String, ToolServerSpec>,
    clients: DashMap<String, Arc<ServerClient>>,
}

impl ClientPool {
    pub fn new(servers: impl IntoIterator<Item = ToolServerSpec>) -> Self {
        Self {
            specs: servers.into_iter().map(|s| (s.name.clone(), s)).collect(),
            clients: DashMap::new(),
        }
    }

    pub fn server_spec(&self, name: &str) -> Option<&ToolServerSpec> {
        self.specs.get(name)
    }

    /// Returns the shared client for `name`, creating and initializing it on
    /// first use. A failed connect is not cached; the next run retries.
    pub async fn client(&self, name: &str) -> Result<Arc<ServerClient>, ToolServerError> {
        if let Some(existing) = self.clients.get(name) {
            return Ok(Arc::clone(&existing));
        }
        let spec = self
            .specs
            .get(name)
            .ok_or_else(|| ToolServerError::Unknown(name.to_string()))?;
        let accept_sse = matches!(spec.transport, Transport::Stream);
        let handshake = Duration::from_secs(spec.startup_grace_seconds.max(1));
        let session = HttpSession::connect(spec.endpoint.as_str(), accept_sse, handshake)
            .await
            .map_err(|e| ToolServerError::Unavailable {
                server: name.to_string(),
                reason: e.to_string(),
            })?;
        let client = Arc::new(ServerClient::new(spec.clone(), session));
        let entry = self
            .clients
            .entry(name.to_string())
            .or_insert_with(|| client);
        Ok(Arc::clone(&entry))
    }

    /// First-use or stale-window health verification without issuing a call.
    pub async fn ensure_healthy(&self, name: &str) -> Result<(), ToolServerError> {
        self.client(name).await?.ensure_healthy().await
    }

    pub async fn list_tools(
        &self,
        name: &str,
        correlation_id: &str,
        timeout: Duration,
    ) -> Result<Vec<ToolSpec>, ToolServerError> {
        let client = self.client(name).await?;
        client.ensure_healthy().await?;
        client.list_tools(correlation_id, timeout).await
    }

    /// Scrubs, health-checks, and issues one tool call with the given
    /// per-call deadline. A scrubbed parameter fails before any transport
    /// activity.
    pub async fn call_tool(
        &self,
        name: &str,
        tool: &str,
        arguments: Value,
        correlation_id: &str,
        timeout: Duration,
    ) -> Result<ToolCallContent, ToolServerError> {
        if let Some(path) = pii::scan_params(&arguments) {
            tracing::warn!(server = name, tool, path = %path, "tool parameter scrubbed");
            return Err(ToolServerError::Scrubbed { path });
        }
        let client = self.client(name).await?;
        client.ensure_healthy().await?;
        client
            .call_tool(tool, arguments, correlation_id, timeout)
            .await
    }
}

fn parse_list_tools(resp: ResponseMessage) -> Result<Vec<ToolSpec>, ToolServerError> {
    if let Some(err) = resp.error {
        return Err(ToolServerError::JsonRpc(err.message));
    }
    let tools = resp
        .result
        .and_then(|r| r.get("tools").cloned())
        .ok_or_else(|| ToolServerError::Transport("no tools in response".into()))?;
    let items = tools
        .as_array()
        .ok_or_else(|| ToolServerError::Transport("tools not an array".into()))?;
    let mut specs = Vec::with_capacity(items.len());
    for item in items {
        let obj = item
            .as_object()
            .ok_or_else(|| ToolServerError::Transport("tool item not an object".into()))?;
        specs.push(ToolSpec {
            name: obj
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            description: obj
                .get("description")
                .and_then(|v| v.as_str())
                .map(String::from),
            input_schema: obj
                .get("inputSchema")
                .cloned()
                .unwrap_or_else(|| Value::Object(serde_json::Map::new())),
        });
    }
    Ok(specs)
}

fn parse_call_result(resp: ResponseMessage) -> Result<ToolCallContent, ToolServerError> {
    if let Some(err) = resp.error {
        return Err(ToolServerError::JsonRpc(err.message));
    }
    let result = resp
        .result
        .ok_or_else(|| ToolServerError::Transport("no result in tools/call response".into()))?;
    if result
        .get("isError")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
    {
        let msg = result
            .get("content")
            .and_then(|c| c.as_array())
            .and_then(|a| a.first())
            .and_then(|b| b.get("text").and_then(|t| t.as_str()))
            .unwrap_or("tool returned error")
            .to_string();
        return Err(ToolServerError::Transport(msg));
    }
    let mut parts = Vec::new();
    if let Some(content) = result.get("content").and_then(|c| c.as_array()) {
        for block in content {
            if block.get("type").and_then(|t| t.as_str()) == Some("text") {
                if let Some(t) = block.get("text").and_then(|v| v.as_str()) {
                    parts.push(t);
                }
            }
        }
    }
    let mut text = parts.join("\n").trim().to_string();
    if text.is_empty() {
        if let Some(structured) = result.get("structuredContent") {
            text = serde_json::to_string(structured).unwrap_or_default();
        }
    }
    if text.is_empty() {
        return Err(ToolServerError::Transport(
            "no text or structuredContent in tools/call response".into(),
        ));
    }
    Ok(ToolCallContent { text })
}
