//! MCP session over Streamable HTTP: POST JSON-RPC to an endpoint, parse the
//! JSON or SSE response.
//!
//! Performs the `initialize` / `notifications/initialized` handshake at
//! connect, captures the server's `MCP-Session-Id`, and sends it on every
//! subsequent request. One session per declared tool server, shared across
//! runs by the [`ClientPool`](super::ClientPool).

use std::sync::Mutex;
use std::time::Duration;

use reqwest::Client;
use serde_json::{json, Value};

use super::rpc::{parse_response_body, NotificationMessage, RequestMessage, ResponseMessage};
use super::ToolServerError;

/// MCP protocol version sent on every request.
const MCP_PROTOCOL_VERSION: &str = "2025-06-18";
const INITIALIZE_REQUEST_ID: &str = "underwrite-initialize";

pub struct HttpSession {
    client: Client,
    endpoint: String,
    /// Whether SSE responses are acceptable (stream transport).
    accept_sse: bool,
    /// Session id from the server's MCP-Session-Id header.
    session_id: Mutex<Option<String>>,
}

impl HttpSession {
    /// Connects and completes the initialize handshake.
    pub async fn connect(
        endpoint: impl Into<String>,
        accept_sse: bool,
        handshake_timeout: Duration,
    ) -> Result<Self, ToolServerError> {
        let client = Client::builder()
            .build()
            .map_err(|e| ToolServerError::Transport(e.to_string()))?;
        let session = Self {
            client,
            endpoint: endpoint.into(),
            accept_sse,
            session_id: Mutex::new(None),
        };
        tokio::time::timeout(handshake_timeout, session.initialize())
            .await
            .map_err(|_| ToolServerError::Transport("initialize timed out".into()))??;
        Ok(session)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn accept_header(&self) -> &'static str {
        if self.accept_sse {
            "application/json, text/event-stream"
        } else {
            "application/json"
        }
    }

    fn post(&self, body: Vec<u8>) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .header("Accept", self.accept_header())
            .header("MCP-Protocol-Version", MCP_PROTOCOL_VERSION)
            .body(body);
        if let Ok(guard) = self.session_id.lock() {
            if let Some(ref sid) = *guard {
                req = req.header("MCP-Session-Id", sid.as_str());
            }
        }
        req
    }

    async fn initialize(&self) -> Result<(), ToolServerError> {
        let params = json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": { "tools": {} },
            "clientInfo": {
                "name": "underwrite",
                "version": env!("CARGO_PKG_VERSION")
            }
        });
        let request = RequestMessage::new(INITIALIZE_REQUEST_ID, "initialize", params);
        let body =
            serde_json::to_vec(&request).map_err(|e| ToolServerError::Transport(e.to_string()))?;
        let resp = self
            .post(body)
            .send()
            .await
            .map_err(|e| ToolServerError::Transport(e.to_string()))?;
        let status = resp.status();
        if let Some(sid) = resp
            .headers()
            .get("MCP-Session-Id")
            .and_then(|v| v.to_str().ok())
        {
            if let Ok(mut guard) = self.session_id.lock() {
                *guard = Some(sid.to_string());
            }
        }
        if status == reqwest::StatusCode::ACCEPTED {
            return Ok(());
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ToolServerError::Transport(format!(
                "initialize HTTP {}: {}",
                status,
                if text.is_empty() { "no body" } else { &text }
            )));
        }
        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let text = resp
            .text()
            .await
            .map_err(|e| ToolServerError::Transport(format!("initialize body: {}", e)))?;
        parse_response_body(&text, content_type.as_deref()).ok_or_else(|| {
            ToolServerError::Transport("initialize: no JSON-RPC response in body".into())
        })?;

        let notification = NotificationMessage::new("notifications/initialized", Some(json!({})));
        let body = serde_json::to_vec(&notification)
            .map_err(|e| ToolServerError::Transport(e.to_string()))?;
        let resp = self
            .post(body)
            .send()
            .await
            .map_err(|e| ToolServerError::Transport(e.to_string()))?;
        let status = resp.status();
        if status != reqwest::StatusCode::ACCEPTED && !status.is_success() {
            return Err(ToolServerError::Transport(format!(
                "notifications/initialized HTTP {}",
                status
            )));
        }
        Ok(())
    }

    /// Sends one JSON-RPC request and returns the settled response.
    pub async fn request(
        &self,
        id: &str,
        method: &str,
        params: Value,
    ) -> Result<ResponseMessage, ToolServerError> {
        let request = RequestMessage::new(id, method, params);
        let body =
            serde_json::to_vec(&request).map_err(|e| ToolServerError::Transport(e.to_string()))?;
        tracing::debug!(endpoint = %self.endpoint, method, "mcp request");
        let resp = self
            .post(body)
            .send()
            .await
            .map_err(|e| ToolServerError::Transport(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ToolServerError::Transport(format!(
                "{} HTTP {}: {}",
                method,
                status,
                if text.is_empty() { "no body" } else { &text }
            )));
        }
        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let text = resp
            .text()
            .await
            .map_err(|e| ToolServerError::Transport(e.to_string()))?;
        parse_response_body(&text, content_type.as_deref()).ok_or_else(|| {
            ToolServerError::Transport(format!("{}: no JSON-RPC response in body", method))
        })
    }
}
