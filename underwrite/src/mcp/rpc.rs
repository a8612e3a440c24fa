//! JSON-RPC 2.0 envelope for the MCP Streamable HTTP transport.
//!
//! Responses arrive either as a single `application/json` object or as a
//! `text/event-stream` body carrying JSON-RPC messages in `data:` lines;
//! `parse_response_body` handles both.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Serialize)]
pub struct RequestMessage {
    jsonrpc: &'static str,
    pub id: String,
    pub method: String,
    pub params: Value,
}

impl RequestMessage {
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct NotificationMessage {
    jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl NotificationMessage {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ErrorBody {
    pub code: i64,
    pub message: String,
}

/// A JSON-RPC response: result or error.
#[derive(Debug, Deserialize)]
pub struct ResponseMessage {
    #[allow(dead_code)]
    pub id: Option<Value>,
    pub result: Option<Value>,
    pub error: Option<ErrorBody>,
}

impl ResponseMessage {
    fn is_settled(&self) -> bool {
        self.result.is_some() || self.error.is_some()
    }
}

/// Parses the first settled JSON-RPC response out of an HTTP body.
///
/// SSE bodies may interleave notifications; only a message with `result` or
/// `error` counts. Returns `None` when no settled response is present.
pub fn parse_response_body(body: &str, content_type: Option<&str>) -> Option<ResponseMessage> {
    let is_sse = content_type
        .map(|s| s.contains("text/event-stream"))
        .unwrap_or(false);
    if !is_sse {
        return serde_json::from_str::<ResponseMessage>(body)
            .ok()
            .filter(ResponseMessage::is_settled);
    }
    let mut data = String::new();
    for line in body.lines() {
        if let Some(rest) = line.strip_prefix("data: ") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(rest);
            if let Ok(msg) = serde_json::from_str::<ResponseMessage>(&data) {
                if msg.is_settled() {
                    return Some(msg);
                }
            }
        } else if line.trim().is_empty() && !data.is_empty() {
            if let Ok(msg) = serde_json::from_str::<ResponseMessage>(&data) {
                if msg.is_settled() {
                    return Some(msg);
                }
            }
            data.clear();
        }
    }
    if !data.is_empty() {
        if let Ok(msg) = serde_json::from_str::<ResponseMessage>(&data) {
            if msg.is_settled() {
                return Some(msg);
            }
        }
    }
    None
}
