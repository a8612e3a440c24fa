//! External LLM capability (the provider collaborator).
//!
//! The runtime treats the provider as a single capability: given a persona,
//! an accumulated context, a tool catalog, and a required output schema,
//! produce either a tool-call request (the runtime executes it and feeds the
//! result back) or a final structured payload. Implementations:
//! [`ScriptedProvider`] (deterministic, for tests and replay runs); real
//! drivers live outside this crate behind [`LlmProvider`].

mod scripted;

pub use scripted::{RecordedCall, ScriptedProvider, ScriptedTurn};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::mcp::ToolSpec;
use crate::schema::RecordSchema;

/// A single message in the provider transcript.
///
/// Roles: system (persona), user (context snapshot, retry diagnostics),
/// assistant (provider turns), tool (tool-call results fed back).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Message {
    System(String),
    User(String),
    Assistant(String),
    Tool { tool: String, content: String },
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::System(content.into())
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::User(content.into())
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::Assistant(content.into())
    }

    pub fn tool(tool: impl Into<String>, content: impl Into<String>) -> Self {
        Self::Tool {
            tool: tool.into(),
            content: content.into(),
        }
    }
}

/// Token usage for one provider call, when the provider reports it.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProviderUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// One tool invocation requested by the provider.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ToolCallRequest {
    pub tool: String,
    pub arguments: Value,
}

/// One provider turn: tool calls to execute, or a final structured payload.
///
/// `tool_calls` non-empty means the runtime executes them and calls the
/// provider again with the results appended; otherwise `payload` is the
/// candidate record validated against the bound output schema.
#[derive(Debug, Clone, Default)]
pub struct ProviderReply {
    pub tool_calls: Vec<ToolCallRequest>,
    pub payload: Option<Value>,
    pub usage: Option<ProviderUsage>,
}

impl ProviderReply {
    pub fn final_payload(payload: Value) -> Self {
        Self {
            payload: Some(payload),
            ..Self::default()
        }
    }

    pub fn tool_call(tool: impl Into<String>, arguments: Value) -> Self {
        Self {
            tool_calls: vec![ToolCallRequest {
                tool: tool.into(),
                arguments,
            }],
            ..Self::default()
        }
    }

    pub fn with_usage(mut self, usage: ProviderUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// Everything one provider call sees.
pub struct ProviderRequest<'a> {
    pub model_id: &'a str,
    pub messages: &'a [Message],
    pub tools: &'a [ToolSpec],
    pub output_schema: &'a RecordSchema,
}

/// Errors from the provider transport. Schema conformance of the payload is
/// not the provider's concern; the agent handle validates and retries.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider call failed: {0}")]
    Call(String),
}

/// The external LLM capability.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(&self, request: ProviderRequest<'_>) -> Result<ProviderReply, ProviderError>;
}
