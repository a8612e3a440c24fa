//! Deterministic provider: a queue of scripted turns.
//!
//! Each `complete` call pops the next turn and records the request transcript,
//! so tests can assert exactly how many provider calls a step made and what
//! diagnostics were embedded in the retry prompt. Also used by the CLI's
//! replay mode to drive the pipeline without a network.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::{LlmProvider, Message, ProviderError, ProviderReply, ProviderRequest};

/// One scripted provider turn.
#[derive(Debug, Clone)]
pub enum ScriptedTurn {
    Reply(ProviderReply),
    /// Sleeps before replying; used to exercise deadlines.
    DelayedReply { delay: Duration, reply: ProviderReply },
    Fail(String),
}

/// A recorded provider call, kept for assertions.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub model_id: String,
    pub messages: Vec<Message>,
}

/// Provider double driven by a scripted queue of turns.
#[derive(Default)]
pub struct ScriptedProvider {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, turn: ScriptedTurn) {
        if let Ok(mut turns) = self.turns.lock() {
            turns.push_back(turn);
        }
    }

    /// Queues a final structured payload.
    pub fn push_final(&self, payload: Value) {
        self.push(ScriptedTurn::Reply(ProviderReply::final_payload(payload)));
    }

    /// Queues a tool-call request.
    pub fn push_tool_call(&self, tool: impl Into<String>, arguments: Value) {
        self.push(ScriptedTurn::Reply(ProviderReply::tool_call(
            tool, arguments,
        )));
    }

    /// Queues a reply that arrives after `delay`.
    pub fn push_delayed_final(&self, delay: Duration, payload: Value) {
        self.push(ScriptedTurn::DelayedReply {
            delay,
            reply: ProviderReply::final_payload(payload),
        });
    }

    pub fn push_failure(&self, message: impl Into<String>) {
        self.push(ScriptedTurn::Fail(message.into()));
    }

    /// All calls made so far, in order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn remaining(&self) -> usize {
        self.turns.lock().map(|t| t.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn complete(&self, request: ProviderRequest<'_>) -> Result<ProviderReply, ProviderError> {
        let turn = {
            let mut turns = self
                .turns
                .lock()
                .map_err(|e| ProviderError::Call(e.to_string()))?;
            turns.pop_front()
        };
        {
            let mut calls = self
                .calls
                .lock()
                .map_err(|e| ProviderError::Call(e.to_string()))?;
            calls.push(RecordedCall {
                model_id: request.model_id.to_string(),
                messages: request.messages.to_vec(),
            });
        }
        match turn {
            Some(ScriptedTurn::Reply(reply)) => Ok(reply),
            Some(ScriptedTurn::DelayedReply { delay, reply }) => {
                tokio::time::sleep(delay).await;
                Ok(reply)
            }
            Some(ScriptedTurn::Fail(message)) => Err(ProviderError::Call(message)),
            None => Err(ProviderError::Call("script exhausted".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaRegistry;
    use serde_json::json;

    fn request<'a>(messages: &'a [Message], schema: &'a crate::schema::RecordSchema) -> ProviderRequest<'a> {
        ProviderRequest {
            model_id: "test-model",
            messages,
            tools: &[],
            output_schema: schema,
        }
    }

    #[tokio::test]
    async fn pops_turns_in_order_and_records_calls() {
        let registry = SchemaRegistry::builtin();
        let schema = registry.get("risk_assessment").unwrap();
        let provider = ScriptedProvider::new();
        provider.push_tool_call("credit_report", json!({"applicant_id": "abc"}));
        provider.push_final(json!({"recommendation": "APPROVE"}));

        let messages = vec![Message::system("persona"), Message::user("context")];
        let first = provider.complete(request(&messages, &schema)).await.unwrap();
        assert_eq!(first.tool_calls.len(), 1);
        let second = provider.complete(request(&messages, &schema)).await.unwrap();
        assert!(second.payload.is_some());

        let calls = provider.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].model_id, "test-model");
        assert_eq!(calls[0].messages.len(), 2);
    }

    #[tokio::test]
    async fn exhausted_script_fails_the_call() {
        let registry = SchemaRegistry::builtin();
        let schema = registry.get("risk_assessment").unwrap();
        let provider = ScriptedProvider::new();
        let messages = vec![Message::user("context")];
        let err = provider
            .complete(request(&messages, &schema))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("script exhausted"));
    }
}
