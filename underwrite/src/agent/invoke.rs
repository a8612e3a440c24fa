//! Agent invocation: one logical LLM call with a bounded tool-round loop,
//! schema validation, and the agent's retry policy.
//!
//! Retries are attempted only for deadline timeouts and schema violations;
//! an unavailable required tool server and a failed provider call both fail
//! the step immediately. A scrubbed tool parameter counts as a schema
//! violation for the enclosing agent and consumes the retry budget.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::ledger::{AssessmentRecord, AssessmentStatus, ToolUse};
use crate::llm::{Message, ProviderRequest, ProviderUsage};
use crate::mcp::{ToolServerError, ToolSpec};

use super::AgentHandle;

/// Cap on provider tool-call rounds within one attempt.
const MAX_TOOL_ROUNDS: usize = 8;
/// Raw provider output kept in `notes` is truncated to this many characters.
const RAW_NOTE_LIMIT: usize = 600;

/// Per-invocation inputs supplied by the engine.
pub struct InvokeContext<'a> {
    /// Deterministic serialization of the ledger so far.
    pub snapshot: &'a str,
    /// Run-scoped correlation id carried on every tool call.
    pub correlation_id: &'a str,
    pub cancel: &'a CancellationToken,
}

struct Catalog {
    specs: Vec<ToolSpec>,
    /// tool name -> server name; first declaration wins.
    route: BTreeMap<String, String>,
}

enum AttemptEnd {
    Complete { payload: Value },
    Violation { diagnostic: String, raw: String },
    Unavailable { server: String, reason: String },
    ProviderFailure(String),
}

impl AgentHandle {
    /// Runs the full invocation for one step and always returns a record;
    /// failures are encoded in `status`, never raised.
    pub async fn invoke(&self, ctx: InvokeContext<'_>) -> AssessmentRecord {
        let started_at = Utc::now();
        let spec = self.binding.spec.clone();
        let deadline = Duration::from_secs(spec.timeout_seconds);
        // Transport timeout per tool call: half the step deadline.
        let call_timeout = Duration::from_secs_f64(spec.timeout_seconds as f64 * 0.5);
        let backoff = Backoff::new(spec.retry_policy.backoff_multiplier);

        let mut tools_invoked: Vec<ToolUse> = Vec::new();
        let mut usage: Option<ProviderUsage> = None;
        let mut attempts: u32 = 0;
        let mut violation: Option<String> = None;

        let catalog = match self.build_catalog(ctx.correlation_id, call_timeout).await {
            Ok(catalog) => catalog,
            Err((server, reason)) => {
                return self.finish(
                    started_at,
                    AssessmentStatus::Failed,
                    None,
                    vec!["tool_server_unavailable".into()],
                    tools_invoked,
                    format!("required tool server {} unavailable: {}", server, reason),
                    0,
                    usage,
                );
            }
        };

        loop {
            attempts += 1;
            if ctx.cancel.is_cancelled() {
                return self.finish(
                    started_at,
                    AssessmentStatus::Failed,
                    None,
                    vec!["cancelled".into()],
                    tools_invoked,
                    "run cancelled before provider call".into(),
                    attempts - 1,
                    usage,
                );
            }
            let exhausted = attempts >= spec.retry_policy.max_attempts;
            let attempt = self.attempt(
                &catalog,
                &ctx,
                violation.as_deref(),
                call_timeout,
                &mut tools_invoked,
                &mut usage,
            );
            let outcome = tokio::time::timeout(deadline, attempt).await;
            match outcome {
                Err(_) => {
                    // Deadline exceeded; the in-flight call is abandoned.
                    tracing::warn!(agent = %spec.key, attempt = attempts, "invocation deadline exceeded");
                    if exhausted {
                        return self.finish(
                            started_at,
                            AssessmentStatus::Timeout,
                            None,
                            vec!["timeout".into()],
                            tools_invoked,
                            format!("deadline of {}s exceeded", spec.timeout_seconds),
                            attempts,
                            usage,
                        );
                    }
                    violation = None;
                }
                Ok(AttemptEnd::Complete { payload }) => {
                    let confidence = payload
                        .get("confidence")
                        .and_then(Value::as_f64)
                        .unwrap_or(0.0);
                    let risk_factors = payload
                        .get("risk_factors")
                        .and_then(Value::as_array)
                        .map(|items| {
                            items
                                .iter()
                                .filter_map(|v| v.as_str().map(String::from))
                                .collect()
                        })
                        .unwrap_or_default();
                    return self.finish(
                        started_at,
                        AssessmentStatus::Complete,
                        Some(payload),
                        risk_factors,
                        tools_invoked,
                        String::new(),
                        attempts,
                        usage,
                    );
                }
                Ok(AttemptEnd::Violation { diagnostic, raw }) => {
                    tracing::debug!(agent = %spec.key, attempt = attempts, %diagnostic, "schema violation");
                    if exhausted {
                        let mut notes = diagnostic;
                        if !raw.is_empty() {
                            notes.push_str("; raw: ");
                            notes.push_str(&truncate(&raw, RAW_NOTE_LIMIT));
                        }
                        return self.finish(
                            started_at,
                            AssessmentStatus::Failed,
                            None,
                            vec!["schema_violation".into()],
                            tools_invoked,
                            notes,
                            attempts,
                            usage,
                        );
                    }
                    violation = Some(diagnostic);
                }
                Ok(AttemptEnd::Unavailable { server, reason }) => {
                    return self.finish(
                        started_at,
                        AssessmentStatus::Failed,
                        None,
                        vec!["tool_server_unavailable".into()],
                        tools_invoked,
                        format!("tool server {} unavailable: {}", server, reason),
                        attempts,
                        usage,
                    );
                }
                Ok(AttemptEnd::ProviderFailure(message)) => {
                    // Not retried: only timeouts and schema violations are.
                    tracing::warn!(agent = %spec.key, attempt = attempts, %message, "provider call failed");
                    return self.finish(
                        started_at,
                        AssessmentStatus::Failed,
                        None,
                        vec!["provider_error".into()],
                        tools_invoked,
                        message,
                        attempts,
                        usage,
                    );
                }
            }
            let delay = backoff.jittered(attempts);
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    return self.finish(
                        started_at,
                        AssessmentStatus::Failed,
                        None,
                        vec!["cancelled".into()],
                        tools_invoked,
                        "run cancelled during retry backoff".into(),
                        attempts,
                        usage,
                    );
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Lists tools on every bound server once per invocation. An unreachable
    /// required server aborts the step; optional servers are skipped.
    async fn build_catalog(
        &self,
        correlation_id: &str,
        call_timeout: Duration,
    ) -> Result<Catalog, (String, String)> {
        let mut specs = Vec::new();
        let mut route = BTreeMap::new();
        for server in &self.binding.spec.tool_servers {
            let required = self
                .pool
                .server_spec(server)
                .map(|s| s.required)
                .unwrap_or(false);
            match self.pool.list_tools(server, correlation_id, call_timeout).await {
                Ok(tools) => {
                    for tool in tools {
                        if route.contains_key(&tool.name) {
                            tracing::warn!(server = %server, tool = %tool.name, "duplicate tool name; keeping first");
                            continue;
                        }
                        route.insert(tool.name.clone(), server.clone());
                        specs.push(tool);
                    }
                }
                Err(e) if required => return Err((server.clone(), e.to_string())),
                Err(e) => {
                    tracing::warn!(server = %server, error = %e, "optional tool server skipped");
                }
            }
        }
        Ok(Catalog { specs, route })
    }

    async fn attempt(
        &self,
        catalog: &Catalog,
        ctx: &InvokeContext<'_>,
        violation: Option<&str>,
        call_timeout: Duration,
        tools_invoked: &mut Vec<ToolUse>,
        usage: &mut Option<ProviderUsage>,
    ) -> AttemptEnd {
        let spec = &self.binding.spec;
        let mut messages = vec![
            Message::system(format!(
                "{}\n\nRespond with one JSON object conforming to the output schema.\n{}",
                self.binding.persona,
                self.binding.schema.describe()
            )),
            Message::user(ctx.snapshot.to_string()),
        ];
        if let Some(diagnostic) = violation {
            messages.push(Message::user(format!(
                "The previous response did not validate:\n{}\nReturn a corrected JSON object.",
                diagnostic
            )));
        }

        for _round in 0..MAX_TOOL_ROUNDS {
            let request = ProviderRequest {
                model_id: &spec.model_id,
                messages: &messages,
                tools: &catalog.specs,
                output_schema: &self.binding.schema,
            };
            let reply = match self.provider.complete(request).await {
                Ok(reply) => reply,
                Err(e) => return AttemptEnd::ProviderFailure(e.to_string()),
            };
            merge_usage(usage, reply.usage.as_ref());

            if !reply.tool_calls.is_empty() {
                messages.push(Message::assistant(
                    serde_json::to_string(&reply.tool_calls).unwrap_or_default(),
                ));
                for call in reply.tool_calls {
                    let Some(server) = catalog.route.get(&call.tool) else {
                        messages.push(Message::tool(
                            call.tool.clone(),
                            format!("unknown tool: {}", call.tool),
                        ));
                        continue;
                    };
                    let t0 = Instant::now();
                    match self
                        .pool
                        .call_tool(
                            server,
                            &call.tool,
                            call.arguments,
                            ctx.correlation_id,
                            call_timeout,
                        )
                        .await
                    {
                        Ok(content) => {
                            tools_invoked.push(ToolUse {
                                server: server.clone(),
                                tool: call.tool.clone(),
                                duration_ms: t0.elapsed().as_millis() as u64,
                            });
                            messages.push(Message::tool(call.tool, content.text));
                        }
                        Err(ToolServerError::Scrubbed { path }) => {
                            return AttemptEnd::Violation {
                                diagnostic: format!(
                                    "tool call {} rejected: parameter at {} matched the government-identifier pattern",
                                    call.tool, path
                                ),
                                raw: String::new(),
                            };
                        }
                        Err(ToolServerError::Unavailable { server, reason }) => {
                            return AttemptEnd::Unavailable { server, reason };
                        }
                        Err(other) => {
                            // Transport-level tool failures are surfaced to the
                            // model, which may recover or finish without the tool.
                            messages.push(Message::tool(
                                call.tool,
                                format!("tool call failed: {}", other),
                            ));
                        }
                    }
                }
                continue;
            }

            let Some(payload) = reply.payload else {
                return AttemptEnd::Violation {
                    diagnostic: "provider returned neither tool calls nor a final payload".into(),
                    raw: String::new(),
                };
            };
            return match self.binding.schema.validate(&payload) {
                Ok(()) => AttemptEnd::Complete { payload },
                Err(violations) => AttemptEnd::Violation {
                    diagnostic: violations
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join("; "),
                    raw: serde_json::to_string(&payload).unwrap_or_default(),
                },
            };
        }
        AttemptEnd::Violation {
            diagnostic: format!("tool-call round limit ({}) exceeded", MAX_TOOL_ROUNDS),
            raw: String::new(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        started_at: chrono::DateTime<Utc>,
        status: AssessmentStatus,
        structured_result: Option<Value>,
        risk_factors: Vec<String>,
        tools_invoked: Vec<ToolUse>,
        notes: String,
        attempts: u32,
        usage: Option<ProviderUsage>,
    ) -> AssessmentRecord {
        let confidence = structured_result
            .as_ref()
            .and_then(|p| p.get("confidence"))
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        AssessmentRecord {
            agent_key: self.binding.spec.key.clone(),
            started_at,
            finished_at: Utc::now(),
            status,
            confidence,
            structured_result,
            risk_factors,
            tools_invoked,
            notes,
            attempts,
            usage,
        }
    }
}

fn merge_usage(total: &mut Option<ProviderUsage>, delta: Option<&ProviderUsage>) {
    if let Some(delta) = delta {
        let entry = total.get_or_insert_with(ProviderUsage::default);
        entry.prompt_tokens += delta.prompt_tokens;
        entry.completion_tokens += delta.completion_tokens;
        entry.total_tokens += delta.total_tokens;
    }
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        text.to_string()
    } else {
        let mut out: String = text.chars().take(limit).collect();
        out.push_str("...");
        out
    }
}
