//! Replay files: a JSON array of scripted provider turns.
//!
//! Each element is one of:
//!
//! ```json
//! {"final": { ...structured payload... }}
//! {"tool_call": {"tool": "verify_identity", "arguments": { ... }}}
//! {"fail": "simulated provider outage"}
//! ```
//!
//! Turns are consumed in provider-call order across the whole run.

use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use underwrite::llm::ScriptedProvider;

#[derive(Debug, Deserialize)]
struct ToolCallTurn {
    tool: String,
    arguments: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ReplayTurn {
    Final(Value),
    ToolCall(ToolCallTurn),
    Fail(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("read replay file: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse replay file: {0}")]
    Parse(#[from] serde_json::Error),
}

pub fn load_provider(path: &Path) -> Result<ScriptedProvider, ReplayError> {
    let text = std::fs::read_to_string(path)?;
    let turns: Vec<ReplayTurn> = serde_json::from_str(&text)?;
    let provider = ScriptedProvider::new();
    for turn in turns {
        match turn {
            ReplayTurn::Final(payload) => provider.push_final(payload),
            ReplayTurn::ToolCall(call) => provider.push_tool_call(call.tool, call.arguments),
            ReplayTurn::Fail(message) => provider.push_failure(message),
        }
    }
    Ok(provider)
}
