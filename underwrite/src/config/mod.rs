//! Typed view of the runtime configuration document (C1).
//!
//! Loaded once from a YAML document at process init and immutable thereafter.
//! Declares the agents, the tool servers they may reach, and the orchestration
//! patterns. Cross-references (pattern agent keys, tool-server bindings, guard
//! expressions) are checked at load so a bad document never reaches a run.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::engine::predicate::{Predicate, PredicateError};

/// Errors from loading or validating the runtime document. All fatal, pre-run.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("pattern {pattern} step {step} references unknown agent {agent_key}")]
    UnknownAgent {
        pattern: String,
        step: usize,
        agent_key: String,
    },
    #[error("agent {agent_key} references unknown tool server {server}")]
    UnknownToolServer { agent_key: String, server: String },
    #[error("agent {agent_key} has non-positive timeout_seconds")]
    InvalidTimeout { agent_key: String },
    #[error("agent {agent_key} retry policy out of bounds (max_attempts >= 1, backoff_multiplier >= 1.0)")]
    InvalidRetryPolicy { agent_key: String },
    #[error("pattern {pattern} step {step} guard does not parse: {source}")]
    InvalidGuard {
        pattern: String,
        step: usize,
        source: PredicateError,
    },
    #[error("pattern {pattern} step {step} requires unknown predecessor {agent_key}")]
    UnknownPredecessor {
        pattern: String,
        step: usize,
        agent_key: String,
    },
}

/// Retry policy for one agent: attempts and exponential backoff multiplier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff_multiplier: 1.0,
        }
    }
}

/// One agent declaration: persona, model, tool-server subset, output schema,
/// timeout and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    /// Filled from the `agents` map key at load.
    #[serde(default)]
    pub key: String,
    pub display_name: String,
    /// Persona text location, relative to the config document's directory.
    pub persona_source: PathBuf,
    pub model_id: String,
    #[serde(default)]
    pub tool_servers: Vec<String>,
    pub output_schema: String,
    pub timeout_seconds: u64,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
}

/// Transport used to reach a tool server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transport {
    #[serde(rename = "stream")]
    Stream,
    #[serde(rename = "request-response")]
    RequestResponse,
}

/// One tool-server declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServerSpec {
    pub name: String,
    pub transport: Transport,
    pub endpoint: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_path: Option<String>,
    #[serde(default = "default_grace")]
    pub startup_grace_seconds: u64,
}

fn default_grace() -> u64 {
    30
}

/// One step of a pattern.
///
/// `group`: steps sharing a group name with their immediate neighbors run
/// concurrently and are appended to the ledger in declared order.
/// `guard`: optional predicate over prior assessments; when false the step is
/// recorded as skipped without invoking the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    pub agent_key: String,
    #[serde(default)]
    pub continue_on_failure: bool,
    #[serde(default)]
    pub required_predecessors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// `guard` parsed at load; the engine evaluates this without re-parsing.
    #[serde(skip)]
    pub compiled_guard: Option<Predicate>,
}

/// A declared orchestration pattern. A pattern with zero steps is legal and
/// yields a completed run with a defaulted decision.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatternSpec {
    #[serde(default)]
    pub steps: Vec<StepSpec>,
}

/// External LLM capability declaration. The provider itself is a collaborator
/// behind [`crate::llm::LlmProvider`]; only defaults live here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub model_defaults: BTreeMap<String, Value>,
}

/// The whole runtime document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub agents: BTreeMap<String, AgentSpec>,
    #[serde(default)]
    pub tool_servers: Vec<ToolServerSpec>,
    #[serde(default)]
    pub patterns: BTreeMap<String, PatternSpec>,
    #[serde(default)]
    pub provider: ProviderConfig,
}

impl RuntimeConfig {
    /// Parses a YAML document, compiles guard expressions, and validates
    /// cross-references.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let mut config: RuntimeConfig = serde_yaml::from_str(yaml)?;
        for (key, spec) in config.agents.iter_mut() {
            spec.key = key.clone();
        }
        config.compile_guards()?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a YAML document from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn tool_server(&self, name: &str) -> Option<&ToolServerSpec> {
        self.tool_servers.iter().find(|s| s.name == name)
    }

    /// Parses every step guard once, caching the predicate on the step.
    fn compile_guards(&mut self) -> Result<(), ConfigError> {
        for (pattern_id, pattern) in self.patterns.iter_mut() {
            for (i, step) in pattern.steps.iter_mut().enumerate() {
                if let Some(guard) = &step.guard {
                    let predicate =
                        Predicate::parse(guard).map_err(|e| ConfigError::InvalidGuard {
                            pattern: pattern_id.clone(),
                            step: i,
                            source: e,
                        })?;
                    step.compiled_guard = Some(predicate);
                }
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (key, agent) in &self.agents {
            if agent.timeout_seconds == 0 {
                return Err(ConfigError::InvalidTimeout {
                    agent_key: key.clone(),
                });
            }
            if agent.retry_policy.max_attempts < 1 || agent.retry_policy.backoff_multiplier < 1.0 {
                return Err(ConfigError::InvalidRetryPolicy {
                    agent_key: key.clone(),
                });
            }
            for server in &agent.tool_servers {
                if self.tool_server(server).is_none() {
                    return Err(ConfigError::UnknownToolServer {
                        agent_key: key.clone(),
                        server: server.clone(),
                    });
                }
            }
        }
        for (pattern_id, pattern) in &self.patterns {
            for (i, step) in pattern.steps.iter().enumerate() {
                if !self.agents.contains_key(&step.agent_key) {
                    return Err(ConfigError::UnknownAgent {
                        pattern: pattern_id.clone(),
                        step: i,
                        agent_key: step.agent_key.clone(),
                    });
                }
                for pred in &step.required_predecessors {
                    if !self.agents.contains_key(pred) {
                        return Err(ConfigError::UnknownPredecessor {
                            pattern: pattern_id.clone(),
                            step: i,
                            agent_key: pred.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}
