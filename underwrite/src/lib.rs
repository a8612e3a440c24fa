//! Underwrite: a configuration-driven multi-agent loan-processing runtime.
//!
//! Given a loan application, the engine runs a declared pattern of
//! specialized agents (intake, credit, income, risk) over an accumulating
//! context ledger. Each agent is a binding of persona text, a model id, a
//! tool-server subset (remote MCP servers), and a validating output schema;
//! the external LLM provider is a single capability behind
//! [`llm::LlmProvider`]. The terminal ledger is assembled into one
//! [`decision::LoanDecision`] and audited.
//!
//! # Shape of a run
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use underwrite::{
//!     agent::AgentRegistry, config::RuntimeConfig, engine::Orchestrator,
//!     llm::ScriptedProvider, mcp::ClientPool, schema::SchemaRegistry,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RuntimeConfig::load("runtime.yaml")?;
//! let schemas = SchemaRegistry::builtin();
//! let pool = Arc::new(ClientPool::new(config.tool_servers.clone()));
//! let provider = Arc::new(ScriptedProvider::new());
//! let registry = Arc::new(AgentRegistry::new(
//!     &config, &schemas, pool, provider, ".".as_ref(),
//! )?);
//! let engine = Orchestrator::new(registry, config.patterns.clone());
//! let application = serde_json::from_str(r#"{ /* LoanApplication */ }"#)?;
//! let outcome = engine
//!     .run("loan_processing", application, CancellationToken::new())
//!     .await?;
//! println!("{:?}", outcome.decision.decision);
//! # Ok(())
//! # }
//! ```
//!
//! # Invariants
//!
//! - The ledger holds exactly one assessment per executed step, in declared
//!   order, whatever the execution concurrency.
//! - No tool-call parameter ever carries a government-identifier-shaped
//!   string; the only applicant reference crossing the boundary is the
//!   opaque `applicant_id`.
//! - A completed assessment's `structured_result` validates against the
//!   agent's bound schema; unknown fields are rejected.

pub mod agent;
pub mod application;
pub mod audit;
pub mod backoff;
pub mod config;
pub mod decision;
pub mod engine;
pub mod ledger;
pub mod llm;
pub mod mcp;
pub mod pii;
pub mod schema;

pub use agent::{AgentHandle, AgentRegistry};
pub use application::{LoanApplication, LoanPurpose};
pub use decision::{Decision, LoanDecision};
pub use engine::{Orchestrator, RunError, RunOutcome};
pub use ledger::{AssessmentRecord, AssessmentStatus, RunLedger, TerminalState};
