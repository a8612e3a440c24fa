//! Audit recorder (C8): one structured record per run, written by a single
//! consumer task fed from an ordered queue.
//!
//! Records carry per-step timings, statuses, attempt counts, schema-violation
//! diagnostics, and the tool-call list. No applicant identifiers beyond the
//! opaque `applicant_id` ever appear here.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::decision::{Decision, LoanDecision};
use crate::ledger::{AssessmentStatus, RunLedger, TerminalState, ToolUse};
use crate::llm::ProviderUsage;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("write audit record: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialize audit record: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Per-step slice of the run record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepAudit {
    pub agent_key: String,
    pub status: AssessmentStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub attempts: u32,
    /// Failure notes, including schema-violation diagnostics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,
    pub tools: Vec<ToolUse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<ProviderUsage>,
}

/// One audit record per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunAudit {
    pub application_id: String,
    pub pattern_id: String,
    pub correlation_id: String,
    pub started_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
    pub terminal_state: TerminalState,
    pub decision: Decision,
    pub steps: Vec<StepAudit>,
}

impl RunAudit {
    pub fn from_run(ledger: &RunLedger, decision: &LoanDecision, correlation_id: &str) -> Self {
        let steps = ledger
            .assessments
            .iter()
            .map(|a| StepAudit {
                agent_key: a.agent_key.clone(),
                status: a.status,
                started_at: a.started_at,
                finished_at: a.finished_at,
                attempts: a.attempts,
                diagnostics: if a.status == AssessmentStatus::Complete || a.notes.is_empty() {
                    None
                } else {
                    Some(a.notes.clone())
                },
                tools: a.tools_invoked.clone(),
                usage: a.usage.clone(),
            })
            .collect();
        Self {
            application_id: ledger.application_id.clone(),
            pattern_id: ledger.pattern_id.clone(),
            correlation_id: correlation_id.to_string(),
            started_at: ledger.started_at,
            recorded_at: Utc::now(),
            terminal_state: ledger.terminal_state,
            decision: decision.decision,
            steps,
        }
    }
}

/// Destination for run records.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn write(&self, record: &RunAudit) -> Result<(), AuditError>;
}

/// Appends one JSON line per run.
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl AuditSink for JsonlSink {
    async fn write(&self, record: &RunAudit) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Keeps records in memory; for tests and replay inspection.
#[derive(Default)]
pub struct MemorySink {
    records: std::sync::Mutex<Vec<RunAudit>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<RunAudit> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl AuditSink for MemorySink {
    async fn write(&self, record: &RunAudit) -> Result<(), AuditError> {
        if let Ok(mut records) = self.records.lock() {
            records.push(record.clone());
        }
        Ok(())
    }
}

/// Handle for submitting run records. Cloneable; all submissions drain
/// through one consumer task so write order equals submission order.
#[derive(Clone)]
pub struct AuditRecorder {
    tx: mpsc::Sender<RunAudit>,
}

impl AuditRecorder {
    /// Spawns the consumer task. Dropping every recorder clone closes the
    /// queue and lets the task finish.
    pub fn spawn(sink: Arc<dyn AuditSink>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<RunAudit>(64);
        let task = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                if let Err(e) = sink.write(&record).await {
                    tracing::error!(application_id = %record.application_id, error = %e, "audit write failed");
                }
            }
        });
        (Self { tx }, task)
    }

    pub async fn submit(&self, record: RunAudit) {
        if self.tx.send(record).await.is_err() {
            tracing::error!("audit queue closed; record dropped");
        }
    }
}
