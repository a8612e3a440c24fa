//! Orchestration engine (C6): executes a declared pattern to completion.
//!
//! Sequential is the primary shape: one step at a time over the shared,
//! monotonically growing ledger. Consecutive steps sharing a `group` name run
//! concurrently and join before the next stage; their records are appended in
//! declared order, never completion order. Guarded steps evaluate a safe
//! predicate over prior assessments. Per-step failures are data in the
//! ledger; only `continue_on_failure = false` aborts the run.

pub mod predicate;

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::{AgentRegistry, InvokeContext, RegistryError};
use crate::application::{ApplicationError, LoanApplication};
use crate::audit::{AuditRecorder, RunAudit};
use crate::config::{PatternSpec, StepSpec};
use crate::decision::{self, LoanDecision};
use crate::ledger::{AssessmentRecord, AssessmentStatus, RunLedger, TerminalState};
use predicate::Predicate;

/// Pre-run errors. Per-step failures never surface here; they live in the
/// ledger.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("unknown pattern: {0}")]
    UnknownPattern(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Application(#[from] ApplicationError),
}

/// Result of one run: the terminal ledger and the assembled decision.
#[derive(Debug)]
pub struct RunOutcome {
    pub ledger: RunLedger,
    pub decision: LoanDecision,
    pub correlation_id: String,
}

/// Executes patterns over the agent registry. Independent runs may execute
/// concurrently; the orchestrator holds no per-run state.
pub struct Orchestrator {
    registry: Arc<AgentRegistry>,
    patterns: BTreeMap<String, PatternSpec>,
    audit: Option<AuditRecorder>,
}

impl Orchestrator {
    pub fn new(registry: Arc<AgentRegistry>, patterns: BTreeMap<String, PatternSpec>) -> Self {
        Self {
            registry,
            patterns,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: AuditRecorder) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Runs one application through a pattern. Always produces a decision,
    /// even for aborted runs and zero-step patterns.
    pub async fn run(
        &self,
        pattern_id: &str,
        application: LoanApplication,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, RunError> {
        application.validate()?;
        let pattern = self
            .patterns
            .get(pattern_id)
            .ok_or_else(|| RunError::UnknownPattern(pattern_id.to_string()))?
            .clone();
        let correlation_id = Uuid::new_v4().to_string();
        let mut ledger = RunLedger::new(pattern_id, application);
        tracing::info!(
            application_id = %ledger.application_id,
            pattern = pattern_id,
            correlation_id = %correlation_id,
            steps = pattern.steps.len(),
            "run started"
        );

        let mut aborted = false;
        let steps = &pattern.steps;
        let mut idx = 0;
        while idx < steps.len() {
            if cancel.is_cancelled() {
                tracing::info!(application_id = %ledger.application_id, "run cancelled");
                aborted = true;
                break;
            }
            let span = group_span(steps, idx);
            let records = self
                .execute_span(&steps[idx..span], &ledger, &correlation_id, &cancel)
                .await?;
            for (step, record) in steps[idx..span].iter().zip(records) {
                let failed = record.status != AssessmentStatus::Complete;
                if failed {
                    tracing::warn!(
                        application_id = %ledger.application_id,
                        agent = %record.agent_key,
                        status = ?record.status,
                        "step did not complete"
                    );
                }
                ledger.append(record);
                if failed && !step.continue_on_failure {
                    aborted = true;
                }
            }
            if aborted {
                break;
            }
            idx = span;
        }

        ledger.terminal_state = if aborted {
            TerminalState::Aborted
        } else {
            TerminalState::Completed
        };
        let decision = decision::assemble(&ledger);
        tracing::info!(
            application_id = %ledger.application_id,
            terminal = ?ledger.terminal_state,
            decision = ?decision.decision,
            "run finished"
        );
        if let Some(audit) = &self.audit {
            audit
                .submit(RunAudit::from_run(&ledger, &decision, &correlation_id))
                .await;
        }
        Ok(RunOutcome {
            ledger,
            decision,
            correlation_id,
        })
    }

    /// Executes one span (a single step, or a group of concurrent steps) and
    /// returns records in declared order. Guard and predecessor checks are
    /// evaluated against the ledger as it stood before the span.
    async fn execute_span(
        &self,
        span: &[StepSpec],
        ledger: &RunLedger,
        correlation_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<AssessmentRecord>, RunError> {
        let snapshot = ledger.context_snapshot();
        let mut futures: Vec<BoxFuture<'_, AssessmentRecord>> = Vec::with_capacity(span.len());
        for step in span {
            if let Some(record) = pre_check(step, ledger) {
                futures.push(future::ready(record).boxed());
                continue;
            }
            let handle = self.registry.handle(&step.agent_key)?;
            let snapshot = snapshot.as_str();
            futures.push(
                async move {
                    handle
                        .invoke(InvokeContext {
                            snapshot,
                            correlation_id,
                            cancel,
                        })
                        .await
                }
                .boxed(),
            );
        }
        Ok(future::join_all(futures).await)
    }
}

/// End of the span starting at `idx`: a run of steps sharing a group name,
/// or the single step when ungrouped.
fn group_span(steps: &[StepSpec], idx: usize) -> usize {
    match &steps[idx].group {
        None => idx + 1,
        Some(group) => {
            let mut end = idx + 1;
            while end < steps.len() && steps[end].group.as_ref() == Some(group) {
                end += 1;
            }
            end
        }
    }
}

/// Guard and predecessor verification. Returns a synthetic record when the
/// step must not invoke its agent.
fn pre_check(step: &StepSpec, ledger: &RunLedger) -> Option<AssessmentRecord> {
    if let Some(source) = &step.guard {
        // The loader caches the parsed predicate on the step. A hand-built
        // step without one is parsed here; if that fails, the guard is unmet.
        let holds = match &step.compiled_guard {
            Some(predicate) => predicate.eval(ledger),
            None => Predicate::parse(source)
                .map(|p| p.eval(ledger))
                .unwrap_or(false),
        };
        if !holds {
            return Some(AssessmentRecord::synthetic_failure(
                step.agent_key.as_str(),
                format!("guard not satisfied: {}", source),
                "guard_not_met",
            ));
        }
    }
    if let Some(missing) = step
        .required_predecessors
        .iter()
        .find(|p| !ledger.completed(p))
    {
        return Some(AssessmentRecord::synthetic_failure(
            step.agent_key.as_str(),
            format!("required predecessor {} did not complete", missing),
            "unmet_predecessor",
        ));
    }
    None
}
