//! Decision assembler (C7): derives the final loan decision from the
//! terminal ledger.
//!
//! A pure function of the ledger: assembling twice yields identical
//! decisions. The rule table keys on the risk agent's `recommendation`; a run
//! whose risk step did not complete defaults to manual review with a reason
//! naming the failure path.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ledger::{AssessmentRecord, AssessmentStatus, RunLedger};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Conditional,
    Denied,
    ManualReview,
}

/// The consolidated decision artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoanDecision {
    pub decision: Decision,
    pub approved_amount: Option<f64>,
    pub interest_rate: Option<f64>,
    pub term_months: Option<u32>,
    pub primary_reason: String,
    pub supporting_reasons: Vec<String>,
    pub conditions: Vec<String>,
    /// Snapshot copy of the ledger's assessments.
    pub agent_assessments: Vec<AssessmentRecord>,
    pub compliance_flags: BTreeMap<String, bool>,
}

const HUMAN_REVIEW: &str = "human review required";

/// The agent whose recommendation drives the rule table.
const RISK_AGENT_KEY: &str = "risk";

/// Assembles the decision from the terminal ledger.
pub fn assemble(ledger: &RunLedger) -> LoanDecision {
    let risk = ledger
        .assessments
        .iter()
        .rev()
        .find(|a| a.agent_key == RISK_AGENT_KEY);

    let decision = match risk {
        Some(assessment) if assessment.status == AssessmentStatus::Complete => {
            from_recommendation(assessment)
        }
        _ => manual_review(failure_reason(ledger)),
    };

    LoanDecision {
        agent_assessments: ledger.assessments.clone(),
        ..decision
    }
}

fn recommendation_of(assessment: &AssessmentRecord) -> Option<&str> {
    assessment
        .structured_result
        .as_ref()
        .and_then(|r| r.get("recommendation"))
        .and_then(Value::as_str)
}

fn from_recommendation(assessment: &AssessmentRecord) -> LoanDecision {
    let result = assessment.structured_result.as_ref();
    let primary_reason = str_field(result, "primary_reason")
        .unwrap_or_else(|| "risk assessment provided no reason".to_string());
    let supporting_reasons = list_field(result, "supporting_reasons");
    let compliance_flags = flags_field(result);

    match recommendation_of(assessment).unwrap_or_default() {
        "APPROVE" => LoanDecision {
            decision: Decision::Approved,
            approved_amount: num_field(result, "approved_amount"),
            interest_rate: num_field(result, "interest_rate"),
            term_months: int_field(result, "term_months"),
            primary_reason,
            supporting_reasons,
            conditions: Vec::new(),
            agent_assessments: Vec::new(),
            compliance_flags,
        },
        "CONDITIONAL_APPROVAL" => LoanDecision {
            decision: Decision::Conditional,
            approved_amount: num_field(result, "approved_amount"),
            interest_rate: num_field(result, "interest_rate"),
            term_months: int_field(result, "term_months"),
            primary_reason,
            supporting_reasons,
            conditions: list_field(result, "conditions"),
            agent_assessments: Vec::new(),
            compliance_flags,
        },
        "DENY" => LoanDecision {
            decision: Decision::Denied,
            approved_amount: None,
            interest_rate: None,
            term_months: None,
            primary_reason,
            supporting_reasons: supporting_reasons.clone(),
            conditions: supporting_reasons,
            agent_assessments: Vec::new(),
            compliance_flags,
        },
        // MANUAL_REVIEW, plus anything the closed enum should have refused.
        _ => LoanDecision {
            primary_reason,
            compliance_flags,
            ..manual_review(String::new())
        },
    }
}

fn manual_review(primary_reason: String) -> LoanDecision {
    LoanDecision {
        decision: Decision::ManualReview,
        approved_amount: None,
        interest_rate: None,
        term_months: None,
        primary_reason,
        supporting_reasons: Vec::new(),
        conditions: vec![HUMAN_REVIEW.to_string()],
        agent_assessments: Vec::new(),
        compliance_flags: BTreeMap::new(),
    }
}

/// Names the step that broke the run, for the defaulted decision.
fn failure_reason(ledger: &RunLedger) -> String {
    if let Some(failed) = ledger
        .assessments
        .iter()
        .find(|a| a.status != AssessmentStatus::Complete)
    {
        let status = match failed.status {
            AssessmentStatus::Timeout => "timed out",
            _ => "failed",
        };
        format!("step {} {}; risk assessment unavailable", failed.agent_key, status)
    } else {
        "no risk recommendation produced".to_string()
    }
}

fn str_field(result: Option<&Value>, key: &str) -> Option<String> {
    result
        .and_then(|r| r.get(key))
        .and_then(Value::as_str)
        .map(String::from)
}

fn num_field(result: Option<&Value>, key: &str) -> Option<f64> {
    result.and_then(|r| r.get(key)).and_then(Value::as_f64)
}

fn int_field(result: Option<&Value>, key: &str) -> Option<u32> {
    result
        .and_then(|r| r.get(key))
        .and_then(Value::as_u64)
        .map(|v| v as u32)
}

fn list_field(result: Option<&Value>, key: &str) -> Vec<String> {
    result
        .and_then(|r| r.get(key))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

fn flags_field(result: Option<&Value>) -> BTreeMap<String, bool> {
    result
        .and_then(|r| r.get("compliance_flags"))
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_bool().map(|b| (k.clone(), b)))
                .collect()
        })
        .unwrap_or_default()
}
