//! Per-run context ledger (C5): the append-only record of agent assessments.
//!
//! The ledger is exclusively owned by its run. Its prompt serialization is
//! deterministic: fixed key order, declaration-order arrays, two-decimal
//! monetary strings, ISO-8601 UTC timestamps. Tool-call metadata and attempt
//! counts are retained in the ledger but elided from the prompt fragment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::application::LoanApplication;
use crate::llm::ProviderUsage;

/// Outcome of one agent step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssessmentStatus {
    Complete,
    Failed,
    Timeout,
}

/// One tool invocation made during a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUse {
    pub server: String,
    pub tool: String,
    pub duration_ms: u64,
}

/// The structured result of one agent step.
///
/// Present in the ledger even when the step failed; `structured_result` is
/// `None` exactly when `status != complete`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssessmentRecord {
    pub agent_key: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: AssessmentStatus,
    pub confidence: f64,
    pub structured_result: Option<Value>,
    pub risk_factors: Vec<String>,
    pub tools_invoked: Vec<ToolUse>,
    pub notes: String,
    /// Provider attempts consumed by this step (1 on first success).
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<ProviderUsage>,
}

impl AssessmentRecord {
    /// A record for a step that never reached the provider (unmet
    /// predecessor, unmet guard, cancelled run).
    pub fn synthetic_failure(agent_key: impl Into<String>, notes: impl Into<String>, tag: &str) -> Self {
        let now = Utc::now();
        Self {
            agent_key: agent_key.into(),
            started_at: now,
            finished_at: now,
            status: AssessmentStatus::Failed,
            confidence: 0.0,
            structured_result: None,
            risk_factors: vec![tag.to_string()],
            tools_invoked: Vec::new(),
            notes: notes.into(),
            attempts: 0,
            usage: None,
        }
    }
}

/// Terminal state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalState {
    Running,
    Completed,
    Aborted,
}

/// The per-run ledger: application snapshot plus ordered assessments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLedger {
    pub application_id: String,
    pub pattern_id: String,
    pub started_at: DateTime<Utc>,
    pub application: LoanApplication,
    pub assessments: Vec<AssessmentRecord>,
    pub terminal_state: TerminalState,
}

impl RunLedger {
    pub fn new(pattern_id: impl Into<String>, application: LoanApplication) -> Self {
        Self {
            application_id: application.application_id.clone(),
            pattern_id: pattern_id.into(),
            started_at: Utc::now(),
            application,
            assessments: Vec::new(),
            terminal_state: TerminalState::Running,
        }
    }

    pub fn append(&mut self, record: AssessmentRecord) {
        self.assessments.push(record);
    }

    pub fn assessment(&self, agent_key: &str) -> Option<&AssessmentRecord> {
        self.assessments.iter().find(|a| a.agent_key == agent_key)
    }

    pub fn completed(&self, agent_key: &str) -> bool {
        self.assessment(agent_key)
            .map(|a| a.status == AssessmentStatus::Complete)
            .unwrap_or(false)
    }

    /// Deterministic prompt fragment: the application plus every assessment
    /// appended so far, in declaration order. This is the user-side input for
    /// the next agent.
    pub fn context_snapshot(&self) -> String {
        let mut root = Map::new();
        root.insert("application".into(), application_view(&self.application));
        root.insert(
            "assessments".into(),
            Value::Array(self.assessments.iter().map(assessment_view).collect()),
        );
        serde_json::to_string_pretty(&Value::Object(root))
            .unwrap_or_else(|_| String::from("{}"))
    }
}

/// Two-decimal fixed-point rendering for monetary values.
fn money(amount: f64) -> Value {
    Value::String(format!("{:.2}", amount))
}

/// Recursively sorts object keys so nested provider output renders stably.
pub(crate) fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for k in keys {
                out.insert(k.clone(), canonical(&map[k]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

fn application_view(app: &LoanApplication) -> Value {
    let mut map = Map::new();
    map.insert("application_id".into(), json!(app.application_id));
    map.insert("applicant_id".into(), json!(app.applicant_id));
    map.insert("applicant_name".into(), json!(app.applicant_name));
    map.insert("loan_amount".into(), money(app.loan_amount));
    map.insert("annual_income".into(), money(app.annual_income));
    map.insert("existing_debt".into(), money(app.existing_debt));
    map.insert("down_payment".into(), money(app.down_payment));
    if let Some(v) = app.property_value {
        map.insert("property_value".into(), money(v));
    }
    map.insert("loan_purpose".into(), json!(app.loan_purpose));
    map.insert("employment_status".into(), json!(app.employment_status));
    if let Some(score) = app.credit_score {
        map.insert("credit_score".into(), json!(score));
    }
    if !app.additional_data.is_empty() {
        let mut extra = Map::new();
        for (k, v) in &app.additional_data {
            extra.insert(k.clone(), canonical(v));
        }
        map.insert("additional_data".into(), Value::Object(extra));
    }
    Value::Object(map)
}

fn assessment_view(record: &AssessmentRecord) -> Value {
    let mut map = Map::new();
    map.insert("agent_key".into(), json!(record.agent_key));
    map.insert("status".into(), json!(record.status));
    map.insert(
        "confidence".into(),
        Value::String(format!("{:.2}", record.confidence)),
    );
    map.insert(
        "structured_result".into(),
        record
            .structured_result
            .as_ref()
            .map(canonical)
            .unwrap_or(Value::Null),
    );
    map.insert("risk_factors".into(), json!(record.risk_factors));
    map.insert("notes".into(), json!(record.notes));
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::LoanPurpose;
    use std::collections::BTreeMap;

    fn application() -> LoanApplication {
        LoanApplication {
            application_id: "LN-0001".into(),
            applicant_id: "a1b2c3d4-e5f6-4a00-8000-000000000001".into(),
            applicant_name: "Avery Example".into(),
            loan_amount: 300_000.0,
            annual_income: 180_000.0,
            existing_debt: 1_200.0,
            down_payment: 60_000.0,
            property_value: None,
            loan_purpose: LoanPurpose::HomePurchase,
            employment_status: "employed".into(),
            credit_score: Some(820),
            additional_data: BTreeMap::new(),
        }
    }

    fn complete_record(agent_key: &str, result: Value) -> AssessmentRecord {
        let now = Utc::now();
        AssessmentRecord {
            agent_key: agent_key.into(),
            started_at: now,
            finished_at: now,
            status: AssessmentStatus::Complete,
            confidence: 0.9,
            structured_result: Some(result),
            risk_factors: Vec::new(),
            tools_invoked: vec![ToolUse {
                server: "verification".into(),
                tool: "verify_identity".into(),
                duration_ms: 12,
            }],
            notes: String::new(),
            attempts: 1,
            usage: None,
        }
    }

    #[test]
    fn snapshot_is_deterministic_and_formats_money_fixed_point() {
        let ledger = RunLedger::new("loan_processing", application());
        let a = ledger.context_snapshot();
        let b = ledger.context_snapshot();
        assert_eq!(a, b);
        assert!(a.contains("\"loan_amount\": \"300000.00\""));
        assert!(a.contains("\"existing_debt\": \"1200.00\""));
    }

    #[test]
    fn snapshot_orders_nested_result_keys() {
        let mut ledger = RunLedger::new("loan_processing", application());
        ledger.append(complete_record(
            "intake",
            serde_json::json!({"zeta": 1, "alpha": {"b": 2, "a": 1}}),
        ));
        let snapshot = ledger.context_snapshot();
        let alpha = snapshot.find("\"alpha\"").unwrap();
        let zeta = snapshot.find("\"zeta\"").unwrap();
        assert!(alpha < zeta, "keys should render sorted");
    }

    /// **Scenario**: tool metadata stays in the ledger but is elided from the
    /// prompt fragment.
    #[test]
    fn snapshot_elides_tools_invoked_and_attempts() {
        let mut ledger = RunLedger::new("loan_processing", application());
        ledger.append(complete_record("intake", serde_json::json!({"ok": true})));
        let snapshot = ledger.context_snapshot();
        assert!(!snapshot.contains("tools_invoked"));
        assert!(!snapshot.contains("verify_identity"));
        assert!(!snapshot.contains("attempts"));
        assert_eq!(ledger.assessments[0].tools_invoked.len(), 1);
    }

    #[test]
    fn failed_record_renders_null_result() {
        let mut ledger = RunLedger::new("loan_processing", application());
        ledger.append(AssessmentRecord::synthetic_failure(
            "credit",
            "predecessor intake did not complete",
            "unmet_predecessor",
        ));
        let snapshot = ledger.context_snapshot();
        assert!(snapshot.contains("\"structured_result\": null"));
        assert!(snapshot.contains("unmet_predecessor"));
    }

    /// Serializing, parsing, and serializing again yields identical bytes.
    #[test]
    fn ledger_serde_roundtrip_is_byte_stable() {
        let mut ledger = RunLedger::new("loan_processing", application());
        ledger.append(complete_record("intake", serde_json::json!({"ok": true})));
        ledger.terminal_state = TerminalState::Completed;

        let first = serde_json::to_string(&ledger).unwrap();
        let reparsed: RunLedger = serde_json::from_str(&first).unwrap();
        assert_eq!(ledger, reparsed);
        let second = serde_json::to_string(&reparsed).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn completed_tracks_status() {
        let mut ledger = RunLedger::new("loan_processing", application());
        assert!(!ledger.completed("intake"));
        ledger.append(complete_record("intake", serde_json::json!({"ok": true})));
        assert!(ledger.completed("intake"));
        ledger.append(AssessmentRecord::synthetic_failure("credit", "down", "tool_server_unavailable"));
        assert!(!ledger.completed("credit"));
    }
}
