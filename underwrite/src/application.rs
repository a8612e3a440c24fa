//! Loan application input record.
//!
//! Immutable per run. The only applicant identifier permitted to reach a tool
//! server is the opaque `applicant_id`; `validate` rejects any record carrying
//! a government-identifier-shaped value anywhere in its fields.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::pii;

/// Declared purpose of the loan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoanPurpose {
    HomePurchase,
    Refinance,
    HomeEquity,
    DebtConsolidation,
}

/// Errors from validating an application record at submission.
#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("application {0} has no applicant_id")]
    MissingApplicantId(String),
    #[error("application {application_id} carries a government-identifier shape in {field}")]
    GovernmentIdentifier {
        application_id: String,
        field: String,
    },
}

/// A loan application as submitted to the runtime.
///
/// Monetary fields are decimal amounts; `additional_data` is an open
/// key-value map kept in sorted order so serialization is deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoanApplication {
    /// Opaque, unique per run.
    pub application_id: String,
    /// Opaque UUID-shaped applicant reference; the only identifier allowed in
    /// tool calls.
    pub applicant_id: String,
    pub applicant_name: String,
    pub loan_amount: f64,
    pub annual_income: f64,
    /// Existing monthly debt obligations.
    pub existing_debt: f64,
    pub down_payment: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_value: Option<f64>,
    pub loan_purpose: LoanPurpose,
    pub employment_status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credit_score: Option<u32>,
    #[serde(default)]
    pub additional_data: BTreeMap<String, Value>,
}

impl LoanApplication {
    /// Checks the record invariants: `applicant_id` present, no raw
    /// government identifier anywhere in the record.
    pub fn validate(&self) -> Result<(), ApplicationError> {
        if self.applicant_id.trim().is_empty() {
            return Err(ApplicationError::MissingApplicantId(
                self.application_id.clone(),
            ));
        }
        for (field, text) in [
            ("applicant_id", self.applicant_id.as_str()),
            ("applicant_name", self.applicant_name.as_str()),
            ("employment_status", self.employment_status.as_str()),
        ] {
            if pii::contains_government_id(text) {
                return Err(ApplicationError::GovernmentIdentifier {
                    application_id: self.application_id.clone(),
                    field: field.to_string(),
                });
            }
        }
        for (key, value) in &self.additional_data {
            if let Some(path) = pii::scan_params(value) {
                let field = if path.is_empty() {
                    format!("additional_data.{}", key)
                } else {
                    format!("additional_data.{}.{}", key, path)
                };
                return Err(ApplicationError::GovernmentIdentifier {
                    application_id: self.application_id.clone(),
                    field,
                });
            }
        }
        Ok(())
    }
}
