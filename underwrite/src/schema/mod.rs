//! Output-schema registry (C3): a closed map from symbolic schema names to
//! validating record schemas.
//!
//! Schemas are registered once at init; resolving a name at agent-binding time
//! is a lookup, never a runtime type discovery. Validation rejects unknown
//! fields, enforces enum closure and numeric bounds, and reports field-path
//! diagnostics that are fed back into the provider's retry prompt.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

/// Fatal, pre-run schema registry errors.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("unknown output schema: {0}")]
    Unknown(String),
    #[error("output schema registered twice: {0}")]
    Duplicate(String),
}

/// One structured diagnostic from validation: where and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub path: String,
    pub reason: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.reason)
    }
}

/// The type algebra available to output schemas.
#[derive(Debug, Clone)]
pub enum FieldKind {
    String,
    Boolean,
    /// Non-negative decimal amount.
    Money,
    /// Float constrained to [0, 1].
    UnitFloat,
    Integer {
        min: Option<i64>,
        max: Option<i64>,
    },
    /// Closed set of permitted string values.
    Enum(Vec<&'static str>),
    List(Box<FieldKind>),
    /// String-keyed map with homogeneous values.
    Map(Box<FieldKind>),
}

impl FieldKind {
    fn describe(&self) -> String {
        match self {
            FieldKind::String => "string".into(),
            FieldKind::Boolean => "boolean".into(),
            FieldKind::Money => "decimal amount >= 0".into(),
            FieldKind::UnitFloat => "float in [0,1]".into(),
            FieldKind::Integer { min, max } => match (min, max) {
                (Some(lo), Some(hi)) => format!("integer in [{},{}]", lo, hi),
                (Some(lo), None) => format!("integer >= {}", lo),
                (None, Some(hi)) => format!("integer <= {}", hi),
                (None, None) => "integer".into(),
            },
            FieldKind::Enum(values) => format!("one of {}", values.join(" | ")),
            FieldKind::List(inner) => format!("list of {}", inner.describe()),
            FieldKind::Map(inner) => format!("map of string to {}", inner.describe()),
        }
    }

    fn validate(&self, value: &Value, path: &str, out: &mut Vec<Violation>) {
        match self {
            FieldKind::String => {
                if !value.is_string() {
                    push(out, path, "expected string");
                }
            }
            FieldKind::Boolean => {
                if !value.is_boolean() {
                    push(out, path, "expected boolean");
                }
            }
            FieldKind::Money => match value.as_f64() {
                Some(v) if v.is_finite() && v >= 0.0 => {}
                _ => push(out, path, "expected decimal amount >= 0"),
            },
            FieldKind::UnitFloat => match value.as_f64() {
                Some(v) if (0.0..=1.0).contains(&v) => {}
                _ => push(out, path, "expected float in [0,1]"),
            },
            FieldKind::Integer { min, max } => match value.as_i64() {
                Some(v) => {
                    if min.map(|lo| v < lo).unwrap_or(false)
                        || max.map(|hi| v > hi).unwrap_or(false)
                    {
                        push(out, path, &format!("integer {} out of bounds", v));
                    }
                }
                None => push(out, path, "expected integer"),
            },
            FieldKind::Enum(values) => match value.as_str() {
                Some(s) if values.contains(&s) => {}
                Some(s) => push(
                    out,
                    path,
                    &format!("value {:?} not in enum {}", s, values.join(" | ")),
                ),
                None => push(out, path, "expected enum string"),
            },
            FieldKind::List(inner) => match value.as_array() {
                Some(items) => {
                    for (i, item) in items.iter().enumerate() {
                        inner.validate(item, &format!("{}[{}]", path, i), out);
                    }
                }
                None => push(out, path, "expected list"),
            },
            FieldKind::Map(inner) => match value.as_object() {
                Some(map) => {
                    for (k, v) in map {
                        inner.validate(v, &format!("{}.{}", path, k), out);
                    }
                }
                None => push(out, path, "expected map"),
            },
        }
    }
}

fn push(out: &mut Vec<Violation>, path: &str, reason: &str) {
    out.push(Violation {
        path: path.to_string(),
        reason: reason.to_string(),
    });
}

#[derive(Debug, Clone)]
struct FieldSpec {
    kind: FieldKind,
    required: bool,
}

/// A named record schema: a closed set of typed fields.
#[derive(Debug, Clone)]
pub struct RecordSchema {
    name: String,
    fields: BTreeMap<String, FieldSpec>,
}

impl RecordSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.insert(
            name.into(),
            FieldSpec {
                kind,
                required: true,
            },
        );
        self
    }

    pub fn optional_field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.insert(
            name.into(),
            FieldSpec {
                kind,
                required: false,
            },
        );
        self
    }

    /// One line per field, used to tell the provider the required shape and
    /// to build retry prompts.
    pub fn describe(&self) -> String {
        let mut lines = vec![format!("schema {}:", self.name)];
        for (name, spec) in &self.fields {
            lines.push(format!(
                "  {}: {}{}",
                name,
                spec.kind.describe(),
                if spec.required { "" } else { " (optional)" }
            ));
        }
        lines.join("\n")
    }

    /// Validates a candidate record. Unknown fields are rejected; all
    /// violations are collected, not just the first.
    pub fn validate(&self, value: &Value) -> Result<(), Vec<Violation>> {
        let mut out = Vec::new();
        let Some(map) = value.as_object() else {
            return Err(vec![Violation {
                path: "$".into(),
                reason: "expected a record object".into(),
            }]);
        };
        for (name, spec) in &self.fields {
            match map.get(name) {
                Some(v) => spec.kind.validate(v, name, &mut out),
                None if spec.required => push(&mut out, name, "required field missing"),
                None => {}
            }
        }
        for key in map.keys() {
            if !self.fields.contains_key(key) {
                push(&mut out, key, "unknown field");
            }
        }
        if out.is_empty() {
            Ok(())
        } else {
            Err(out)
        }
    }
}

/// Closed mapping from symbolic schema names to record schemas.
pub struct SchemaRegistry {
    schemas: BTreeMap<String, Arc<RecordSchema>>,
}

impl SchemaRegistry {
    pub fn empty() -> Self {
        Self {
            schemas: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, schema: RecordSchema) -> Result<(), SchemaError> {
        let name = schema.name.clone();
        if self.schemas.contains_key(&name) {
            return Err(SchemaError::Duplicate(name));
        }
        self.schemas.insert(name, Arc::new(schema));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<RecordSchema>, SchemaError> {
        self.schemas
            .get(name)
            .cloned()
            .ok_or_else(|| SchemaError::Unknown(name.to_string()))
    }

    /// The four loan-pipeline schemas, registered at init.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        for schema in [
            intake_assessment(),
            credit_assessment(),
            income_assessment(),
            risk_assessment(),
        ] {
            registry
                .register(schema)
                .expect("builtin schema names are distinct");
        }
        registry
    }
}

/// Recommendation values the risk schema closes over.
pub const RISK_RECOMMENDATIONS: &[&str] =
    &["APPROVE", "CONDITIONAL_APPROVAL", "MANUAL_REVIEW", "DENY"];

fn common(schema: RecordSchema) -> RecordSchema {
    schema
        .field("confidence", FieldKind::UnitFloat)
        .optional_field("risk_factors", FieldKind::List(Box::new(FieldKind::String)))
}

fn intake_assessment() -> RecordSchema {
    common(
        RecordSchema::new("intake_assessment")
            .field("complete", FieldKind::Boolean)
            .field(
                "missing_fields",
                FieldKind::List(Box::new(FieldKind::String)),
            )
            .field(
                "routing",
                FieldKind::Enum(vec!["standard", "expedited", "enhanced_review"]),
            )
            .optional_field("validation_notes", FieldKind::String),
    )
}

fn credit_assessment() -> RecordSchema {
    common(
        RecordSchema::new("credit_assessment")
            .field(
                "credit_score",
                FieldKind::Integer {
                    min: Some(300),
                    max: Some(850),
                },
            )
            .field(
                "credit_tier",
                FieldKind::Enum(vec!["excellent", "good", "fair", "poor"]),
            )
            .field("identity_verified", FieldKind::Boolean)
            .optional_field(
                "delinquencies",
                FieldKind::Integer {
                    min: Some(0),
                    max: None,
                },
            )
            .optional_field("utilization", FieldKind::UnitFloat)
            .optional_field("summary", FieldKind::String),
    )
}

fn income_assessment() -> RecordSchema {
    common(
        RecordSchema::new("income_assessment")
            .field("annual_income_verified", FieldKind::Money)
            .field("debt_to_income_ratio", FieldKind::UnitFloat)
            .field("employment_stable", FieldKind::Boolean)
            .optional_field(
                "income_sources",
                FieldKind::List(Box::new(FieldKind::String)),
            )
            .optional_field("summary", FieldKind::String),
    )
}

fn risk_assessment() -> RecordSchema {
    common(
        RecordSchema::new("risk_assessment")
            .field("recommendation", FieldKind::Enum(RISK_RECOMMENDATIONS.to_vec()))
            .field("primary_reason", FieldKind::String)
            .optional_field("approved_amount", FieldKind::Money)
            .optional_field("interest_rate", FieldKind::UnitFloat)
            .optional_field(
                "term_months",
                FieldKind::Integer {
                    min: Some(1),
                    max: Some(480),
                },
            )
            .optional_field(
                "supporting_reasons",
                FieldKind::List(Box::new(FieldKind::String)),
            )
            .optional_field("conditions", FieldKind::List(Box::new(FieldKind::String)))
            .optional_field(
                "compliance_flags",
                FieldKind::Map(Box::new(FieldKind::Boolean)),
            ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn risk() -> Arc<RecordSchema> {
        SchemaRegistry::builtin().get("risk_assessment").unwrap()
    }

    #[test]
    fn builtin_registry_resolves_all_four() {
        let registry = SchemaRegistry::builtin();
        for name in [
            "intake_assessment",
            "credit_assessment",
            "income_assessment",
            "risk_assessment",
        ] {
            assert!(registry.get(name).is_ok(), "missing {name}");
        }
        assert!(matches!(
            registry.get("nonexistent"),
            Err(SchemaError::Unknown(_))
        ));
    }

    #[test]
    fn duplicate_registration_rejected() {
        let mut registry = SchemaRegistry::builtin();
        let err = registry.register(RecordSchema::new("risk_assessment"));
        assert!(matches!(err, Err(SchemaError::Duplicate(_))));
    }

    #[test]
    fn valid_risk_record_passes() {
        let record = json!({
            "recommendation": "APPROVE",
            "primary_reason": "strong credit and low DTI",
            "approved_amount": 300000.0,
            "interest_rate": 0.0625,
            "term_months": 360,
            "confidence": 0.93
        });
        assert!(risk().validate(&record).is_ok());
    }

    /// **Scenario**: unknown fields are rejected even when everything else
    /// validates.
    #[test]
    fn unknown_field_rejected() {
        let record = json!({
            "recommendation": "APPROVE",
            "primary_reason": "ok",
            "confidence": 0.9,
            "surprise": true
        });
        let violations = risk().validate(&record).unwrap_err();
        assert!(violations.iter().any(|v| v.path == "surprise"));
    }

    #[test]
    fn enum_closure_enforced() {
        let record = json!({
            "recommendation": "MAYBE",
            "primary_reason": "ok",
            "confidence": 0.9
        });
        let violations = risk().validate(&record).unwrap_err();
        assert!(violations
            .iter()
            .any(|v| v.path == "recommendation" && v.reason.contains("not in enum")));
    }

    #[test]
    fn numeric_bounds_enforced() {
        let schema = SchemaRegistry::builtin().get("credit_assessment").unwrap();
        let record = json!({
            "credit_score": 900,
            "credit_tier": "excellent",
            "identity_verified": true,
            "confidence": 1.2
        });
        let violations = schema.validate(&record).unwrap_err();
        assert!(violations.iter().any(|v| v.path == "credit_score"));
        assert!(violations.iter().any(|v| v.path == "confidence"));
    }

    #[test]
    fn missing_required_field_reports_path() {
        let record = json!({
            "recommendation": "DENY",
            "confidence": 0.8
        });
        let violations = risk().validate(&record).unwrap_err();
        assert_eq!(
            violations,
            vec![Violation {
                path: "primary_reason".into(),
                reason: "required field missing".into()
            }]
        );
    }

    #[test]
    fn nested_list_and_map_paths_in_diagnostics() {
        let record = json!({
            "recommendation": "CONDITIONAL_APPROVAL",
            "primary_reason": "ok",
            "confidence": 0.8,
            "conditions": ["proof of income", 7],
            "compliance_flags": {"ability_to_repay": "yes"}
        });
        let violations = risk().validate(&record).unwrap_err();
        assert!(violations.iter().any(|v| v.path == "conditions[1]"));
        assert!(violations
            .iter()
            .any(|v| v.path == "compliance_flags.ability_to_repay"));
    }

    #[test]
    fn non_object_rejected_at_root() {
        let violations = risk().validate(&json!([1, 2, 3])).unwrap_err();
        assert_eq!(violations[0].path, "$");
    }

    #[test]
    fn describe_lists_fields_with_kinds() {
        let text = risk().describe();
        assert!(text.contains("schema risk_assessment:"));
        assert!(text.contains("recommendation: one of APPROVE | CONDITIONAL_APPROVAL"));
        assert!(text.contains("(optional)"));
    }
}
