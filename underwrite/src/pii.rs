//! Government-identifier detection for outbound tool parameters and inbound
//! application records.
//!
//! The runtime forbids raw government identifiers (9-digit SSN shape, with or
//! without dashes) in any tool-call parameter and in the application record
//! itself. Only the opaque `applicant_id` crosses process boundaries.
//!
//! **Interaction**: `scan_params` is called by the MCP client pool before any
//! bytes leave the process; `contains_government_id` is called by
//! `LoanApplication::validate`.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// SSN shape: three digits, two digits, four digits, dashes optional.
/// Word boundaries keep longer digit runs (10-digit account numbers) from
/// matching a 9-digit window inside them.
static GOVERNMENT_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{3}-?\d{2}-?\d{4}\b").expect("government id regex"));

/// Parameter names that legitimately carry 9-digit values (bank routing
/// numbers are 9 digits). Matched on the final path segment, case-insensitive.
const ALLOWED_PARAM_NAMES: &[&str] = &["account_number", "routing_number"];

/// Returns true when `text` contains a government-identifier-shaped substring.
pub fn contains_government_id(text: &str) -> bool {
    GOVERNMENT_ID.is_match(text)
}

/// Scans a tool-call parameter tree and returns the path of the first value
/// containing a government-identifier shape, or `None` when the tree is clean.
///
/// String and numeric leaves are both checked (a bare JSON number can encode
/// the same nine digits). Keys listed in the allowlist are skipped.
pub fn scan_params(params: &Value) -> Option<String> {
    scan(params, String::new())
}

fn allowed(path: &str) -> bool {
    let leaf = path.rsplit('.').next().unwrap_or(path);
    let leaf = leaf.split('[').next().unwrap_or(leaf);
    ALLOWED_PARAM_NAMES
        .iter()
        .any(|name| leaf.eq_ignore_ascii_case(name))
}

fn scan(value: &Value, path: String) -> Option<String> {
    match value {
        Value::String(s) => {
            if !allowed(&path) && contains_government_id(s) {
                Some(path)
            } else {
                None
            }
        }
        Value::Number(n) => {
            if !allowed(&path) && contains_government_id(&n.to_string()) {
                Some(path)
            } else {
                None
            }
        }
        Value::Array(items) => items
            .iter()
            .enumerate()
            .find_map(|(i, v)| scan(v, format!("{}[{}]", path, i))),
        Value::Object(map) => map.iter().find_map(|(k, v)| {
            let child = if path.is_empty() {
                k.clone()
            } else {
                format!("{}.{}", path, k)
            };
            scan(v, child)
        }),
        Value::Bool(_) | Value::Null => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn detects_dashed_and_plain_nine_digit_shapes() {
        assert!(contains_government_id("ssn is 123-45-6789"));
        assert!(contains_government_id("123456789"));
        assert!(contains_government_id("mixed 123-456789 form"));
    }

    #[test]
    fn ignores_longer_digit_runs_and_uuids() {
        assert!(!contains_government_id("account 1234567890"));
        assert!(!contains_government_id("12345678"));
        assert!(!contains_government_id("a1b2c3d4-e5f6-7890-abcd-ef0123456789"));
    }

    /// **Scenario**: a parameter value carrying an SSN shape is reported with
    /// its field path, whatever the parameter is called.
    #[test]
    fn scan_params_reports_offending_path() {
        let params = json!({
            "applicant_id": "a1b2c3d4-0000-0000-0000-000000000000",
            "documents": [{"reference": "ssn 987-65-4321"}]
        });
        assert_eq!(
            scan_params(&params).as_deref(),
            Some("documents[0].reference")
        );
    }

    #[test]
    fn scan_params_checks_numeric_leaves() {
        let params = json!({"id_number": 123456789});
        assert_eq!(scan_params(&params).as_deref(), Some("id_number"));
    }

    /// **Scenario**: routing numbers are 9 digits and explicitly allowed by
    /// parameter name.
    #[test]
    fn scan_params_allows_routing_and_account_numbers() {
        let params = json!({
            "routing_number": "021000021",
            "payment": {"account_number": "123456789"}
        });
        assert_eq!(scan_params(&params), None);
    }

    #[test]
    fn scan_params_clean_tree_returns_none() {
        let params = json!({
            "applicant_id": "a1b2c3d4",
            "amount": 300000.0,
            "notes": ["no identifiers here"]
        });
        assert_eq!(scan_params(&params), None);
    }
}
