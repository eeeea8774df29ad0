//! Top-level shape check for a rendered Responses body.

use serde_json::Value;

use crate::transform::trace::FieldAudit;
use crate::transform::validate::{ValidationError, ValidationErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expected {
    String,
    Array,
    Bool,
    /// `tool_choice` may be a mode string or a function selector object.
    StringOrObject,
}

impl Expected {
    fn matches(self, value: &Value) -> bool {
        match self {
            Expected::String => value.is_string(),
            Expected::Array => value.is_array(),
            Expected::Bool => value.is_boolean(),
            Expected::StringOrObject => value.is_string() || value.is_object(),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Expected::String => "string",
            Expected::Array => "array",
            Expected::Bool => "boolean",
            Expected::StringOrObject => "string or object",
        }
    }
}

const REQUIRED: &[(&str, Expected)] = &[
    ("model", Expected::String),
    ("instructions", Expected::String),
    ("input", Expected::Array),
    ("tools", Expected::Array),
    ("tool_choice", Expected::StringOrObject),
    ("parallel_tool_calls", Expected::Bool),
    ("store", Expected::Bool),
    ("stream", Expected::Bool),
    ("include", Expected::Array),
];

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Report missing or mistyped top-level fields; missing ones are also
/// recorded in `audit`.
pub fn validate_top_level(body: &Value, audit: &mut FieldAudit) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    for &(field, expected) in REQUIRED {
        let path = format!("/{field}");
        match body.get(field) {
            None | Some(Value::Null) => {
                audit.add_missing_required_target_path(&path);
                errors.push(ValidationError::new(
                    ValidationErrorKind::MissingRequired,
                    path,
                    format!("missing required field (expected {})", expected.name()),
                ));
            }
            Some(value) if !expected.matches(value) => errors.push(ValidationError::new(
                ValidationErrorKind::TypeMismatch,
                path,
                format!("expected {}, got {}", expected.name(), type_name(value)),
            )),
            Some(_) => {}
        }
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_complete_body_passes() {
        let body = json!({
            "model": "m", "instructions": "", "input": [], "tools": [],
            "tool_choice": "auto", "parallel_tool_calls": false, "store": false,
            "stream": true, "include": []
        });
        assert!(validate_top_level(&body, &mut FieldAudit::default()).is_empty());
    }

    #[test]
    fn test_missing_and_mistyped_fields() {
        let body = json!({
            "model": "m", "instructions": "", "input": {}, "tools": [],
            "tool_choice": {"type": "function", "name": "f"}, "store": "no",
            "stream": true, "include": []
        });
        let mut audit = FieldAudit::default();
        let errors = validate_top_level(&body, &mut audit);
        let summary: Vec<(ValidationErrorKind, &str)> = errors
            .iter()
            .map(|err| (err.kind, err.path.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (ValidationErrorKind::TypeMismatch, "/input"),
                (ValidationErrorKind::MissingRequired, "/parallel_tool_calls"),
                (ValidationErrorKind::TypeMismatch, "/store"),
            ]
        );
        assert_eq!(audit.missing_required_target_paths, vec!["/parallel_tool_calls"]);
    }
}
