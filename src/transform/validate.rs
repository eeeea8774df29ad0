//! Structural checks on a translated request before it leaves the gateway.
//!
//! Each upstream encoder flattens its wire body into a list of [`CallItem`]s
//! (tool calls and tool outputs, in order); [`validate_call_items`] then runs
//! two independent passes over that list and reports every problem found.

use rustc_hash::FxHashMap;
use serde::Serialize;

use super::trace::FieldAudit;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationErrorKind {
    MissingRequired,
    TypeMismatch,
    /// An output whose call id has no earlier call.
    Orphan,
    /// A call with no matching output.
    Unmatched,
    /// More than one output (or call) for the same call id.
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationError {
    pub kind: ValidationErrorKind,
    /// JSON pointer into the translated body.
    pub path: String,
    pub message: String,
}

impl ValidationError {
    #[must_use]
    pub fn new(
        kind: ValidationErrorKind,
        path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            path: path.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallItemKind {
    Call,
    Output,
}

/// Field names used by a protocol, for error paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallItemFields {
    pub call_id: &'static str,
    pub name: &'static str,
    pub arguments: &'static str,
    pub output: &'static str,
}

/// A tool call or tool output extracted from a translated body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallItem {
    pub kind: CallItemKind,
    /// JSON pointer of the item itself.
    pub path: String,
    pub call_id: Option<String>,
    pub name: Option<String>,
    /// Serialized arguments, for calls.
    pub arguments: Option<String>,
    /// Whether a non-null output value is present, for outputs.
    pub has_output: bool,
    pub fields: CallItemFields,
}

impl CallItem {
    fn field_path(&self, field: &str) -> String {
        let mut out = String::with_capacity(self.path.len() + field.len() + 1);
        out.push_str(&self.path);
        out.push('/');
        out.push_str(field);
        out
    }

    fn call_id(&self) -> Option<&str> {
        self.call_id.as_deref().filter(|id| !id.is_empty())
    }
}

/// Run the required-field pass and the call-id symmetry pass.
///
/// Missing fields are also recorded as missing required target paths in
/// `audit`. The item list is never modified.
pub fn validate_call_items(items: &[CallItem], audit: &mut FieldAudit) -> Vec<ValidationError> {
    let mut errors = required_field_errors(items);
    for err in &errors {
        audit.add_missing_required_target_path(&err.path);
    }
    errors.extend(symmetry_errors(items));
    errors
}

fn required_field_errors(items: &[CallItem]) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    for item in items {
        if item.call_id().is_none() {
            errors.push(ValidationError::new(
                ValidationErrorKind::MissingRequired,
                item.field_path(item.fields.call_id),
                "call identifier is missing or empty",
            ));
        }
        match item.kind {
            CallItemKind::Call => {
                if item.name.as_deref().map_or(true, str::is_empty) {
                    errors.push(ValidationError::new(
                        ValidationErrorKind::MissingRequired,
                        item.field_path(item.fields.name),
                        "tool call name is missing or empty",
                    ));
                }
                if item.arguments.as_deref().map_or(true, str::is_empty) {
                    errors.push(ValidationError::new(
                        ValidationErrorKind::MissingRequired,
                        item.field_path(item.fields.arguments),
                        "tool call arguments are missing or empty",
                    ));
                }
            }
            CallItemKind::Output => {
                if !item.has_output {
                    errors.push(ValidationError::new(
                        ValidationErrorKind::MissingRequired,
                        item.field_path(item.fields.output),
                        "tool output is missing",
                    ));
                }
            }
        }
    }
    errors
}

struct CallSlot<'a> {
    item: &'a CallItem,
    outputs: usize,
}

fn symmetry_errors(items: &[CallItem]) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let mut calls: FxHashMap<&str, CallSlot<'_>> = FxHashMap::default();
    let mut call_order: Vec<&str> = Vec::new();

    for item in items {
        let Some(call_id) = item.call_id() else {
            continue;
        };
        match item.kind {
            CallItemKind::Call => {
                if calls.contains_key(call_id) {
                    errors.push(ValidationError::new(
                        ValidationErrorKind::Duplicate,
                        item.field_path(item.fields.call_id),
                        format!("call_id '{call_id}' is used by more than one call"),
                    ));
                    continue;
                }
                calls.insert(call_id, CallSlot { item, outputs: 0 });
                call_order.push(call_id);
            }
            CallItemKind::Output => match calls.get_mut(call_id) {
                None => errors.push(ValidationError::new(
                    ValidationErrorKind::Orphan,
                    item.field_path(item.fields.call_id),
                    format!("output for call_id '{call_id}' has no preceding call"),
                )),
                Some(slot) => {
                    slot.outputs += 1;
                    if slot.outputs > 1 {
                        errors.push(ValidationError::new(
                            ValidationErrorKind::Duplicate,
                            item.field_path(item.fields.call_id),
                            format!("call_id '{call_id}' has more than one output"),
                        ));
                    }
                }
            },
        }
    }

    for call_id in call_order {
        if let Some(slot) = calls.get(call_id) {
            if slot.outputs == 0 {
                errors.push(ValidationError::new(
                    ValidationErrorKind::Unmatched,
                    slot.item.field_path(slot.item.fields.call_id),
                    format!("call_id '{call_id}' has no matching output"),
                ));
            }
        }
    }
    errors
}
