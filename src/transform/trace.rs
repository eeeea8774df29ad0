//! Per-request record of what the engine did.
//!
//! A [`TransformTrace`] is created when a request is routed to a supplier and
//! is written to by every stage: request rendering, validation, response
//! decoding and stream transcoding. It is read-only once the request ends.

use std::time::Instant;

use serde::Serialize;
use serde_json::{Map, Value};

/// Classification of an error recorded in a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformErrorKind {
    ParseError,
    ValidationError,
    MappingError,
    SseError,
    InvariantViolation,
    MissingRequired,
    TypeMismatch,
}

/// One executed stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceStep {
    pub name: String,
    pub duration_micros: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceError {
    pub kind: TransformErrorKind,
    pub step: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// A JSON-patch style change between source and target.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDiff {
    pub op: DiffOp,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_preview: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffOp {
    Add,
    Remove,
    Replace,
}

/// Where a defaulted field's value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultSource {
    ProtocolDefault,
    Config,
    Template,
    Inferred,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DefaultedField {
    pub path: String,
    pub source: DefaultSource,
    pub reason: String,
}

/// Field-level audit: which paths were read, written, dropped or defaulted.
///
/// Paths are JSON pointers. Every `add_*` method ignores duplicates.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldAudit {
    pub source_paths: Vec<String>,
    pub target_paths: Vec<String>,
    pub extra_target_paths: Vec<String>,
    pub missing_required_target_paths: Vec<String>,
    pub unmapped_source_paths: Vec<String>,
    pub diffs: Vec<FieldDiff>,
    pub defaulted: Vec<DefaultedField>,
}

fn push_unique(list: &mut Vec<String>, path: &str) {
    if !list.iter().any(|existing| existing == path) {
        list.push(path.to_string());
    }
}

impl FieldAudit {
    pub fn add_source_paths<'a>(&mut self, paths: impl IntoIterator<Item = &'a str>) {
        for path in paths {
            push_unique(&mut self.source_paths, path);
        }
    }

    pub fn add_target_paths<'a>(&mut self, paths: impl IntoIterator<Item = &'a str>) {
        for path in paths {
            push_unique(&mut self.target_paths, path);
        }
    }

    pub fn add_extra_target_path(&mut self, path: &str) {
        push_unique(&mut self.extra_target_paths, path);
    }

    pub fn add_missing_required_target_path(&mut self, path: &str) {
        push_unique(&mut self.missing_required_target_paths, path);
    }

    pub fn add_unmapped_source_path(&mut self, path: &str) {
        push_unique(&mut self.unmapped_source_paths, path);
    }

    pub fn add_diff(&mut self, diff: FieldDiff) {
        if !self
            .diffs
            .iter()
            .any(|existing| existing.op == diff.op && existing.path == diff.path)
        {
            self.diffs.push(diff);
        }
    }

    pub fn add_defaulted(&mut self, path: &str, source: DefaultSource, reason: impl Into<String>) {
        if !self.defaulted.iter().any(|existing| existing.path == path) {
            self.defaulted.push(DefaultedField {
                path: path.to_string(),
                source,
                reason: reason.into(),
            });
        }
    }
}

/// Collect every JSON pointer that addresses a leaf or container in `value`.
#[must_use]
pub fn collect_json_pointers(value: &Value) -> Vec<String> {
    let mut out = Vec::new();
    collect_pointers_into(value, &mut String::new(), &mut out);
    out
}

fn collect_pointers_into(value: &Value, prefix: &mut String, out: &mut Vec<String>) {
    let len = prefix.len();
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                prefix.push('/');
                push_escaped_pointer_token(prefix, key);
                out.push(prefix.clone());
                collect_pointers_into(child, prefix, out);
                prefix.truncate(len);
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                prefix.push('/');
                prefix.push_str(&index.to_string());
                out.push(prefix.clone());
                collect_pointers_into(child, prefix, out);
                prefix.truncate(len);
            }
        }
        _ => {}
    }
}

fn push_escaped_pointer_token(out: &mut String, token: &str) {
    for ch in token.chars() {
        match ch {
            '~' => out.push_str("~0"),
            '/' => out.push_str("~1"),
            other => out.push(other),
        }
    }
}

/// Per-request transformation record exposed to the dashboard.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformTrace {
    pub supplier_id: String,
    pub supplier_name: String,
    /// Names of the transformers applied, in order.
    pub chain: Vec<String>,
    pub steps: Vec<TraceStep>,
    pub warnings: Vec<String>,
    pub errors: Vec<TraceError>,
    pub metadata: Map<String, Value>,
    pub audit: FieldAudit,
    #[serde(skip)]
    started_at: Option<Instant>,
}

impl TransformTrace {
    #[must_use]
    pub fn new(supplier_id: impl Into<String>, supplier_name: impl Into<String>) -> Self {
        Self {
            supplier_id: supplier_id.into(),
            supplier_name: supplier_name.into(),
            chain: Vec::new(),
            steps: Vec::new(),
            warnings: Vec::new(),
            errors: Vec::new(),
            metadata: Map::new(),
            audit: FieldAudit::default(),
            started_at: Some(Instant::now()),
        }
    }

    pub fn push_chain(&mut self, transformer: &str) {
        self.chain.push(transformer.to_string());
    }

    /// Run `stage` as a named step, recording its duration and outcome.
    ///
    /// A failing step records a [`TransformErrorKind::MappingError`]; callers
    /// that know better record a more specific kind themselves.
    pub fn run_step<T, E: std::fmt::Display>(
        &mut self,
        name: &str,
        stage: impl FnOnce(&mut Self) -> Result<T, E>,
    ) -> Result<T, E> {
        let started = Instant::now();
        let result = stage(self);
        let duration_micros = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
        let error = result.as_ref().err().map(ToString::to_string);
        if let Some(message) = &error {
            if !self.errors.iter().any(|err| err.step == name) {
                self.errors.push(TraceError {
                    kind: TransformErrorKind::MappingError,
                    step: name.to_string(),
                    message: message.clone(),
                    path: None,
                });
            }
        }
        self.steps.push(TraceStep {
            name: name.to_string(),
            duration_micros,
            success: error.is_none(),
            error,
        });
        result
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        if !self.warnings.contains(&message) {
            self.warnings.push(message);
        }
    }

    pub fn error(
        &mut self,
        kind: TransformErrorKind,
        step: &str,
        message: impl Into<String>,
        path: Option<String>,
    ) {
        self.errors.push(TraceError {
            kind,
            step: step.to_string(),
            message: message.into(),
            path,
        });
    }

    pub fn set_metadata(&mut self, key: &str, value: impl Into<Value>) {
        self.metadata.insert(key.to_string(), value.into());
    }

    /// Add `delta` to a numeric metadata counter.
    pub fn bump_metadata(&mut self, key: &str, delta: u64) {
        let current = self.metadata.get(key).and_then(Value::as_u64).unwrap_or(0);
        self.metadata
            .insert(key.to_string(), Value::from(current.saturating_add(delta)));
    }

    #[must_use]
    pub fn metadata_flag(&self, key: &str) -> bool {
        self.metadata.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.errors.is_empty() && self.steps.iter().all(|step| step.success)
    }

    /// Milliseconds since the trace was created.
    #[must_use]
    pub fn elapsed_millis(&self) -> u64 {
        self.started_at.map_or(0, |started| {
            u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
        })
    }
}
