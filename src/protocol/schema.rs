//! Tool parameter schema narrowing.
//!
//! [`sanitize_schema`] reduces a client JSON schema to the subset Gemini
//! function declarations accept. [`apply_tool_schema_policy`] performs the
//! lighter, configurable cleanup used for OpenAI-style targets.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const ALLOWED_KEYS: &[&str] = &[
    "type",
    "description",
    "properties",
    "required",
    "items",
    "enum",
    "format",
    "minimum",
    "maximum",
    "minLength",
    "maxLength",
    "pattern",
    "additionalProperties",
];

const ALLOWED_FORMATS: &[&str] = &[
    "int8",
    "int16",
    "int32",
    "int64",
    "uint8",
    "uint16",
    "uint32",
    "uint64",
    "float",
    "double",
    "date-time",
    "time",
    "date",
];

const COMBINATORS: &[&str] = &["anyOf", "oneOf", "allOf"];

/// Result of [`sanitize_schema`].
#[derive(Debug, Clone, PartialEq)]
pub struct SanitizeOutcome {
    pub schema: Value,
    /// Dotted paths of every dropped key.
    pub removed_paths: Vec<String>,
    pub warnings: Vec<String>,
}

impl SanitizeOutcome {
    #[must_use]
    pub fn is_lossless(&self) -> bool {
        self.removed_paths.is_empty() && self.warnings.is_empty()
    }
}

/// Narrow `schema` to the allow-listed keys.
///
/// Combinators keep only their first branch, which is sanitized and merged
/// into the enclosing node, so a sanitized schema sanitizes to itself.
#[must_use]
pub fn sanitize_schema(schema: &Value) -> SanitizeOutcome {
    let mut removed_paths = Vec::new();
    let mut warnings = Vec::new();
    let schema = match schema {
        Value::Object(map) => Value::Object(sanitize_node(
            map,
            &mut Vec::new(),
            &mut removed_paths,
            &mut warnings,
        )),
        other => other.clone(),
    };
    SanitizeOutcome {
        schema,
        removed_paths,
        warnings,
    }
}

fn dotted(path: &[String], key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        let mut out = path.join(".");
        out.push('.');
        out.push_str(key);
        out
    }
}

fn sanitize_node(
    node: &Map<String, Value>,
    path: &mut Vec<String>,
    removed: &mut Vec<String>,
    warnings: &mut Vec<String>,
) -> Map<String, Value> {
    let mut out = Map::new();
    let mut first_branches = Vec::new();

    for (key, value) in node {
        let key = key.as_str();
        if COMBINATORS.contains(&key) {
            let location = if path.is_empty() {
                "(root)".to_string()
            } else {
                path.join(".")
            };
            warnings.push(format!(
                "Combining keyword \"{key}\" at {location}: using first branch only"
            ));
            if let Some(Value::Object(branch)) = value.as_array().and_then(|arr| arr.first()) {
                path.push(key.to_string());
                path.push("0".to_string());
                first_branches.push(sanitize_node(branch, path, removed, warnings));
                path.truncate(path.len() - 2);
            }
            continue;
        }

        if !ALLOWED_KEYS.contains(&key) {
            removed.push(dotted(path, key));
            continue;
        }

        match (key, value) {
            ("format", Value::String(format)) if !ALLOWED_FORMATS.contains(&format.as_str()) => {
                removed.push(dotted(path, key));
            }
            ("properties", Value::Object(properties)) => {
                let mut sanitized = Map::new();
                for (name, property) in properties {
                    if let Value::Object(property) = property {
                        path.push(name.clone());
                        sanitized.insert(
                            name.clone(),
                            Value::Object(sanitize_node(property, path, removed, warnings)),
                        );
                        path.pop();
                    } else {
                        removed.push(dotted(path, name));
                    }
                }
                out.insert(key.to_string(), Value::Object(sanitized));
            }
            ("items" | "additionalProperties", Value::Object(inner)) => {
                path.push(key.to_string());
                let sanitized = sanitize_node(inner, path, removed, warnings);
                path.pop();
                out.insert(key.to_string(), Value::Object(sanitized));
            }
            ("items", Value::Array(tuple)) => {
                // Tuple validation is not expressible; keep the first element schema.
                warnings.push(format!(
                    "Tuple \"items\" at {}: using first element only",
                    dotted(path, key)
                ));
                if let Some(Value::Object(first)) = tuple.first() {
                    path.push(key.to_string());
                    let sanitized = sanitize_node(first, path, removed, warnings);
                    path.pop();
                    out.insert(key.to_string(), Value::Object(sanitized));
                }
            }
            _ => {
                out.insert(key.to_string(), value.clone());
            }
        }
    }

    for branch in first_branches {
        for (key, value) in branch {
            out.entry(key).or_insert(value);
        }
    }
    out
}

/// Cleanup knobs for tool parameters sent to OpenAI-style targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSchemaPolicy {
    #[serde(default)]
    pub remove_format: bool,
    #[serde(default = "default_true")]
    pub remove_schema: bool,
    #[serde(default)]
    pub remove_title: bool,
    #[serde(default)]
    pub remove_examples: bool,
    #[serde(default)]
    pub remove_default: bool,
    /// Add `additionalProperties: false` when the schema does not set it.
    #[serde(default)]
    pub strict_mode: bool,
    /// Value of the tool-level `strict` flag.
    #[serde(default)]
    pub strict: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ToolSchemaPolicy {
    fn default() -> Self {
        Self {
            remove_format: false,
            remove_schema: true,
            remove_title: false,
            remove_examples: false,
            remove_default: false,
            strict_mode: false,
            strict: false,
        }
    }
}

/// Normalize top-level tool parameters: default to an empty object schema
/// and strip the keys the policy names. Returns the removed keys.
pub fn apply_tool_schema_policy(schema: &Value, policy: &ToolSchemaPolicy) -> (Value, Vec<String>) {
    let mut map = match schema {
        Value::Object(map) if !map.is_empty() => map.clone(),
        _ => {
            let mut map = Map::new();
            map.insert("type".to_string(), Value::String("object".to_string()));
            map.insert("properties".to_string(), Value::Object(Map::new()));
            map
        }
    };

    let candidates = [
        (policy.remove_format, "format"),
        (policy.remove_schema, "$schema"),
        (policy.remove_title, "title"),
        (policy.remove_examples, "examples"),
        (policy.remove_default, "default"),
    ];
    let mut removed = Vec::new();
    for (enabled, key) in candidates {
        if enabled && map.remove(key).is_some() {
            removed.push(key.to_string());
        }
    }

    if map.get("type").and_then(Value::as_str) == Some("object") && !map.contains_key("properties")
    {
        map.insert("properties".to_string(), Value::Object(Map::new()));
    }
    if policy.strict_mode && !map.contains_key("additionalProperties") {
        map.insert("additionalProperties".to_string(), Value::Bool(false));
    }
    (Value::Object(map), removed)
}
