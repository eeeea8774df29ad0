//! Request side of the engine: client request in, upstream request out.

use http::header::{HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use http::HeaderMap;
use serde::Deserialize;
use serde_json::Value;

use super::trace::{
    collect_json_pointers, DiffOp, FieldAudit, FieldDiff, TransformErrorKind, TransformTrace,
};
use super::validate::{validate_call_items, CallItem, ValidationError, ValidationErrorKind};
use crate::config::{SupplierConfig, TransformConfig};
use crate::error::GatewayError;
use crate::protocol::canonical::{
    CanonicalRequest, ContentBlock, MessageContent, TargetProtocol, ToolCallMapping,
};
use crate::protocol::tool_name::ShortNameMap;
use crate::protocol::{anthropic, gemini, openai_chat, openai_responses};
use crate::util::join_endpoint;

/// Version header sent to native Messages upstreams.
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Client headers never forwarded upstream, matched exactly.
const DROPPED_HEADERS: &[&str] = &[
    "x-api-key",
    "authorization",
    "host",
    "content-length",
    "connection",
    "keep-alive",
    "transfer-encoding",
    "te",
    "upgrade",
    "proxy-authorization",
    "accept-encoding",
    "x-goog-api-key",
];

/// Client header prefixes never forwarded upstream.
const DROPPED_PREFIXES: &[&str] = &["anthropic-", "x-stainless-"];

/// Read-only inputs shared by the per-protocol encoders.
#[derive(Debug, Clone, Copy)]
pub struct RenderContext<'a> {
    pub config: &'a TransformConfig,
    /// Calls recorded from the client history, by tool use id.
    pub mapping: &'a ToolCallMapping,
    /// Original to short tool names; empty unless the target limits names.
    pub tool_names: &'a ShortNameMap,
}

/// A resolved upstream: where to send and how to authenticate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupplierTarget {
    pub id: String,
    pub name: String,
    pub base_url: String,
    pub protocol: TargetProtocol,
    pub api_key: String,
    /// Configured protocol name that was not recognized; the target then
    /// forwards the client request unchanged.
    pub fallback_from: Option<String>,
}

impl SupplierTarget {
    /// Resolve a supplier. An unknown protocol name degrades to the native
    /// passthrough instead of failing.
    #[must_use]
    pub fn from_config(supplier: &SupplierConfig) -> Self {
        let (protocol, fallback_from) = match supplier.target_protocol() {
            Some(protocol) => (protocol, None),
            None => {
                tracing::warn!(
                    supplier = %supplier.id,
                    protocol = %supplier.protocol,
                    "unknown supplier protocol, forwarding requests unchanged"
                );
                (TargetProtocol::Anthropic, Some(supplier.protocol.clone()))
            }
        };
        Self {
            id: supplier.id.clone(),
            name: supplier.display_name().to_string(),
            base_url: supplier.base_url.clone(),
            protocol,
            api_key: supplier.api_key.clone(),
            fallback_from,
        }
    }
}

/// The translated request, ready for the HTTP client.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: http::Method,
    pub url: url::Url,
    pub headers: HeaderMap,
    pub body: Value,
}

/// Everything the response side needs from the request side.
#[derive(Debug)]
pub struct TransformedRequest {
    pub outbound: OutboundRequest,
    pub protocol: TargetProtocol,
    /// Client model name, used when the upstream omits one.
    pub model: String,
    pub stream: bool,
    pub tool_call_mapping: ToolCallMapping,
    pub tool_names: ShortNameMap,
    pub trace: TransformTrace,
}

/// A failed transformation together with what the trace recorded so far.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct RequestTransformError {
    pub error: GatewayError,
    pub trace: Box<TransformTrace>,
}

/// Translate a client request body for `target`.
///
/// Runs the `parse`, `render` and `validate` steps, recording each in the
/// trace. Structural validation failures stop the request before anything
/// is sent.
///
/// # Errors
///
/// Returns [`GatewayError::InvalidRequest`] when the body is not a valid
/// client request, [`GatewayError::Validation`] when the translated body
/// fails the call checks, and [`GatewayError::Config`] for a bad base URL.
pub fn transform_request(
    body: &Value,
    client_headers: &HeaderMap,
    target: &SupplierTarget,
    config: &TransformConfig,
) -> Result<TransformedRequest, RequestTransformError> {
    let mut trace = TransformTrace::new(&target.id, &target.name);
    trace.push_chain(&format!("anthropic->{}", target.protocol.as_str()));
    if let Some(requested) = target.fallback_from.as_deref() {
        trace.warn(format!(
            "Unknown protocol '{requested}' for supplier '{}'; using passthrough",
            target.id
        ));
        trace.set_metadata("protocolFallback", requested);
    }
    let pointers = collect_json_pointers(body);
    trace
        .audit
        .add_source_paths(pointers.iter().map(String::as_str));

    let parsed = trace.run_step("parse", |trace| {
        CanonicalRequest::deserialize(body).map_err(|err| {
            trace.error(TransformErrorKind::ParseError, "parse", err.to_string(), None);
            GatewayError::InvalidRequest(err.to_string())
        })
    });
    let request = match parsed {
        Ok(request) => request,
        Err(error) => return Err(failed(error, trace)),
    };

    render_request(&request, client_headers, target, config, trace)
}

/// Translate an already parsed client request for `target`.
///
/// # Errors
///
/// See [`transform_request`].
pub fn render_request(
    request: &CanonicalRequest,
    client_headers: &HeaderMap,
    target: &SupplierTarget,
    config: &TransformConfig,
    mut trace: TransformTrace,
) -> Result<TransformedRequest, RequestTransformError> {
    let protocol = target.protocol;
    let mapping = record_tool_calls(request);
    let tool_names = if protocol == TargetProtocol::OpenAiResponses {
        ShortNameMap::build(tool_names_of(request), config.tool_name_limit)
    } else {
        ShortNameMap::default()
    };
    trace.set_metadata("messageCount", request.messages.len());
    trace.set_metadata("toolCount", request.tools.len());
    trace.set_metadata("toolCallMappings", mapping.len());
    if tool_names.has_renames() {
        trace.set_metadata("renamedTools", tool_names.reverse_renames().len());
    }

    let ctx = RenderContext {
        config,
        mapping: &mapping,
        tool_names: &tool_names,
    };
    let rendered = trace.run_step("render", |trace| encode_request(protocol, request, &ctx, trace));
    let body = match rendered {
        Ok(body) => body,
        Err(error) => return Err(failed(error, trace)),
    };
    let pointers = collect_json_pointers(&body);
    trace
        .audit
        .add_target_paths(pointers.iter().map(String::as_str));
    record_diffs(&body, &mut trace.audit);
    trace.set_metadata("contentUnits", content_units(protocol, &body));

    if let Err(error) = trace.run_step("validate", |trace| validate_body(protocol, &body, trace)) {
        tracing::warn!(
            supplier = %target.id,
            protocol = protocol.as_str(),
            error = %error,
            "translated request failed validation"
        );
        return Err(failed(error, trace));
    }

    let url = match endpoint_url(target, &request.model, request.stream) {
        Ok(url) => url,
        Err(error) => return Err(failed(error, trace)),
    };
    let headers = upstream_headers(client_headers, target, request.stream);
    tracing::debug!(
        supplier = %target.id,
        protocol = protocol.as_str(),
        url = %url,
        stream = request.stream,
        "request translated"
    );

    Ok(TransformedRequest {
        outbound: OutboundRequest {
            method: http::Method::POST,
            url,
            headers,
            body,
        },
        protocol,
        model: request.model.clone(),
        stream: request.stream,
        tool_call_mapping: mapping,
        tool_names,
        trace,
    })
}

fn failed(error: GatewayError, trace: TransformTrace) -> RequestTransformError {
    RequestTransformError {
        error,
        trace: Box::new(trace),
    }
}

const DIFF_PREVIEW_CHARS: usize = 80;

/// Defaulted fields are additions the client never sent; unmapped source
/// fields are removals.
fn record_diffs(body: &Value, audit: &mut FieldAudit) {
    let added: Vec<(String, String)> = audit
        .defaulted
        .iter()
        .filter_map(|entry| {
            let value = body.pointer(&entry.path)?;
            Some((entry.path.clone(), value.to_string()))
        })
        .collect();
    for (path, value) in added {
        audit.add_extra_target_path(&path);
        audit.add_diff(FieldDiff {
            op: DiffOp::Add,
            path,
            value_preview: Some(value.chars().take(DIFF_PREVIEW_CHARS).collect()),
        });
    }
    let removed = audit.unmapped_source_paths.clone();
    for path in removed {
        audit.add_diff(FieldDiff {
            op: DiffOp::Remove,
            path,
            value_preview: None,
        });
    }
}

/// Every `tool_use` of the client history, by id.
fn record_tool_calls(request: &CanonicalRequest) -> ToolCallMapping {
    let mut mapping = ToolCallMapping::new();
    for message in &request.messages {
        for block in message.blocks().iter() {
            if let ContentBlock::ToolUse { id, name, input } = block {
                mapping.record(id, name, input);
            }
        }
    }
    mapping
}

fn tool_names_of(request: &CanonicalRequest) -> Vec<&str> {
    let mut names: Vec<&str> = request.tools.iter().map(|tool| tool.name.as_str()).collect();
    for message in &request.messages {
        if let MessageContent::Blocks(blocks) = &message.content {
            for block in blocks {
                if let ContentBlock::ToolUse { name, .. } = block {
                    if !names.contains(&name.as_str()) {
                        names.push(name);
                    }
                }
            }
        }
    }
    names
}

/// Dispatch to the encoder of `protocol`.
///
/// # Errors
///
/// Propagates the encoder's error.
pub fn encode_request(
    protocol: TargetProtocol,
    request: &CanonicalRequest,
    ctx: &RenderContext<'_>,
    trace: &mut TransformTrace,
) -> Result<Value, GatewayError> {
    match protocol {
        TargetProtocol::Anthropic => anthropic::encoder::encode_request(request, ctx, trace),
        TargetProtocol::OpenAiChat => openai_chat::encoder::encode_request(request, ctx, trace),
        TargetProtocol::OpenAiResponses => {
            openai_responses::encoder::encode_request(request, ctx, trace)
        }
        TargetProtocol::Gemini => gemini::encoder::encode_request(request, ctx, trace),
    }
}

/// Tool calls and outputs of a translated body, in order.
#[must_use]
pub fn call_items(protocol: TargetProtocol, body: &Value) -> Vec<CallItem> {
    match protocol {
        TargetProtocol::Anthropic => anthropic::encoder::call_items(body),
        TargetProtocol::OpenAiChat => openai_chat::encoder::call_items(body),
        TargetProtocol::OpenAiResponses => openai_responses::encoder::call_items(body),
        TargetProtocol::Gemini => gemini::encoder::call_items(body),
    }
}

/// Run every structural check on a translated body.
///
/// # Errors
///
/// Returns [`GatewayError::Validation`] with every problem found.
pub fn validate_body(
    protocol: TargetProtocol,
    body: &Value,
    trace: &mut TransformTrace,
) -> Result<(), GatewayError> {
    let items = call_items(protocol, body);
    let mut errors = validate_call_items(&items, &mut trace.audit);
    if protocol == TargetProtocol::OpenAiResponses {
        errors.extend(openai_responses::validate::validate_top_level(
            body,
            &mut trace.audit,
        ));
    }
    let symmetric = !errors.iter().any(|err| {
        matches!(
            err.kind,
            ValidationErrorKind::Orphan
                | ValidationErrorKind::Unmatched
                | ValidationErrorKind::Duplicate
        )
    });
    trace.set_metadata("callIdSymmetryValid", symmetric);
    trace.set_metadata("callItems", items.len());
    if errors.is_empty() {
        return Ok(());
    }
    for err in &errors {
        trace.error(
            trace_error_kind(err),
            "validate",
            err.message.clone(),
            Some(err.path.clone()),
        );
    }
    Err(GatewayError::Validation(errors))
}

fn trace_error_kind(err: &ValidationError) -> TransformErrorKind {
    match err.kind {
        ValidationErrorKind::MissingRequired => TransformErrorKind::MissingRequired,
        ValidationErrorKind::TypeMismatch => TransformErrorKind::TypeMismatch,
        ValidationErrorKind::Orphan
        | ValidationErrorKind::Unmatched
        | ValidationErrorKind::Duplicate => TransformErrorKind::ValidationError,
    }
}

fn content_units(protocol: TargetProtocol, body: &Value) -> usize {
    let key = match protocol {
        TargetProtocol::Anthropic | TargetProtocol::OpenAiChat => "messages",
        TargetProtocol::OpenAiResponses => "input",
        TargetProtocol::Gemini => "contents",
    };
    body.get(key).and_then(Value::as_array).map_or(0, Vec::len)
}

/// Upstream URL for `target`.
///
/// # Errors
///
/// Returns [`GatewayError::Config`] when the base URL does not parse.
pub fn endpoint_url(
    target: &SupplierTarget,
    model: &str,
    stream: bool,
) -> Result<url::Url, GatewayError> {
    match target.protocol {
        TargetProtocol::Anthropic => join_endpoint(&target.base_url, "v1", "messages", None),
        TargetProtocol::OpenAiChat => {
            join_endpoint(&target.base_url, "v1", "chat/completions", None)
        }
        TargetProtocol::OpenAiResponses => join_endpoint(&target.base_url, "v1", "responses", None),
        TargetProtocol::Gemini => gemini::encoder::endpoint_url(&target.base_url, model, stream),
    }
}

fn is_dropped_header(name: &str) -> bool {
    DROPPED_HEADERS.contains(&name)
        || DROPPED_PREFIXES.iter().any(|prefix| name.starts_with(prefix))
}

/// Client headers filtered for the upstream, with the supplier's credential.
#[must_use]
pub fn upstream_headers(client: &HeaderMap, target: &SupplierTarget, stream: bool) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(client.len() + 4);
    for (name, value) in client {
        if !is_dropped_header(name.as_str()) {
            headers.append(name.clone(), value.clone());
        }
    }

    let key = target.api_key.as_str();
    match target.protocol {
        TargetProtocol::Anthropic => {
            if let Ok(value) = HeaderValue::from_str(key) {
                headers.insert(HeaderName::from_static("x-api-key"), value);
            }
            headers.insert(
                HeaderName::from_static("anthropic-version"),
                HeaderValue::from_static(ANTHROPIC_VERSION),
            );
        }
        TargetProtocol::OpenAiChat | TargetProtocol::OpenAiResponses => {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {key}")) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        TargetProtocol::Gemini => {
            if let Ok(value) = HeaderValue::from_str(key) {
                headers.insert(HeaderName::from_static("x-goog-api-key"), value);
            }
        }
    }
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if stream {
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
    } else {
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::trace::DefaultSource;
    use serde_json::json;

    fn target(protocol: TargetProtocol, base_url: &str) -> SupplierTarget {
        SupplierTarget {
            id: "s1".into(),
            name: "Supplier".into(),
            base_url: base_url.into(),
            protocol,
            api_key: "sk-test".into(),
            fallback_from: None,
        }
    }

    fn tool_loop() -> Value {
        json!({
            "model": "m",
            "stream": true,
            "messages": [
                {"role": "user", "content": "weather?"},
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "toolu_1", "name": "get_weather", "input": {"location": "Tokyo"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": "22°C"}
                ]}
            ]
        })
    }

    #[test]
    fn test_steps_and_metadata_are_recorded() {
        let transformed = transform_request(
            &tool_loop(),
            &HeaderMap::new(),
            &target(TargetProtocol::OpenAiResponses, "https://api.example.com"),
            &TransformConfig::default(),
        )
        .unwrap();
        let trace = &transformed.trace;
        let steps: Vec<&str> = trace.steps.iter().map(|step| step.name.as_str()).collect();
        assert_eq!(steps, vec!["parse", "render", "validate"]);
        assert!(trace.is_success());
        assert!(trace.metadata_flag("callIdSymmetryValid"));
        assert_eq!(trace.metadata["toolCallMappings"], 1);
        assert_eq!(trace.chain, vec!["anthropic->openai-responses"]);
        assert!(trace.audit.source_paths.iter().any(|path| path == "/messages/1/content/0/id"));
        assert!(trace.audit.target_paths.iter().any(|path| path == "/input/1/call_id"));
        assert!(trace
            .audit
            .defaulted
            .iter()
            .any(|entry| entry.path == "/store" && entry.source == DefaultSource::ProtocolDefault));
        assert!(trace.audit.extra_target_paths.iter().any(|path| path == "/store"));
        assert!(trace.audit.diffs.iter().any(|diff| diff.op == DiffOp::Add
            && diff.path == "/store"
            && diff.value_preview.as_deref() == Some("false")));
        assert_eq!(transformed.outbound.url.as_str(), "https://api.example.com/v1/responses");
        assert_eq!(transformed.tool_call_mapping.tool_name("toolu_1"), Some("get_weather"));
    }

    #[test]
    fn test_orphan_result_is_rejected_before_sending() {
        let mut body = tool_loop();
        body["messages"][1]["content"] = json!("no call here");
        for protocol in [
            TargetProtocol::Anthropic,
            TargetProtocol::OpenAiChat,
            TargetProtocol::OpenAiResponses,
            TargetProtocol::Gemini,
        ] {
            let err = transform_request(
                &body,
                &HeaderMap::new(),
                &target(protocol, "https://api.example.com"),
                &TransformConfig::default(),
            )
            .unwrap_err();
            match &err.error {
                GatewayError::Validation(errors) => {
                    let orphans = errors
                        .iter()
                        .filter(|err| err.kind == ValidationErrorKind::Orphan)
                        .count();
                    assert_eq!(orphans, 1, "{protocol:?}: {errors:?}");
                }
                other => panic!("{protocol:?}: unexpected {other:?}"),
            }
            assert!(!err.trace.metadata_flag("callIdSymmetryValid"));
            assert!(!err.trace.is_success());
        }
    }

    #[test]
    fn test_unknown_protocol_degrades_to_passthrough() {
        let supplier = SupplierConfig {
            id: "ds".into(),
            name: String::new(),
            base_url: "https://api.deepseek.example".into(),
            protocol: "deepseek".into(),
            api_key: "sk-test".into(),
            models: Vec::new(),
            is_default: false,
        };
        let target = SupplierTarget::from_config(&supplier);
        assert_eq!(target.protocol, TargetProtocol::Anthropic);
        assert_eq!(target.fallback_from.as_deref(), Some("deepseek"));

        let transformed = transform_request(
            &tool_loop(),
            &HeaderMap::new(),
            &target,
            &TransformConfig::default(),
        )
        .unwrap();
        let trace = &transformed.trace;
        assert!(trace.is_success());
        assert_eq!(trace.metadata["protocolFallback"], "deepseek");
        assert!(trace.warnings.iter().any(|warning| warning.contains("'deepseek'")));
        assert_eq!(transformed.outbound.url.path(), "/v1/messages");
        assert_eq!(transformed.outbound.body["max_tokens"], 4096);
        assert_eq!(transformed.outbound.body["messages"][1]["content"][0]["id"], "toolu_1");
    }

    #[test]
    fn test_invalid_body_fails_parse_step() {
        let err = transform_request(
            &json!({"messages": "nope"}),
            &HeaderMap::new(),
            &target(TargetProtocol::OpenAiChat, "https://api.example.com"),
            &TransformConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err.error, GatewayError::InvalidRequest(_)));
        assert_eq!(err.trace.steps.len(), 1);
        assert_eq!(err.trace.errors[0].kind, TransformErrorKind::ParseError);
    }

    #[test]
    fn test_header_mapping_per_protocol() {
        let mut client = HeaderMap::new();
        client.insert("x-api-key", HeaderValue::from_static("client-key"));
        client.insert("anthropic-version", HeaderValue::from_static("2023-06-01"));
        client.insert("anthropic-beta", HeaderValue::from_static("tools"));
        client.insert("x-stainless-os", HeaderValue::from_static("Linux"));
        client.insert("user-agent", HeaderValue::from_static("cli/1.0"));

        let gemini = upstream_headers(&client, &target(TargetProtocol::Gemini, "https://g"), true);
        assert_eq!(gemini.get("x-goog-api-key").unwrap(), "sk-test");
        assert!(gemini.get("x-api-key").is_none());
        assert!(gemini.get("anthropic-beta").is_none());
        assert!(gemini.get("x-stainless-os").is_none());
        assert_eq!(gemini.get("user-agent").unwrap(), "cli/1.0");
        assert_eq!(gemini.get(ACCEPT).unwrap(), "text/event-stream");

        let chat =
            upstream_headers(&client, &target(TargetProtocol::OpenAiChat, "https://o"), false);
        assert_eq!(chat.get(AUTHORIZATION).unwrap(), "Bearer sk-test");
        assert_eq!(chat.get(CONTENT_TYPE).unwrap(), "application/json");

        let native =
            upstream_headers(&client, &target(TargetProtocol::Anthropic, "https://a"), false);
        assert_eq!(native.get("x-api-key").unwrap(), "sk-test");
        assert_eq!(native.get("anthropic-version").unwrap(), ANTHROPIC_VERSION);
        assert!(native.get("anthropic-beta").is_none());
    }

    #[test]
    fn test_endpoint_urls() {
        let cases = [
            (TargetProtocol::Anthropic, "https://api.anthropic.com", "/v1/messages"),
            (TargetProtocol::OpenAiChat, "https://api.openai.com/v1", "/v1/chat/completions"),
            (
                TargetProtocol::OpenAiChat,
                "https://proxy/v1/chat/completions",
                "/v1/chat/completions",
            ),
            (
                TargetProtocol::OpenAiResponses,
                "https://chatgpt.com/backend-api/codex",
                "/backend-api/codex/responses",
            ),
        ];
        for (protocol, base, path) in cases {
            let url = endpoint_url(&target(protocol, base), "m", false).unwrap();
            assert_eq!(url.path(), path, "{protocol:?} {base}");
        }
        let gemini = endpoint_url(
            &target(TargetProtocol::Gemini, "https://generativelanguage.googleapis.com/v1beta"),
            "gemini-2.5-flash",
            true,
        )
        .unwrap();
        assert_eq!(
            gemini.as_str(),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-flash:streamGenerateContent?alt=sse"
        );
    }
}
