use http::HeaderMap;
use promptgate::config::TransformConfig;
use promptgate::error::GatewayError;
use promptgate::protocol::canonical::TargetProtocol;
use promptgate::protocol::schema::sanitize_schema;
use promptgate::transform::request::{call_items, transform_request, SupplierTarget};
use promptgate::transform::trace::FieldAudit;
use promptgate::transform::validate::{validate_call_items, ValidationErrorKind};
use serde_json::{json, Value};

const ALL: [TargetProtocol; 4] = [
    TargetProtocol::Anthropic,
    TargetProtocol::OpenAiChat,
    TargetProtocol::OpenAiResponses,
    TargetProtocol::Gemini,
];

fn target(protocol: TargetProtocol) -> SupplierTarget {
    SupplierTarget {
        id: "test".to_string(),
        name: "Test".to_string(),
        base_url: "https://upstream.example".to_string(),
        protocol,
        api_key: "sk-test".to_string(),
        fallback_from: None,
    }
}

fn tool_loop() -> Value {
    json!({
        "model": "m",
        "max_tokens": 512,
        "tools": [{
            "name": "get_weather",
            "description": "Current weather",
            "input_schema": {"type": "object", "properties": {"location": {"type": "string"}}}
        }],
        "messages": [
            {"role": "user", "content": "Weather in Tokyo?"},
            {"role": "assistant", "content": [
                {"type": "text", "text": "Let me check."},
                {"type": "tool_use", "id": "toolu_1", "name": "get_weather", "input": {"location": "Tokyo"}}
            ]},
            {"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": "toolu_1", "content": "22°C"}
            ]}
        ]
    })
}

fn validation_errors(body: &Value, protocol: TargetProtocol) -> Vec<ValidationErrorKind> {
    let config = TransformConfig::default();
    match transform_request(body, &HeaderMap::new(), &target(protocol), &config) {
        Ok(_) => Vec::new(),
        Err(failure) => match failure.error {
            GatewayError::Validation(errors) => errors.into_iter().map(|err| err.kind).collect(),
            other => panic!("{protocol:?}: unexpected error {other:?}"),
        },
    }
}

#[test]
fn test_tool_loop_is_symmetric_for_every_target() {
    for protocol in ALL {
        let transformed = transform_request(
            &tool_loop(),
            &HeaderMap::new(),
            &target(protocol),
            &TransformConfig::default(),
        )
        .unwrap_or_else(|failure| panic!("{protocol:?}: {}", failure.error));

        let items = call_items(protocol, &transformed.outbound.body);
        assert_eq!(items.len(), 2, "{protocol:?}: {items:?}");
        let mut audit = FieldAudit::default();
        assert!(validate_call_items(&items, &mut audit).is_empty(), "{protocol:?}");
        assert!(audit.missing_required_target_paths.is_empty());
        assert!(transformed.trace.is_success(), "{protocol:?}");
    }
}

#[test]
fn test_removing_the_call_leaves_one_orphan() {
    let mut body = tool_loop();
    body["messages"][1]["content"] = json!([{"type": "text", "text": "Let me check."}]);
    for protocol in ALL {
        assert_eq!(
            validation_errors(&body, protocol),
            vec![ValidationErrorKind::Orphan],
            "{protocol:?}"
        );
    }
}

#[test]
fn test_removing_the_result_leaves_one_unmatched() {
    let mut body = tool_loop();
    body["messages"][2]["content"] = json!("never mind");
    for protocol in ALL {
        assert_eq!(
            validation_errors(&body, protocol),
            vec![ValidationErrorKind::Unmatched],
            "{protocol:?}"
        );
    }
}

#[test]
fn test_adjacent_text_blocks_are_consolidated() {
    let body = json!({
        "model": "m",
        "messages": [{"role": "user", "content": [
            {"type": "text", "text": "Hello "},
            {"type": "text", "text": "world!"}
        ]}]
    });
    let render = |protocol| {
        transform_request(&body, &HeaderMap::new(), &target(protocol), &TransformConfig::default())
            .unwrap_or_else(|failure| panic!("{protocol:?}: {}", failure.error))
            .outbound
            .body
    };

    let chat = render(TargetProtocol::OpenAiChat);
    assert_eq!(chat["messages"][0]["content"], "Hello world!");

    let responses = render(TargetProtocol::OpenAiResponses);
    assert_eq!(
        responses["input"][0]["content"],
        json!([{"type": "input_text", "text": "Hello world!"}])
    );

    let gemini = render(TargetProtocol::Gemini);
    assert_eq!(gemini["contents"][0]["parts"], json!([{"text": "Hello world!"}]));
}

#[test]
fn test_trace_records_each_request_side_decision() {
    let transformed = transform_request(
        &tool_loop(),
        &HeaderMap::new(),
        &target(TargetProtocol::Gemini),
        &TransformConfig::default(),
    )
    .unwrap();
    let trace = &transformed.trace;
    assert_eq!(trace.chain, vec!["anthropic->gemini"]);
    assert_eq!(trace.metadata["messageCount"], 3);
    assert_eq!(trace.metadata["toolCount"], 1);
    assert_eq!(trace.metadata["toolCallMappings"], 1);
    assert!(trace.metadata.contains_key("contentUnits"));
    assert!(trace.steps.iter().all(|step| step.success));
    assert_eq!(
        transformed.outbound.url.as_str(),
        "https://upstream.example/v1beta/models/m:generateContent"
    );
    assert_eq!(transformed.outbound.headers.get("x-goog-api-key").unwrap(), "sk-test");
}

#[test]
fn test_schema_sanitizing_is_idempotent() {
    let schema = json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "additionalProperties": false,
        "properties": {
            "path": {"type": "string", "format": "uri", "examples": ["a"]},
            "mode": {"anyOf": [{"type": "string"}, {"type": "null"}]},
            "items": {"type": "array", "items": {"type": "object", "properties": {"x": {"type": "integer", "exclusiveMinimum": 0}}}}
        },
        "required": ["path"]
    });
    let first = sanitize_schema(&schema);
    assert!(!first.removed_paths.is_empty());
    let second = sanitize_schema(&first.schema);
    assert_eq!(second.schema, first.schema);
    assert!(second.removed_paths.is_empty(), "{:?}", second.removed_paths);
    assert!(second.warnings.is_empty(), "{:?}", second.warnings);
}
