use promptgate::protocol::canonical::TargetProtocol;
use promptgate::transform::request::call_items;
use promptgate::transform::trace::FieldAudit;
use promptgate::transform::validate::{validate_call_items, ValidationErrorKind};
use serde_json::json;

fn kinds(
    protocol: TargetProtocol,
    body: &serde_json::Value,
) -> (Vec<ValidationErrorKind>, FieldAudit) {
    let items = call_items(protocol, body);
    let mut audit = FieldAudit::default();
    let kinds = validate_call_items(&items, &mut audit)
        .into_iter()
        .map(|err| err.kind)
        .collect();
    (kinds, audit)
}

#[test]
fn test_every_problem_is_reported_at_once() {
    let body = json!({"input": [
        {"type": "function_call", "call_id": "a", "name": "", "arguments": "{}"},
        {"type": "function_call_output", "call_id": "a", "output": "1"},
        {"type": "function_call_output", "call_id": "a", "output": "2"},
        {"type": "function_call_output", "call_id": "ghost", "output": "3"},
        {"type": "function_call", "call_id": "b", "name": "f", "arguments": "{}"}
    ]});
    let (found, audit) = kinds(TargetProtocol::OpenAiResponses, &body);
    assert_eq!(
        found,
        vec![
            ValidationErrorKind::MissingRequired,
            ValidationErrorKind::Duplicate,
            ValidationErrorKind::Orphan,
            ValidationErrorKind::Unmatched,
        ]
    );
    assert_eq!(audit.missing_required_target_paths, vec!["/input/0/name"]);
}

#[test]
fn test_output_before_its_call_is_an_orphan() {
    let body = json!({"messages": [
        {"role": "tool", "tool_call_id": "call_1", "content": "early"},
        {"role": "assistant", "content": null, "tool_calls": [
            {"id": "call_1", "type": "function", "function": {"name": "f", "arguments": "{}"}}
        ]}
    ]});
    let (found, _) = kinds(TargetProtocol::OpenAiChat, &body);
    assert_eq!(found, vec![ValidationErrorKind::Orphan, ValidationErrorKind::Unmatched]);
}

#[test]
fn test_validation_does_not_touch_the_items() {
    let body = json!({"contents": [
        {"role": "model", "parts": [{"functionCall": {"id": "c1", "name": "f", "args": {}}}]},
        {"role": "user", "parts": [{"functionResponse": {"id": "c1", "name": "f", "response": {"result": ""}}}]}
    ]});
    let items = call_items(TargetProtocol::Gemini, &body);
    let before = items.clone();
    let mut audit = FieldAudit::default();
    assert!(validate_call_items(&items, &mut audit).is_empty());
    assert_eq!(items, before);
    assert_eq!(audit, FieldAudit::default());
}

#[test]
fn test_missing_output_value_is_required() {
    let body = json!({"contents": [
        {"role": "model", "parts": [{"functionCall": {"id": "c1", "name": "f", "args": {}}}]},
        {"role": "user", "parts": [{"functionResponse": {"id": "c1", "name": "f", "response": null}}]}
    ]});
    let (found, audit) = kinds(TargetProtocol::Gemini, &body);
    assert_eq!(found, vec![ValidationErrorKind::MissingRequired]);
    assert_eq!(
        audit.missing_required_target_paths,
        vec!["/contents/1/parts/0/functionResponse/response"]
    );
}
