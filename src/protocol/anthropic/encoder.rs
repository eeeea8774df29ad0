use serde_json::Value;

use crate::error::GatewayError;
use crate::protocol::canonical::CanonicalRequest;
use crate::protocol::openai_chat::encoder::str_at;
use crate::transform::request::RenderContext;
use crate::transform::trace::{DefaultSource, TransformTrace};
use crate::transform::validate::{CallItem, CallItemFields, CallItemKind};

/// `max_tokens` sent when the client omitted it; the Messages API requires one.
pub const DEFAULT_MAX_TOKENS: u64 = 4096;

const TOOL_USE_FIELDS: CallItemFields = CallItemFields {
    call_id: "id",
    name: "name",
    arguments: "input",
    output: "content",
};

const TOOL_RESULT_FIELDS: CallItemFields = CallItemFields {
    call_id: "tool_use_id",
    name: "name",
    arguments: "input",
    output: "content",
};

/// Forward the request to a native Messages upstream.
///
/// The body is the client request re-serialized, with `max_tokens` filled
/// in when absent.
///
/// # Errors
///
/// Returns [`GatewayError::Internal`] if the request cannot be serialized.
pub fn encode_request(
    request: &CanonicalRequest,
    _ctx: &RenderContext<'_>,
    trace: &mut TransformTrace,
) -> Result<Value, GatewayError> {
    let mut body =
        serde_json::to_value(request).map_err(|err| GatewayError::Internal(err.to_string()))?;
    if request.sampling.max_tokens.is_none() {
        if let Some(map) = body.as_object_mut() {
            map.insert("max_tokens".to_string(), Value::from(DEFAULT_MAX_TOKENS));
        }
        trace.audit.add_defaulted(
            "/max_tokens",
            DefaultSource::ProtocolDefault,
            "required by the Messages API",
        );
    }
    Ok(body)
}

/// `tool_use` and `tool_result` blocks of a Messages body, in order.
#[must_use]
pub fn call_items(body: &Value) -> Vec<CallItem> {
    let mut items = Vec::new();
    let Some(messages) = body.get("messages").and_then(Value::as_array) else {
        return items;
    };
    for (msg_index, message) in messages.iter().enumerate() {
        let Some(blocks) = message.get("content").and_then(Value::as_array) else {
            continue;
        };
        for (block_index, block) in blocks.iter().enumerate() {
            let path = format!("/messages/{msg_index}/content/{block_index}");
            match block.get("type").and_then(Value::as_str) {
                Some("tool_use") => items.push(CallItem {
                    kind: CallItemKind::Call,
                    path,
                    call_id: str_at(block, "/id"),
                    name: str_at(block, "/name"),
                    arguments: block
                        .get("input")
                        .filter(|input| !input.is_null())
                        .map(Value::to_string),
                    has_output: false,
                    fields: TOOL_USE_FIELDS,
                }),
                Some("tool_result") => items.push(CallItem {
                    kind: CallItemKind::Output,
                    path,
                    call_id: str_at(block, "/tool_use_id"),
                    name: None,
                    arguments: None,
                    // An omitted `content` is a valid empty result here.
                    has_output: true,
                    fields: TOOL_RESULT_FIELDS,
                }),
                _ => {}
            }
        }
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransformConfig;
    use crate::protocol::canonical::ToolCallMapping;
    use crate::protocol::tool_name::ShortNameMap;
    use crate::transform::validate::validate_call_items;
    use serde_json::json;

    #[test]
    fn test_passthrough_fills_max_tokens() {
        let request: CanonicalRequest = serde_json::from_value(json!({
            "model": "claude-sonnet-4",
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [{"type": "web_search_20250305", "name": "web_search"}]
        }))
        .unwrap();
        let config = TransformConfig::default();
        let mapping = ToolCallMapping::new();
        let names = ShortNameMap::default();
        let ctx = RenderContext {
            config: &config,
            mapping: &mapping,
            tool_names: &names,
        };
        let mut trace = TransformTrace::new("native", "Native");
        let body = encode_request(&request, &ctx, &mut trace).unwrap();
        assert_eq!(body["max_tokens"], 4096);
        assert_eq!(body["tools"][0]["type"], "web_search_20250305");
        assert_eq!(trace.audit.defaulted[0].path, "/max_tokens");
    }

    #[test]
    fn test_call_items_pair_by_tool_use_id() {
        let body = json!({"messages": [
            {"role": "assistant", "content": [{"type": "tool_use", "id": "toolu_1", "name": "ls", "input": {}}]},
            {"role": "user", "content": [{"type": "tool_result", "tool_use_id": "toolu_1"}]}
        ]});
        let items = call_items(&body);
        assert_eq!(items.len(), 2);
        assert!(validate_call_items(&items, &mut Default::default()).is_empty());
    }
}
