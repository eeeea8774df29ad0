use serde::Deserialize;
use serde_json::Value;

use super::error_message;
use crate::error::GatewayError;
use crate::protocol::canonical::{CanonicalResponse, ContentBlock};
use crate::protocol::mapping::{openai_chat_usage, openai_finish_to_stop, parse_tool_arguments};
use crate::transform::response::ResponseContext;
use crate::transform::trace::TransformTrace;
use crate::util::{generate_tool_use_id, next_message_id};

#[derive(Debug, Default, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatChoice {
    #[serde(default)]
    message: ChatMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<ChatContent>,
    #[serde(default)]
    refusal: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ChatToolCall>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ChatContent {
    Text(String),
    Parts(Vec<ChatContentPart>),
}

#[derive(Debug, Deserialize)]
struct ChatContentPart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatToolCall {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: ChatFunction,
}

#[derive(Debug, Default, Deserialize)]
struct ChatFunction {
    #[serde(default)]
    name: String,
    #[serde(default)]
    arguments: String,
}

/// Decode a complete Chat Completions response.
///
/// # Errors
///
/// Returns [`GatewayError::Upstream`] for an `{"error": ...}` body and
/// [`GatewayError::Transform`] when the body is not a completion object.
pub fn decode_response(
    body: &Value,
    ctx: &ResponseContext<'_>,
    trace: &mut TransformTrace,
) -> Result<CanonicalResponse, GatewayError> {
    if let Some(error) = body.get("error").filter(|error| !error.is_null()) {
        return Err(GatewayError::Upstream {
            status: 502,
            message: error_message(error),
        });
    }
    let parsed = ChatCompletion::deserialize(body).map_err(|err| GatewayError::Transform {
        step: "decode".to_string(),
        message: err.to_string(),
    })?;

    let model = parsed
        .model
        .filter(|model| !model.is_empty())
        .unwrap_or_else(|| ctx.model.to_string());
    let mut response = CanonicalResponse::new(next_message_id(), model);

    let Some(choice) = parsed.choices.into_iter().next() else {
        trace.warn("Upstream response has no choices");
        return Ok(response);
    };

    let mut text = String::new();
    match choice.message.content {
        Some(ChatContent::Text(content)) => text.push_str(&content),
        Some(ChatContent::Parts(parts)) => {
            for part in parts.into_iter().filter_map(|part| part.text) {
                text.push_str(&part);
            }
        }
        None => {}
    }
    if text.is_empty() {
        if let Some(refusal) = choice.message.refusal {
            text = refusal;
        }
    }
    if !text.is_empty() {
        response.content.push(ContentBlock::Text { text });
    }

    for (index, call) in choice.message.tool_calls.into_iter().enumerate() {
        if call.function.name.is_empty() {
            trace.warn(format!("Dropped tool call {index} without a function name"));
            continue;
        }
        let (input, fell_back) = parse_tool_arguments(&call.function.arguments);
        if fell_back {
            trace.warn(format!(
                "Tool call '{}' had invalid JSON arguments; using {{}}",
                call.function.name
            ));
        }
        response.content.push(ContentBlock::ToolUse {
            id: call.id.filter(|id| !id.is_empty()).unwrap_or_else(generate_tool_use_id),
            name: ctx.tool_names.restore(&call.function.name).to_string(),
            input,
        });
    }

    response.stop_reason = openai_finish_to_stop(choice.finish_reason.as_deref());
    if let Some(usage) = parsed.usage.as_ref() {
        response.usage = openai_chat_usage(usage);
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CustomToolCallStrategy;
    use crate::protocol::canonical::StopReason;
    use crate::protocol::tool_name::ShortNameMap;
    use serde_json::json;

    fn decode(body: Value) -> (Result<CanonicalResponse, GatewayError>, TransformTrace) {
        let names = ShortNameMap::default();
        let ctx = ResponseContext {
            model: "gpt-4o",
            tool_names: &names,
            custom_tool_call_strategy: CustomToolCallStrategy::default(),
        };
        let mut trace = TransformTrace::new("s", "S");
        (decode_response(&body, &ctx, &mut trace), trace)
    }

    #[test]
    fn test_text_and_tool_calls() {
        let (response, trace) = decode(json!({
            "id": "chatcmpl-1",
            "model": "gpt-4o-2024",
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": "Let me check.",
                    "tool_calls": [
                        {"id": "call_1", "type": "function", "function": {"name": "get_weather", "arguments": "{\"location\":\"Tokyo\"}"}},
                        {"id": "call_2", "type": "function", "function": {"name": "broken", "arguments": "{oops"}}
                    ]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 100, "completion_tokens": 20, "prompt_tokens_details": {"cached_tokens": 60}}
        }));
        let response = response.unwrap();
        assert_eq!(response.model, "gpt-4o-2024");
        assert_eq!(response.content[0], ContentBlock::text("Let me check."));
        assert_eq!(
            response.content[1],
            ContentBlock::ToolUse {
                id: "call_1".into(),
                name: "get_weather".into(),
                input: json!({"location": "Tokyo"})
            }
        );
        assert!(matches!(
            &response.content[2],
            ContentBlock::ToolUse { input, .. } if *input == json!({})
        ));
        assert_eq!(response.stop_reason, StopReason::ToolUse);
        assert_eq!(response.usage.input_tokens, 40);
        assert_eq!(response.usage.cache_read_input_tokens, Some(60));
        assert_eq!(trace.warnings.len(), 1);
    }

    #[test]
    fn test_missing_finish_reason_defaults_to_end_turn() {
        let (response, _) = decode(json!({"choices": [{"message": {"content": null}}]}));
        let response = response.unwrap();
        assert_eq!(response.model, "gpt-4o");
        assert!(response.content.is_empty());
        assert_eq!(response.stop_reason, StopReason::EndTurn);
    }

    #[test]
    fn test_error_body_is_upstream_error() {
        let (response, _) = decode(json!({"error": {"message": "rate limited"}}));
        match response {
            Err(GatewayError::Upstream { status, message }) => {
                assert_eq!(status, 502);
                assert_eq!(message, "rate limited");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
