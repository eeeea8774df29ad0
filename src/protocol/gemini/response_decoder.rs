use serde::Deserialize;
use serde_json::Value;

use super::{error_message, GeminiChunk};
use crate::error::GatewayError;
use crate::protocol::canonical::{CanonicalResponse, ContentBlock};
use crate::protocol::mapping::{gemini_finish_to_stop, gemini_stop_with_tools, gemini_usage};
use crate::transform::response::ResponseContext;
use crate::transform::trace::TransformTrace;
use crate::util::{generate_tool_use_id, next_message_id};

/// `promptFeedback.blockReason` of a response with no candidates.
pub(super) fn blocked_reason(chunk: &GeminiChunk) -> Option<&str> {
    if !chunk.candidates.is_empty() {
        return None;
    }
    chunk
        .prompt_feedback
        .as_ref()
        .and_then(|feedback| feedback.get("blockReason"))
        .and_then(Value::as_str)
}

/// Decode a complete `generateContent` response.
///
/// # Errors
///
/// Returns [`GatewayError::Upstream`] for error bodies and blocked prompts,
/// and [`GatewayError::Transform`] when the body is not a response object.
pub fn decode_response(
    body: &Value,
    ctx: &ResponseContext<'_>,
    trace: &mut TransformTrace,
) -> Result<CanonicalResponse, GatewayError> {
    let parsed = GeminiChunk::deserialize(body).map_err(|err| GatewayError::Transform {
        step: "decode".to_string(),
        message: err.to_string(),
    })?;
    if let Some(error) = parsed.error.as_ref().filter(|error| !error.is_null()) {
        return Err(GatewayError::Upstream {
            status: 502,
            message: error_message(error),
        });
    }
    if let Some(reason) = blocked_reason(&parsed) {
        return Err(GatewayError::Upstream {
            status: 400,
            message: format!("Prompt blocked: {reason}"),
        });
    }

    let model = parsed
        .model_version
        .clone()
        .filter(|model| !model.is_empty())
        .unwrap_or_else(|| ctx.model.to_string());
    let mut response = CanonicalResponse::new(next_message_id(), model);

    let mut reasoning_chars = 0u64;
    for part in parsed.parts() {
        if let Some(text) = part.text.as_deref() {
            if part.thought {
                reasoning_chars += u64::try_from(text.chars().count()).unwrap_or(u64::MAX);
                continue;
            }
            if text.is_empty() {
                continue;
            }
            match response.content.last_mut() {
                Some(ContentBlock::Text { text: last }) => last.push_str(text),
                _ => response.content.push(ContentBlock::text(text)),
            }
        } else if let Some(call) = part.function_call.as_ref() {
            let Some(name) = call.name.as_deref().filter(|name| !name.is_empty()) else {
                trace.warn("Dropped function call without a name");
                continue;
            };
            response.content.push(ContentBlock::ToolUse {
                id: call
                    .id
                    .clone()
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(generate_tool_use_id),
                name: name.to_string(),
                input: Value::Object(call.args.clone().unwrap_or_default()),
            });
        }
    }
    if reasoning_chars > 0 {
        trace.bump_metadata("reasoningChars", reasoning_chars);
    }
    if parsed.candidates.is_empty() {
        trace.warn("Upstream response had no candidates");
    }

    response.stop_reason = gemini_stop_with_tools(
        gemini_finish_to_stop(parsed.finish_reason()),
        response.has_tool_use(),
    );
    if let Some(usage) = parsed.usage_metadata.as_ref() {
        response.usage = gemini_usage(usage);
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
            model: "gemini-2.5-pro",
            tool_names: &names,
            custom_tool_call_strategy: CustomToolCallStrategy::default(),
        };
        let mut trace = TransformTrace::new("gemini", "Gemini");
        (decode_response(&body, &ctx, &mut trace), trace)
    }

    #[test]
    fn test_function_call_promotes_stop_reason() {
        let (response, trace) = decode(json!({
            "candidates": [{"content": {"role": "model", "parts": [
                {"text": "weighing options", "thought": true},
                {"text": "Let me check."},
                {"functionCall": {"name": "get_weather", "args": {"location": "Tokyo"}}}
            ]}, "finishReason": "STOP"}],
            "usageMetadata": {"promptTokenCount": 40, "candidatesTokenCount": 9, "cachedContentTokenCount": 10},
            "modelVersion": "gemini-2.5-pro-002"
        }));
        let response = response.unwrap();
        assert_eq!(response.model, "gemini-2.5-pro-002");
        assert_eq!(response.content[0], ContentBlock::text("Let me check."));
        assert!(matches!(
            &response.content[1],
            ContentBlock::ToolUse { id, name, input }
                if id.starts_with("toolu_")
                    && name == "get_weather"
                    && *input == json!({"location": "Tokyo"})
        ));
        assert_eq!(response.stop_reason, StopReason::ToolUse);
        assert_eq!(response.usage.input_tokens, 30);
        assert_eq!(trace.metadata["reasoningChars"], 16);
    }

    #[test]
    fn test_safety_stop_and_errors() {
        let (response, _) = decode(json!({
            "candidates": [{"content": {"parts": []}, "finishReason": "SAFETY"}]
        }));
        assert_eq!(response.unwrap().stop_reason, StopReason::StopSequence);

        let (blocked, _) = decode(json!({"promptFeedback": {"blockReason": "SAFETY"}}));
        assert!(matches!(blocked, Err(GatewayError::Upstream { status: 400, .. })));

        let (failed, _) = decode(json!({
            "error": {"code": 429, "status": "RESOURCE_EXHAUSTED", "message": "quota"}
        }));
        match failed {
            Err(GatewayError::Upstream { message, .. }) => {
                assert_eq!(message, "RESOURCE_EXHAUSTED: quota")
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
