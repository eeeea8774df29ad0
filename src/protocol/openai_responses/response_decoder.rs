use serde::Deserialize;
use serde_json::Value;

use super::{custom_tool_input, error_message, ResponsesEnvelope};
use crate::error::GatewayError;
use crate::protocol::canonical::{CanonicalResponse, ContentBlock};
use crate::protocol::mapping::{parse_tool_arguments, responses_status_to_stop, responses_usage};
use crate::transform::response::ResponseContext;
use crate::transform::trace::TransformTrace;
use crate::util::{generate_tool_use_id, next_message_id};

/// Unwrap `{"type": "response.completed", "response": {...}}` to the response object.
fn unwrap_envelope(body: &Value) -> &Value {
    match body.get("response") {
        Some(inner) if inner.is_object() && body.get("type").is_some_and(Value::is_string) => inner,
        _ => body,
    }
}

/// Decode a complete Responses API response, bare or wrapped in a
/// completed-event envelope.
///
/// # Errors
///
/// Returns [`GatewayError::Upstream`] for failed responses or error bodies,
/// and [`GatewayError::Transform`] when a custom tool call is rejected or
/// the body is not a response object.
pub fn decode_response(
    body: &Value,
    ctx: &ResponseContext<'_>,
    trace: &mut TransformTrace,
) -> Result<CanonicalResponse, GatewayError> {
    let body = unwrap_envelope(body);
    let parsed = ResponsesEnvelope::deserialize(body).map_err(|err| GatewayError::Transform {
        step: "decode".to_string(),
        message: err.to_string(),
    })?;

    if let Some(error) = parsed.error.as_ref().filter(|error| !error.is_null()) {
        return Err(GatewayError::Upstream {
            status: 502,
            message: error_message(error),
        });
    }
    if parsed.status.as_deref() == Some("failed") {
        return Err(GatewayError::Upstream {
            status: 502,
            message: "upstream response failed".to_string(),
        });
    }

    let model = parsed
        .model
        .filter(|model| !model.is_empty())
        .unwrap_or_else(|| ctx.model.to_string());
    let mut response = CanonicalResponse::new(next_message_id(), model);

    let mut reasoning_chars = 0u64;
    for item in &parsed.output {
        match item.kind.as_str() {
            "message" => {
                let mut text = String::new();
                for part in &item.content {
                    match part.kind.as_str() {
                        "output_text" => text.push_str(part.text.as_deref().unwrap_or_default()),
                        "refusal" => text.push_str(part.refusal.as_deref().unwrap_or_default()),
                        _ => {}
                    }
                }
                if !text.is_empty() {
                    match response.content.last_mut() {
                        Some(ContentBlock::Text { text: last }) => last.push_str(&text),
                        _ => response.content.push(ContentBlock::Text { text }),
                    }
                }
            }
            "function_call" => {
                let name = ctx.tool_names.restore(item.name.as_deref().unwrap_or_default());
                if name.is_empty() {
                    trace.warn("Dropped function call without a name");
                    continue;
                }
                let (input, fell_back) =
                    parse_tool_arguments(item.arguments.as_deref().unwrap_or_default());
                if fell_back {
                    trace.warn(format!(
                        "Tool call '{name}' had invalid JSON arguments; using {{}}"
                    ));
                }
                response.content.push(ContentBlock::ToolUse {
                    id: call_id(item.client_call_id()),
                    name: name.to_string(),
                    input,
                });
            }
            "custom_tool_call" => {
                let name = ctx.tool_names.restore(item.name.as_deref().unwrap_or_default());
                let input = custom_tool_input(
                    name,
                    item.input.as_deref().unwrap_or_default(),
                    ctx.custom_tool_call_strategy,
                )
                .map_err(|message| GatewayError::Transform {
                    step: "decode".to_string(),
                    message,
                })?;
                response.content.push(ContentBlock::ToolUse {
                    id: call_id(item.client_call_id()),
                    name: name.to_string(),
                    input,
                });
            }
            "reasoning" => {
                for part in item.summary.iter().chain(&item.content) {
                    let chars = part.text.as_deref().map_or(0, |text| text.chars().count());
                    reasoning_chars += u64::try_from(chars).unwrap_or(u64::MAX);
                }
            }
            other => tracing::debug!(item_type = other, "ignoring responses output item"),
        }
    }
    if reasoning_chars > 0 {
        trace.bump_metadata("reasoningChars", reasoning_chars);
    }

    response.stop_reason = responses_status_to_stop(
        parsed.status.as_deref(),
        parsed
            .incomplete_details
            .as_ref()
            .and_then(|details| details.reason.as_deref()),
        response.has_tool_use(),
    );
    if let Some(usage) = parsed.usage.as_ref() {
        response.usage = responses_usage(usage);
    }
    Ok(response)
}

fn call_id(id: Option<&str>) -> String {
    id.filter(|id| !id.is_empty())
        .map_or_else(generate_tool_use_id, str::to_string)
}
