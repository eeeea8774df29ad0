use serde::Deserialize;
use serde_json::Value;

use super::error_message;
use crate::error::GatewayError;
use crate::protocol::canonical::{CanonicalResponse, ContentBlock, Usage};
use crate::protocol::mapping::anthropic_stop;
use crate::transform::response::ResponseContext;
use crate::transform::trace::TransformTrace;
use crate::util::next_message_id;

#[derive(Debug, Default, Deserialize)]
struct NativeMessage {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    stop_sequence: Option<String>,
    #[serde(default)]
    usage: Usage,
}

/// Decode a native Messages response.
///
/// Thinking blocks are counted and dropped, matching the passthrough stream.
///
/// # Errors
///
/// Returns [`GatewayError::Upstream`] for error bodies and
/// [`GatewayError::Transform`] when the body is not a message object.
pub fn decode_response(
    body: &Value,
    ctx: &ResponseContext<'_>,
    trace: &mut TransformTrace,
) -> Result<CanonicalResponse, GatewayError> {
    if let Some(message) = error_message(body) {
        return Err(GatewayError::Upstream {
            status: 502,
            message,
        });
    }
    let parsed = NativeMessage::deserialize(body).map_err(|err| GatewayError::Transform {
        step: "decode".to_string(),
        message: err.to_string(),
    })?;

    let model = parsed
        .model
        .filter(|model| !model.is_empty())
        .unwrap_or_else(|| ctx.model.to_string());
    let id = parsed
        .id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(next_message_id);
    let mut response = CanonicalResponse::new(id, model);

    for block in parsed.content {
        match block {
            ContentBlock::Thinking { thinking, .. } => {
                let chars = u64::try_from(thinking.chars().count()).unwrap_or(u64::MAX);
                trace.bump_metadata("reasoningChars", chars);
            }
            ContentBlock::Unsupported => trace.bump_metadata("droppedBlocks", 1),
            block => response.content.push(block),
        }
    }
    response.stop_reason = anthropic_stop(parsed.stop_reason.as_deref());
    response.stop_sequence = parsed.stop_sequence;
    response.usage = parsed.usage;
    Ok(response)
}
