use serde_json::Value;

use super::trace::{TransformErrorKind, TransformTrace};
use crate::config::CustomToolCallStrategy;
use crate::error::GatewayError;
use crate::protocol::canonical::{CanonicalResponse, TargetProtocol};
use crate::protocol::tool_name::ShortNameMap;
use crate::protocol::{anthropic, gemini, openai_chat, openai_responses};

/// Inputs the response decoders share.
#[derive(Debug, Clone, Copy)]
pub struct ResponseContext<'a> {
    /// Client model, used when the upstream body names none.
    pub model: &'a str,
    /// Names shortened on the way out, restored on the way back.
    pub tool_names: &'a ShortNameMap,
    pub custom_tool_call_strategy: CustomToolCallStrategy,
}

/// Decode a complete upstream body into a client response.
///
/// A `null` body yields `Ok(None)`. The work runs as the trace step `decode`.
///
/// # Errors
///
/// Returns [`GatewayError::Upstream`] when the body is an upstream error and
/// [`GatewayError::Transform`] when it cannot be decoded at all.
pub fn transform_response(
    protocol: TargetProtocol,
    body: &Value,
    ctx: &ResponseContext<'_>,
    trace: &mut TransformTrace,
) -> Result<Option<CanonicalResponse>, GatewayError> {
    if body.is_null() {
        return Ok(None);
    }
    trace.push_chain(&format!("{}->anthropic", protocol.as_str()));
    let decoded = trace.run_step("decode", |trace| {
        let result = match protocol {
            TargetProtocol::Anthropic => {
                anthropic::response_decoder::decode_response(body, ctx, trace)
            }
            TargetProtocol::OpenAiChat => {
                openai_chat::response_decoder::decode_response(body, ctx, trace)
            }
            TargetProtocol::OpenAiResponses => {
                openai_responses::response_decoder::decode_response(body, ctx, trace)
            }
            TargetProtocol::Gemini => gemini::response_decoder::decode_response(body, ctx, trace),
        };
        if let Err(GatewayError::Transform { message, .. }) = &result {
            trace.error(TransformErrorKind::ParseError, "decode", message.clone(), None);
        }
        result
    })?;
    trace.set_metadata("stopReason", decoded.stop_reason.as_str());
    trace.set_metadata("contentBlocks", decoded.content.len());
    Ok(Some(decoded))
}
