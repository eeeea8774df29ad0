//! `count_tokens` requests.
//!
//! Suppliers that can count (native Messages, Gemini `countTokens`) get the
//! request forwarded; OpenAI-style suppliers have no counting endpoint, so
//! the count is estimated from the request text.

use http::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::request::{upstream_headers, OutboundRequest, SupplierTarget};
use super::trace::{TransformErrorKind, TransformTrace};
use crate::error::GatewayError;
use crate::protocol::canonical::{CanonicalRequest, ContentBlock, SystemPrompt, TargetProtocol};
use crate::protocol::gemini;
use crate::util::join_endpoint;

/// Characters per token assumed by the local estimate.
pub const ESTIMATE_CHARS_PER_TOKEN: u64 = 3;

/// Trace metadata key set when the count is a local estimate.
pub const COUNT_TOKENS_FALLBACK: &str = "countTokensFallback";

/// The client-facing count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TokenCount {
    pub input_tokens: u64,
    #[serde(skip)]
    pub estimated: bool,
}

/// How a count request will be answered.
#[derive(Debug)]
pub enum CountTokensPlan {
    /// Ask the upstream; `estimate` answers if the upstream fails.
    Upstream {
        outbound: OutboundRequest,
        protocol: TargetProtocol,
        estimate: TokenCount,
    },
    Local(TokenCount),
}

/// Decide how to count the tokens of a client `count_tokens` body.
///
/// # Errors
///
/// Returns [`GatewayError::InvalidRequest`] when the body is not a client
/// request or has no messages, and [`GatewayError::Config`] for a bad base URL.
pub fn plan_count_tokens(
    body: &Value,
    client_headers: &HeaderMap,
    target: &SupplierTarget,
    trace: &mut TransformTrace,
) -> Result<CountTokensPlan, GatewayError> {
    trace.push_chain(&format!("anthropic->{}:count_tokens", target.protocol.as_str()));
    let request = CanonicalRequest::deserialize(body).map_err(|err| {
        trace.error(TransformErrorKind::ParseError, "parse", err.to_string(), None);
        GatewayError::InvalidRequest(err.to_string())
    })?;
    if request.messages.is_empty() {
        trace.error(
            TransformErrorKind::MissingRequired,
            "parse",
            "messages is empty",
            Some("/messages".to_string()),
        );
        return Err(GatewayError::InvalidRequest(
            "messages is required and must be a non-empty array".to_string(),
        ));
    }
    let estimate = estimate_tokens(&request);

    let (url, upstream_body) = match target.protocol {
        TargetProtocol::Anthropic => (
            join_endpoint(&target.base_url, "v1", "messages/count_tokens", None)?,
            body.clone(),
        ),
        TargetProtocol::Gemini => (
            gemini::encoder::count_tokens_url(&target.base_url, &request.model)?,
            gemini::count_tokens::encode_count_tokens(&request)?,
        ),
        TargetProtocol::OpenAiChat | TargetProtocol::OpenAiResponses => {
            trace.set_metadata(COUNT_TOKENS_FALLBACK, true);
            return Ok(CountTokensPlan::Local(estimate));
        }
    };
    Ok(CountTokensPlan::Upstream {
        outbound: OutboundRequest {
            method: http::Method::POST,
            url,
            headers: upstream_headers(client_headers, target, false),
            body: upstream_body,
        },
        protocol: target.protocol,
        estimate,
    })
}

/// Read the count out of an upstream `count_tokens` response.
///
/// # Errors
///
/// Returns [`GatewayError::Upstream`] when the body carries no count.
pub fn count_tokens_response(
    protocol: TargetProtocol,
    body: &Value,
) -> Result<TokenCount, GatewayError> {
    let input_tokens = match protocol {
        TargetProtocol::Gemini => gemini::count_tokens::decode_count_tokens(body)?,
        _ => body
            .get("input_tokens")
            .and_then(Value::as_u64)
            .ok_or_else(|| GatewayError::Upstream {
                status: 502,
                message: "count_tokens response has no input_tokens".to_string(),
            })?,
    };
    Ok(TokenCount {
        input_tokens,
        estimated: false,
    })
}

/// Rough count: system, message text, image media types and tool
/// definitions, at [`ESTIMATE_CHARS_PER_TOKEN`] characters per token.
#[must_use]
pub fn estimate_tokens(request: &CanonicalRequest) -> TokenCount {
    let mut chars = 0usize;
    match &request.system {
        Some(SystemPrompt::Text(text)) => chars += text.chars().count(),
        Some(SystemPrompt::Blocks(blocks)) => chars += text_chars(blocks),
        None => {}
    }
    for message in &request.messages {
        chars += text_chars(&message.blocks());
    }
    for tool in &request.tools {
        chars += tool.name.chars().count();
        chars += tool.description.as_deref().map_or(0, |text| text.chars().count());
        if !tool.input_schema.is_null() {
            chars += tool.input_schema.to_string().chars().count();
        }
    }
    let chars = u64::try_from(chars).unwrap_or(u64::MAX);
    TokenCount {
        input_tokens: chars.div_ceil(ESTIMATE_CHARS_PER_TOKEN),
        estimated: true,
    }
}

fn text_chars(blocks: &[ContentBlock]) -> usize {
    blocks
        .iter()
        .map(|block| match block {
            ContentBlock::Text { text } => text.chars().count(),
            ContentBlock::Image { source } => source
                .get("media_type")
                .and_then(Value::as_str)
                .unwrap_or("image/jpeg")
                .len(),
            _ => 0,
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
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

    fn body() -> Value {
        json!({
            "model": "gemini-2.5-pro",
            "system": "abc",
            "messages": [
                {"role": "user", "content": "hello"},
                {
                    "role": "assistant",
                    "content": [{"type": "tool_use", "id": "t", "name": "ls", "input": {}}]
                }
            ],
            "tools": [{"name": "ls", "input_schema": {"type": "object"}}]
        })
    }

    #[test]
    fn test_estimate_counts_text_and_tools() {
        let request = CanonicalRequest::deserialize(&body()).unwrap();
        // 3 system + 5 text + 2 name + 17 schema characters.
        assert_eq!(
            estimate_tokens(&request),
            TokenCount {
                input_tokens: 9,
                estimated: true
            }
        );
    }

    #[test]
    fn test_openai_suppliers_count_locally() {
        for protocol in [TargetProtocol::OpenAiChat, TargetProtocol::OpenAiResponses] {
            let mut trace = TransformTrace::new("s1", "Supplier");
            let plan = plan_count_tokens(
                &body(),
                &HeaderMap::new(),
                &target(protocol, "https://api.openai.com/v1"),
                &mut trace,
            )
            .unwrap();
            assert!(matches!(plan, CountTokensPlan::Local(count) if count.estimated));
            assert!(trace.metadata_flag(COUNT_TOKENS_FALLBACK));
        }
    }

    #[test]
    fn test_gemini_and_native_are_forwarded() {
        let mut trace = TransformTrace::new("s1", "Supplier");
        let plan = plan_count_tokens(
            &body(),
            &HeaderMap::new(),
            &target(TargetProtocol::Gemini, "https://generativelanguage.googleapis.com"),
            &mut trace,
        )
        .unwrap();
        let CountTokensPlan::Upstream { outbound, .. } = plan else {
            panic!("expected an upstream plan");
        };
        assert_eq!(outbound.url.path(), "/v1beta/models/gemini-2.5-pro:countTokens");
        assert_eq!(outbound.body["systemInstruction"]["parts"][0]["text"], "abc");
        assert_eq!(outbound.headers.get("x-goog-api-key").unwrap(), "sk-test");
        assert_eq!(trace.chain, vec!["anthropic->gemini:count_tokens"]);

        let plan = plan_count_tokens(
            &body(),
            &HeaderMap::new(),
            &target(TargetProtocol::Anthropic, "https://api.anthropic.com"),
            &mut TransformTrace::new("s1", "Supplier"),
        )
        .unwrap();
        let CountTokensPlan::Upstream { outbound, .. } = plan else {
            panic!("expected an upstream plan");
        };
        assert_eq!(outbound.url.path(), "/v1/messages/count_tokens");
        assert_eq!(outbound.body, body());
    }

    #[test]
    fn test_empty_messages_are_rejected() {
        let mut trace = TransformTrace::new("s1", "Supplier");
        let err = plan_count_tokens(
            &json!({"model": "m", "messages": []}),
            &HeaderMap::new(),
            &target(TargetProtocol::Gemini, "https://g.example"),
            &mut trace,
        )
        .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest(_)));
        assert!(!trace.is_success());
    }

    #[test]
    fn test_response_counts_per_protocol() {
        let gemini = json!({"totalTokens": 12});
        let count = count_tokens_response(TargetProtocol::Gemini, &gemini).unwrap();
        assert_eq!(count.input_tokens, 12);
        let native = json!({"input_tokens": 7});
        let count = count_tokens_response(TargetProtocol::Anthropic, &native).unwrap();
        assert_eq!(count.input_tokens, 7);
        assert_eq!(serde_json::to_value(count).unwrap(), json!({"input_tokens": 7}));
    }
}
