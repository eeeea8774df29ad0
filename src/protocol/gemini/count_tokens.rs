use serde_json::Value;

use super::{error_message, GeminiContent, GeminiCountTokensRequest, GeminiPart};
use crate::error::GatewayError;
use crate::protocol::canonical::{CanonicalRequest, ContentBlock};
use crate::protocol::mapping::role_to_gemini;

/// Build a `countTokens` body from a client request.
///
/// Only text is counted upstream; tool calls, tool results and images are
/// left out.
///
/// # Errors
///
/// Returns [`GatewayError::Internal`] if the wire body cannot be serialized.
pub fn encode_count_tokens(request: &CanonicalRequest) -> Result<Value, GatewayError> {
    let contents = request
        .messages
        .iter()
        .map(|message| GeminiContent {
            role: role_to_gemini(message.role),
            parts: message
                .blocks()
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text } => Some(GeminiPart::Text(text.clone())),
                    _ => None,
                })
                .collect(),
        })
        .collect();
    let system_instruction = request.system_text().map(|text| GeminiContent {
        role: "user",
        parts: vec![GeminiPart::Text(text)],
    });
    serde_json::to_value(GeminiCountTokensRequest {
        contents,
        system_instruction,
    })
    .map_err(|err| GatewayError::Internal(err.to_string()))
}

/// `totalTokens` of a `countTokens` response.
///
/// # Errors
///
/// Returns [`GatewayError::Upstream`] for error bodies and bodies without a count.
pub fn decode_count_tokens(body: &Value) -> Result<u64, GatewayError> {
    if let Some(error) = body.get("error").filter(|error| !error.is_null()) {
        return Err(GatewayError::Upstream {
            status: 502,
            message: error_message(error),
        });
    }
    body.get("totalTokens")
        .and_then(Value::as_u64)
        .ok_or_else(|| GatewayError::Upstream {
            status: 502,
            message: "countTokens response has no totalTokens".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_count_body_keeps_text_only() {
        let request: CanonicalRequest = serde_json::from_value(json!({
            "model": "gemini-2.5-pro",
            "system": [{"type": "text", "text": "a"}, {"type": "text", "text": "b"}],
            "messages": [
                {"role": "user", "content": "hello"},
                {"role": "assistant", "content": [
                    {"type": "text", "text": "calling"},
                    {"type": "tool_use", "id": "toolu_1", "name": "ls", "input": {}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": "ok"}
                ]}
            ]
        }))
        .unwrap();
        let body = encode_count_tokens(&request).unwrap();
        assert_eq!(
            body,
            json!({
                "contents": [
                    {"role": "user", "parts": [{"text": "hello"}]},
                    {"role": "model", "parts": [{"text": "calling"}]},
                    {"role": "user", "parts": []}
                ],
                "systemInstruction": {"role": "user", "parts": [{"text": "a\n\nb"}]}
            })
        );
    }

    #[test]
    fn test_decode_total_tokens_and_errors() {
        assert_eq!(decode_count_tokens(&json!({"totalTokens": 31})).unwrap(), 31);
        let error = json!({"error": {"status": "INVALID_ARGUMENT", "message": "bad"}});
        match decode_count_tokens(&error) {
            Err(GatewayError::Upstream { message, .. }) => {
                assert_eq!(message, "INVALID_ARGUMENT: bad")
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(decode_count_tokens(&json!({})).is_err());
    }
}
