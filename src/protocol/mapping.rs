use serde_json::Value;

use super::canonical::{Role, StopReason, Usage};

// ---------------------------------------------------------------------------
// Role mappings
// ---------------------------------------------------------------------------

#[must_use]
pub fn role_to_openai(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

#[must_use]
pub fn role_to_gemini(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "model",
    }
}

// ---------------------------------------------------------------------------
// Stop reason mappings
// ---------------------------------------------------------------------------

/// `OpenAI` Chat `finish_reason` to the client stop reason.
#[must_use]
pub fn openai_finish_to_stop(finish_reason: Option<&str>) -> StopReason {
    match finish_reason {
        Some("tool_calls" | "function_call") => StopReason::ToolUse,
        Some("length") => StopReason::MaxTokens,
        Some("stop" | "content_filter") | Some(_) | None => StopReason::EndTurn,
    }
}

/// Native Messages API `stop_reason` from a passthrough upstream.
#[must_use]
pub fn anthropic_stop(stop_reason: Option<&str>) -> StopReason {
    match stop_reason {
        Some("tool_use") => StopReason::ToolUse,
        Some("max_tokens" | "model_context_window_exceeded") => StopReason::MaxTokens,
        Some("stop_sequence") => StopReason::StopSequence,
        Some("end_turn" | "pause_turn" | "refusal") | Some(_) | None => StopReason::EndTurn,
    }
}

/// Responses API terminal status to the client stop reason.
///
/// `incomplete` with a token-limit reason maps to `max_tokens`; everything
/// else resolves by whether a tool call was emitted.
#[must_use]
pub fn responses_status_to_stop(
    status: Option<&str>,
    incomplete_reason: Option<&str>,
    saw_tool_call: bool,
) -> StopReason {
    match (status, incomplete_reason) {
        (Some("incomplete"), Some("max_output_tokens" | "max_tokens")) => StopReason::MaxTokens,
        (Some("incomplete"), Some("content_filter")) => StopReason::EndTurn,
        _ if saw_tool_call => StopReason::ToolUse,
        _ => StopReason::EndTurn,
    }
}

/// Gemini `finishReason` to the client stop reason.
///
/// Safety-style stops become `stop_sequence`; error-style reasons degrade to
/// `end_turn`, as does a missing or unspecified reason.
#[must_use]
pub fn gemini_finish_to_stop(finish_reason: Option<&str>) -> StopReason {
    match finish_reason {
        Some("MAX_TOKENS") => StopReason::MaxTokens,
        Some(
            "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" | "LANGUAGE"
            | "IMAGE_PROHIBITED_CONTENT",
        ) => StopReason::StopSequence,
        Some("MALFORMED_FUNCTION_CALL" | "NO_IMAGE" | "UNEXPECTED_TOOL_CALL") => {
            StopReason::EndTurn
        }
        Some("STOP" | "OTHER" | "FINISH_REASON_UNSPECIFIED") | Some(_) | None => {
            StopReason::EndTurn
        }
    }
}

/// Gemini reports `STOP` for function-call turns; promote to `tool_use` so
/// clients run the requested tools.
#[must_use]
pub fn gemini_stop_with_tools(stop: StopReason, saw_tool_call: bool) -> StopReason {
    if saw_tool_call && stop == StopReason::EndTurn {
        StopReason::ToolUse
    } else {
        stop
    }
}

// ---------------------------------------------------------------------------
// Image sources
// ---------------------------------------------------------------------------

/// A client image `source` descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageRef<'a> {
    Inline { media_type: &'a str, data: &'a str },
    Url(&'a str),
}

impl ImageRef<'_> {
    /// `data:` URL for inline images, the URL itself otherwise.
    #[must_use]
    pub fn to_url(&self) -> String {
        match self {
            ImageRef::Inline { media_type, data } => format!("data:{media_type};base64,{data}"),
            ImageRef::Url(url) => (*url).to_string(),
        }
    }
}

#[must_use]
pub fn image_ref(source: &Value) -> Option<ImageRef<'_>> {
    match source.get("type").and_then(Value::as_str)? {
        "base64" => Some(ImageRef::Inline {
            media_type: source
                .get("media_type")
                .and_then(Value::as_str)
                .unwrap_or("image/png"),
            data: source.get("data").and_then(Value::as_str)?,
        }),
        "url" => source.get("url").and_then(Value::as_str).map(ImageRef::Url),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tool arguments
// ---------------------------------------------------------------------------

/// Structured tool input from string-encoded arguments.
///
/// Empty input is `{}`. Invalid JSON or a non-object value also becomes
/// `{}`, and the returned flag is `true` so callers can record the fallback.
#[must_use]
pub fn parse_tool_arguments(raw: &str) -> (Value, bool) {
    if raw.trim().is_empty() {
        return (Value::Object(serde_json::Map::new()), false);
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ Value::Object(_)) => (value, false),
        _ => (Value::Object(serde_json::Map::new()), true),
    }
}

// ---------------------------------------------------------------------------
// Usage mappings
// ---------------------------------------------------------------------------

fn u64_at(value: &Value, pointer: &str) -> Option<u64> {
    value.pointer(pointer).and_then(Value::as_u64)
}

/// `OpenAI` Chat `usage` object. `prompt_tokens` includes cached tokens.
#[must_use]
pub fn openai_chat_usage(usage: &Value) -> Usage {
    split_cached(
        u64_at(usage, "/prompt_tokens").unwrap_or(0),
        u64_at(usage, "/completion_tokens").unwrap_or(0),
        u64_at(usage, "/prompt_tokens_details/cached_tokens"),
        u64_at(usage, "/completion_tokens_details/reasoning_tokens"),
    )
}

/// Responses API `usage` object. `input_tokens` includes cached tokens.
#[must_use]
pub fn responses_usage(usage: &Value) -> Usage {
    split_cached(
        u64_at(usage, "/input_tokens").unwrap_or(0),
        u64_at(usage, "/output_tokens").unwrap_or(0),
        u64_at(usage, "/input_tokens_details/cached_tokens"),
        u64_at(usage, "/output_tokens_details/reasoning_tokens"),
    )
}

/// Gemini `usageMetadata`. `promptTokenCount` includes cached content.
#[must_use]
pub fn gemini_usage(usage: &Value) -> Usage {
    split_cached(
        u64_at(usage, "/promptTokenCount").unwrap_or(0),
        u64_at(usage, "/candidatesTokenCount").unwrap_or(0),
        u64_at(usage, "/cachedContentTokenCount"),
        u64_at(usage, "/thoughtsTokenCount"),
    )
}

fn split_cached(
    combined_input: u64,
    output: u64,
    cached: Option<u64>,
    reasoning: Option<u64>,
) -> Usage {
    let cached = cached.filter(|&count| count > 0);
    Usage {
        input_tokens: combined_input.saturating_sub(cached.unwrap_or(0)),
        output_tokens: output,
        cache_read_input_tokens: cached,
        cache_creation_input_tokens: None,
        reasoning_tokens: reasoning.filter(|&count| count > 0),
    }
}
