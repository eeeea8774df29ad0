use crate::protocol::anthropic::{
    AnthropicContentBlockStart, AnthropicDelta, AnthropicStreamEvent,
};
use crate::protocol::canonical::{BlockDelta, BlockStart, CanonicalStreamEvent, Usage};
use crate::protocol::mapping::anthropic_stop;
use crate::stream::sse::{push_named_frame, SseEvent};
use crate::stream::state::{ToolKey, TranscoderState};
use crate::transform::trace::TransformTrace;
use crate::util::{push_json_string_escaped, push_u64_decimal};

// ---------------------------------------------------------------------------
// Client wire encoding
// ---------------------------------------------------------------------------

/// Append the SSE frame for `event` to `out`.
pub fn encode_event_frame(event: &CanonicalStreamEvent, out: &mut String) {
    let mut json = String::with_capacity(96);
    encode_event_json(event, &mut json);
    push_named_frame(out, event.event_type(), &json);
}

/// Serialize a batch of events into consecutive SSE frames.
#[must_use]
pub fn encode_events(events: &[CanonicalStreamEvent]) -> String {
    let mut out = String::with_capacity(events.len() * 128);
    for event in events {
        encode_event_frame(event, &mut out);
    }
    out
}

/// Serialize the `data:` payload of `event`.
pub fn encode_event_json(event: &CanonicalStreamEvent, json: &mut String) {
    match event {
        CanonicalStreamEvent::MessageStart { id, model, usage } => {
            json.push_str("{\"type\":\"message_start\",\"message\":{\"id\":");
            push_json_string_escaped(json, id);
            json.push_str(",\"type\":\"message\",\"role\":\"assistant\",\"model\":");
            push_json_string_escaped(json, model);
            json.push_str(",\"content\":[],\"stop_reason\":null,\"stop_sequence\":null,\"usage\":");
            push_usage_json(json, usage);
            json.push_str("}}");
        }
        CanonicalStreamEvent::ContentBlockStart { index, block } => {
            json.push_str("{\"type\":\"content_block_start\",\"index\":");
            push_u64_decimal(json, *index as u64);
            match block {
                BlockStart::Text => {
                    json.push_str(",\"content_block\":{\"type\":\"text\",\"text\":\"\"}}");
                }
                BlockStart::ToolUse { id, name } => {
                    json.push_str(",\"content_block\":{\"type\":\"tool_use\",\"id\":");
                    push_json_string_escaped(json, id);
                    json.push_str(",\"name\":");
                    push_json_string_escaped(json, name);
                    json.push_str(",\"input\":{}}}");
                }
            }
        }
        CanonicalStreamEvent::ContentBlockDelta { index, delta } => {
            json.push_str("{\"type\":\"content_block_delta\",\"index\":");
            push_u64_decimal(json, *index as u64);
            match delta {
                BlockDelta::Text(text) => {
                    json.push_str(",\"delta\":{\"type\":\"text_delta\",\"text\":");
                    push_json_string_escaped(json, text);
                }
                BlockDelta::PartialJson(partial) => {
                    json.push_str(",\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":");
                    push_json_string_escaped(json, partial);
                }
            }
            json.push_str("}}");
        }
        CanonicalStreamEvent::ContentBlockStop { index } => {
            json.push_str("{\"type\":\"content_block_stop\",\"index\":");
            push_u64_decimal(json, *index as u64);
            json.push('}');
        }
        CanonicalStreamEvent::MessageDelta { stop_reason, usage } => {
            json.push_str("{\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"");
            json.push_str(stop_reason.as_str());
            json.push_str("\",\"stop_sequence\":null},\"usage\":");
            match usage {
                Some(usage) => push_usage_json(json, usage),
                None => json.push_str("{\"output_tokens\":0}"),
            }
            json.push('}');
        }
        CanonicalStreamEvent::MessageStop => json.push_str("{\"type\":\"message_stop\"}"),
        CanonicalStreamEvent::Error { message } => {
            json.push_str("{\"type\":\"error\",\"error\":{\"type\":\"api_error\",\"message\":");
            push_json_string_escaped(json, message);
            json.push_str("}}");
        }
    }
}

fn push_usage_json(json: &mut String, usage: &Usage) {
    json.push_str("{\"input_tokens\":");
    push_u64_decimal(json, usage.input_tokens);
    json.push_str(",\"output_tokens\":");
    push_u64_decimal(json, usage.output_tokens);
    if let Some(cached) = usage.cache_read_input_tokens {
        json.push_str(",\"cache_read_input_tokens\":");
        push_u64_decimal(json, cached);
    }
    if let Some(created) = usage.cache_creation_input_tokens {
        json.push_str(",\"cache_creation_input_tokens\":");
        push_u64_decimal(json, created);
    }
    json.push('}');
}

// ---------------------------------------------------------------------------
// Passthrough transcoder
// ---------------------------------------------------------------------------

/// Re-frames a native Messages stream through [`TranscoderState`].
///
/// Block indices are renumbered so text stays at 0; thinking blocks and
/// unknown deltas are not forwarded.
#[derive(Debug)]
pub struct AnthropicPassthroughTranscoder {
    state: TranscoderState,
}

impl AnthropicPassthroughTranscoder {
    #[must_use]
    pub fn new(model: &str) -> Self {
        Self {
            state: TranscoderState::new(model),
        }
    }

    #[must_use]
    pub fn state(&self) -> &TranscoderState {
        &self.state
    }

    pub fn push_event(
        &mut self,
        event: &SseEvent,
        trace: &mut TransformTrace,
    ) -> Vec<CanonicalStreamEvent> {
        let mut out = Vec::new();
        if self.state.is_terminal() {
            return out;
        }
        let parsed: AnthropicStreamEvent = match serde_json::from_str(&event.data) {
            Ok(parsed) => parsed,
            Err(err) => {
                trace.bump_metadata("skippedFrames", 1);
                tracing::debug!(error = %err, "skipping unparseable messages stream frame");
                return out;
            }
        };
        let state = &mut self.state;
        match parsed {
            AnthropicStreamEvent::MessageStart { message } => {
                state.set_model(&message.model);
                state.merge_usage(&message.usage);
                state.ensure_started(&mut out);
            }
            AnthropicStreamEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                AnthropicContentBlockStart::Text { text } => state.push_text(&text, &mut out),
                AnthropicContentBlockStart::ToolUse { id, name } => state.tool_fragment(
                    upstream_key(index),
                    Some(&id),
                    Some(&name),
                    "",
                    trace,
                    &mut out,
                ),
                AnthropicContentBlockStart::Other => state.ensure_started(&mut out),
            },
            AnthropicStreamEvent::ContentBlockDelta { index, delta } => match delta {
                AnthropicDelta::TextDelta { text } => state.push_text(&text, &mut out),
                AnthropicDelta::InputJsonDelta { partial_json } => {
                    let key = upstream_key(index);
                    if state.is_tool_pending(&key) {
                        state.tool_fragment(key, None, None, &partial_json, trace, &mut out);
                    }
                }
                AnthropicDelta::Other => trace.bump_metadata("droppedDeltas", 1),
            },
            AnthropicStreamEvent::ContentBlockStop { index } => {
                state.close_tool(&upstream_key(index), false, trace, &mut out);
            }
            AnthropicStreamEvent::MessageDelta { delta, usage } => {
                state.set_stop_reason(anthropic_stop(delta.stop_reason.as_deref()));
                if let Some(usage) = usage {
                    state.merge_usage(&usage);
                }
            }
            AnthropicStreamEvent::MessageStop {} => state.finish(true, trace, &mut out),
            AnthropicStreamEvent::Ping {} => {}
            AnthropicStreamEvent::Error { error } => {
                let message = if error.type_.is_empty() {
                    error.message
                } else {
                    format!("{}: {}", error.type_, error.message)
                };
                state.fail(&message, trace, &mut out);
            }
        }
        out
    }

    pub fn finalize(&mut self, trace: &mut TransformTrace) -> Vec<CanonicalStreamEvent> {
        let mut out = Vec::new();
        self.state.finish(false, trace, &mut out);
        out
    }
}

fn upstream_key(index: usize) -> ToolKey {
    ToolKey::Index(u32::try_from(index).unwrap_or(u32::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::canonical::StopReason;

    #[test]
    fn test_encode_message_delta_without_usage_has_zero_output_tokens() {
        let out = encode_events(&[CanonicalStreamEvent::MessageDelta {
            stop_reason: StopReason::EndTurn,
            usage: None,
        }]);
        assert_eq!(
            out,
            "event: message_delta\ndata: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\",\"stop_sequence\":null},\"usage\":{\"output_tokens\":0}}\n\n"
        );
    }

    #[test]
    fn test_encoded_frames_are_valid_json() {
        let events = [
            CanonicalStreamEvent::MessageStart {
                id: "msg_1".into(),
                model: "m".into(),
                usage: Usage {
                    input_tokens: 3,
                    cache_read_input_tokens: Some(7),
                    ..Usage::default()
                },
            },
            CanonicalStreamEvent::ContentBlockStart {
                index: 1,
                block: BlockStart::ToolUse {
                    id: "toolu_1".into(),
                    name: "get_weather".into(),
                },
            },
            CanonicalStreamEvent::ContentBlockDelta {
                index: 1,
                delta: BlockDelta::PartialJson("{\"location\":\"To".into()),
            },
            CanonicalStreamEvent::Error {
                message: "line\nbreak".into(),
            },
        ];
        for event in &events {
            let mut json = String::new();
            encode_event_json(event, &mut json);
            let value: serde_json::Value = serde_json::from_str(&json).expect("valid json");
            assert_eq!(value["type"], event.event_type());
        }
        let mut json = String::new();
        encode_event_json(&events[0], &mut json);
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["message"]["usage"]["cache_read_input_tokens"], 7);
    }

    #[test]
    fn test_passthrough_renumbers_and_terminates() {
        let mut transcoder = AnthropicPassthroughTranscoder::new("claude");
        let mut trace = TransformTrace::new("s1", "Native");
        let frames = [
            r#"{"type":"message_start","message":{"id":"msg_up","model":"claude","usage":{"input_tokens":5,"output_tokens":0}}}"#,
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"thinking","thinking":""}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"hmm"}}"#,
            r#"{"type":"content_block_stop","index":0}"#,
            r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_9","name":"ls"}}"#,
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{}"}}"#,
            r#"{"type":"content_block_stop","index":1}"#,
            r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":9}}"#,
        ];
        let mut events = Vec::new();
        for data in frames {
            events.extend(transcoder.push_event(&SseEvent::data(data), &mut trace));
        }
        events.extend(transcoder.finalize(&mut trace));

        assert!(events.contains(&CanonicalStreamEvent::ContentBlockStart {
            index: 1,
            block: BlockStart::ToolUse {
                id: "toolu_9".into(),
                name: "ls".into()
            }
        }));
        assert_eq!(events.last(), Some(&CanonicalStreamEvent::MessageStop));
        assert!(trace.metadata_flag("missingUpstreamCompleted"));
        let final_delta = events
            .iter()
            .rev()
            .find_map(|event| match event {
                CanonicalStreamEvent::MessageDelta { stop_reason, usage } => {
                    Some((*stop_reason, *usage))
                }
                _ => None,
            })
            .unwrap();
        assert_eq!(final_delta.0, StopReason::ToolUse);
        assert_eq!(final_delta.1.unwrap().output_tokens, 9);
    }

    #[test]
    fn test_passthrough_forwards_native_message_delta() {
        let mut transcoder = AnthropicPassthroughTranscoder::new("claude");
        let mut trace = TransformTrace::new("s1", "Native");
        let frames = [
            r#"{"type":"message_start","message":{"id":"msg_up","type":"message","role":"assistant","model":"claude","content":[],"usage":{"input_tokens":12,"output_tokens":1}}}"#,
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hello"}}"#,
            r#"{"type":"content_block_stop","index":0}"#,
            r#"{"type":"message_delta","delta":{"stop_reason":"max_tokens","stop_sequence":null},"usage":{"output_tokens":4096}}"#,
            r#"{"type":"message_stop"}"#,
        ];
        let mut events = Vec::new();
        for data in frames {
            events.extend(transcoder.push_event(&SseEvent::data(data), &mut trace));
        }

        assert!(!trace.metadata.contains_key("skippedFrames"));
        assert!(!trace.metadata_flag("missingUpstreamCompleted"));
        let (stop_reason, usage) = events
            .iter()
            .find_map(|event| match event {
                CanonicalStreamEvent::MessageDelta { stop_reason, usage } => {
                    Some((*stop_reason, *usage))
                }
                _ => None,
            })
            .unwrap();
        assert_eq!(stop_reason, StopReason::MaxTokens);
        let usage = usage.unwrap();
        assert_eq!(usage.output_tokens, 4096);
        assert_eq!(usage.input_tokens, 12);
        assert_eq!(events.last(), Some(&CanonicalStreamEvent::MessageStop));
    }
}
