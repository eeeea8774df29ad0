use serde_json::{Map, Value};

use super::response_decoder::blocked_reason;
use super::{error_message, GeminiChunk, GeminiFunctionCallPart};
use crate::protocol::canonical::CanonicalStreamEvent;
use crate::protocol::mapping::{gemini_finish_to_stop, gemini_stop_with_tools, gemini_usage};
use crate::stream::sse::SseEvent;
use crate::stream::state::{ToolKey, TranscoderState};
use crate::transform::trace::TransformTrace;
use crate::util::generate_tool_use_id;

/// Metadata key naming why a stream was judged invalid.
pub const INVALID_STREAM_TYPE: &str = "invalidStreamType";

const MALFORMED_FUNCTION_CALL: &str = "MALFORMED_FUNCTION_CALL";
const NO_RESPONSE_TEXT: &str = "NO_RESPONSE_TEXT";

/// The call currently accepting continuation fragments.
#[derive(Debug)]
struct OpenCall {
    key: ToolKey,
    id: String,
    name: String,
    args: Map<String, Value>,
    /// Chunk in which the call was last extended.
    chunk: u64,
}

/// Gemini `streamGenerateContent?alt=sse` stream to client events.
///
/// Function calls arrive as structured argument objects. A fragment without
/// a name, or one repeating the open call's name and id in a later chunk, is
/// a continuation: its keys are merged into the open call and the merged
/// object is re-emitted whole. A named fragment without an id always starts
/// a new call. `finishReason` is the completion marker.
#[derive(Debug)]
pub struct GeminiTranscoder {
    state: TranscoderState,
    open_call: Option<OpenCall>,
    chunk_seq: u64,
    next_slot: u32,
    saw_content: bool,
}

impl GeminiTranscoder {
    #[must_use]
    pub fn new(model: &str) -> Self {
        Self {
            state: TranscoderState::new(model),
            open_call: None,
            chunk_seq: 0,
            next_slot: 0,
            saw_content: false,
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
        let data = event.data.trim_start();
        // Some proxies forward the JSON-array form in a single frame.
        let parsed = if data.starts_with('[') {
            serde_json::from_str::<Vec<GeminiChunk>>(data)
        } else {
            serde_json::from_str::<GeminiChunk>(data).map(|chunk| vec![chunk])
        };
        let chunks = match parsed {
            Ok(chunks) => chunks,
            Err(err) => {
                trace.bump_metadata("skippedFrames", 1);
                tracing::debug!(error = %err, "skipping unparseable gemini stream frame");
                return out;
            }
        };
        for chunk in &chunks {
            self.push_chunk(chunk, trace, &mut out);
            if self.state.is_terminal() {
                break;
            }
        }
        out
    }

    fn push_chunk(
        &mut self,
        chunk: &GeminiChunk,
        trace: &mut TransformTrace,
        out: &mut Vec<CanonicalStreamEvent>,
    ) {
        self.chunk_seq += 1;
        if let Some(error) = chunk.error.as_ref().filter(|error| !error.is_null()) {
            self.state.fail(&error_message(error), trace, out);
            return;
        }
        if let Some(reason) = blocked_reason(chunk) {
            self.state.fail(&format!("Prompt blocked: {reason}"), trace, out);
            return;
        }
        if let Some(model) = chunk.model_version.as_deref() {
            self.state.set_model(model);
        }
        if let Some(usage) = chunk.usage_metadata.as_ref().filter(|usage| usage.is_object()) {
            self.state.merge_usage(&gemini_usage(usage));
        }

        if let Some(kind) = self.invalid_kind(chunk) {
            trace.set_metadata(INVALID_STREAM_TYPE, kind);
            self.state.fail(&format!("Invalid stream: {kind}"), trace, out);
            return;
        }
        if chunk.candidates.is_empty() {
            return;
        }
        self.state.ensure_started(out);

        let mut reasoning_chars = 0u64;
        for part in chunk.parts() {
            if let Some(text) = part.text.as_deref() {
                self.saw_content = true;
                if part.thought {
                    reasoning_chars += u64::try_from(text.chars().count()).unwrap_or(u64::MAX);
                    continue;
                }
                if text.is_empty() {
                    continue;
                }
                if let Some(call) = self.open_call.take() {
                    self.state.close_tool(&call.key, true, trace, out);
                }
                self.state.push_text(text, out);
            } else if let Some(call) = part.function_call.as_ref() {
                self.saw_content = true;
                self.push_function_call(call, trace, out);
            }
        }
        if reasoning_chars > 0 {
            trace.bump_metadata("reasoningChars", reasoning_chars);
        }

        if let Some(reason) = chunk.finish_reason() {
            let stop = gemini_stop_with_tools(
                gemini_finish_to_stop(Some(reason)),
                self.state.saw_tool_call(),
            );
            self.state.set_stop_reason(stop);
            self.open_call = None;
            self.state.finish(true, trace, out);
        }
    }

    /// Why `chunk` makes the stream invalid, if it does.
    fn invalid_kind(&self, chunk: &GeminiChunk) -> Option<&'static str> {
        if chunk.finish_reason() == Some(MALFORMED_FUNCTION_CALL) {
            return Some(MALFORMED_FUNCTION_CALL);
        }
        if self.saw_content || chunk.candidates.is_empty() {
            return None;
        }
        let has_payload = chunk
            .parts()
            .iter()
            .any(|part| part.text.is_some() || part.function_call.is_some());
        (!has_payload).then_some(NO_RESPONSE_TEXT)
    }

    fn push_function_call(
        &mut self,
        call: &GeminiFunctionCallPart,
        trace: &mut TransformTrace,
        out: &mut Vec<CanonicalStreamEvent>,
    ) {
        let name = call.name.as_deref().filter(|name| !name.is_empty());
        let id = call.id.as_deref().filter(|id| !id.is_empty());
        let continues = self.open_call.as_ref().is_some_and(|open| match (name, id) {
            (None, _) => true,
            (Some(name), Some(id)) => {
                open.name == name && open.id == id && open.chunk < self.chunk_seq
            }
            (Some(_), None) => false,
        });

        if continues {
            if let Some(open) = self.open_call.as_mut() {
                if let Some(args) = call.args.as_ref() {
                    for (key, value) in args {
                        open.args.insert(key.clone(), value.clone());
                    }
                }
                open.chunk = self.chunk_seq;
            }
        } else {
            let Some(name) = name else {
                trace.warn("Dropped function call fragment without a name");
                tracing::debug!("gemini function call fragment has no name and no open call");
                return;
            };
            if let Some(previous) = self.open_call.take() {
                self.state.close_tool(&previous.key, true, trace, out);
            }
            let key = ToolKey::Index(self.next_slot);
            self.next_slot += 1;
            self.open_call = Some(OpenCall {
                key,
                id: id.map_or_else(generate_tool_use_id, str::to_string),
                name: name.to_string(),
                args: call.args.clone().unwrap_or_default(),
                chunk: self.chunk_seq,
            });
        }

        let Some(open) = self.open_call.as_ref() else {
            return;
        };
        let json = Value::Object(open.args.clone()).to_string();
        self.state
            .tool_snapshot(open.key.clone(), &open.id, &open.name, json, trace, out);
    }

    /// Terminate after upstream EOF. Without a `finishReason` the trace
    /// records the missing completion marker.
    pub fn finalize(&mut self, trace: &mut TransformTrace) -> Vec<CanonicalStreamEvent> {
        let mut out = Vec::new();
        self.open_call = None;
        self.state.finish(false, trace, &mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::canonical::{BlockDelta, BlockStart, StopReason};
    use crate::stream::state::MISSING_UPSTREAM_COMPLETED;

    fn run(frames: &[&str], finalize: bool) -> (Vec<CanonicalStreamEvent>, TransformTrace) {
        let mut transcoder = GeminiTranscoder::new("gemini-2.5-pro");
        let mut trace = TransformTrace::new("gemini", "Gemini");
        let mut events = Vec::new();
        for frame in frames {
            events.extend(transcoder.push_event(&SseEvent::data(*frame), &mut trace));
        }
        if finalize {
            events.extend(transcoder.finalize(&mut trace));
        }
        (events, trace)
    }

    fn partial_json(events: &[CanonicalStreamEvent]) -> Vec<&str> {
        events
            .iter()
            .filter_map(|event| match event {
                CanonicalStreamEvent::ContentBlockDelta {
                    delta: BlockDelta::PartialJson(json),
                    ..
                } => Some(json.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_text_then_finish() {
        let (events, trace) = run(
            &[
                r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Hi"}]}}],"modelVersion":"gemini-2.5-pro"}"#,
                r#"{"candidates":[{"content":{"role":"model","parts":[{"text":" there"}]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":5,"candidatesTokenCount":2}}"#,
            ],
            true,
        );
        let types: Vec<&str> = events.iter().map(CanonicalStreamEvent::event_type).collect();
        assert_eq!(
            types,
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        assert!(!trace.metadata_flag(MISSING_UPSTREAM_COMPLETED));
    }

    #[test]
    fn test_continuations_merge_by_key() {
        let (events, _) = run(
            &[
                r#"{"candidates":[{"content":{"parts":[{"functionCall":{"name":"write","args":{"path":"a.txt"}}}]}}]}"#,
                r#"{"candidates":[{"content":{"parts":[{"functionCall":{"args":{"body":"hi"}}}]}}]}"#,
                r#"{"candidates":[{"content":{"parts":[{"functionCall":{"args":{"mode":"w"}}}]},"finishReason":"STOP"}]}"#,
            ],
            false,
        );
        let starts = events
            .iter()
            .filter(|event| {
                matches!(
                    event,
                    CanonicalStreamEvent::ContentBlockStart {
                        block: BlockStart::ToolUse { .. },
                        ..
                    }
                )
            })
            .count();
        assert_eq!(starts, 1);
        assert_eq!(
            partial_json(&events),
            vec![
                r#"{"path":"a.txt"}"#,
                r#"{"body":"hi","path":"a.txt"}"#,
                r#"{"body":"hi","mode":"w","path":"a.txt"}"#,
            ]
        );
        assert!(events.contains(&CanonicalStreamEvent::MessageDelta {
            stop_reason: StopReason::ToolUse,
            usage: Some(Default::default())
        }));
    }

    #[test]
    fn test_same_name_in_one_chunk_is_parallel() {
        let (events, _) = run(
            &[r#"{"candidates":[{"content":{"parts":[
                {"functionCall":{"name":"read","args":{"path":"a"}}},
                {"functionCall":{"name":"read","args":{"path":"b"}}}
            ]},"finishReason":"STOP"}]}"#],
            false,
        );
        let indices: Vec<usize> = events
            .iter()
            .filter_map(|event| match event {
                CanonicalStreamEvent::ContentBlockStart {
                    index,
                    block: BlockStart::ToolUse { .. },
                } => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(indices, vec![1, 2]);
    }

    #[test]
    fn test_same_name_in_later_chunk_starts_new_call() {
        let (events, _) = run(
            &[
                r#"{"candidates":[{"content":{"parts":[{"functionCall":{"name":"read","args":{"path":"a"}}}]}}]}"#,
                r#"{"candidates":[{"content":{"parts":[{"functionCall":{"name":"read","args":{"path":"b"}}}]},"finishReason":"STOP"}]}"#,
            ],
            false,
        );
        let indices: Vec<usize> = events
            .iter()
            .filter_map(|event| match event {
                CanonicalStreamEvent::ContentBlockStart {
                    index,
                    block: BlockStart::ToolUse { .. },
                } => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(indices, vec![1, 2]);
        assert_eq!(partial_json(&events), vec![r#"{"path":"a"}"#, r#"{"path":"b"}"#]);
    }

    #[test]
    fn test_repeated_id_in_later_chunk_continues() {
        let (events, _) = run(
            &[
                r#"{"candidates":[{"content":{"parts":[{"functionCall":{"id":"c1","name":"read","args":{"path":"a"}}}]}}]}"#,
                r#"{"candidates":[{"content":{"parts":[{"functionCall":{"id":"c1","name":"read","args":{"limit":5}}}]},"finishReason":"STOP"}]}"#,
            ],
            false,
        );
        assert_eq!(
            partial_json(&events),
            vec![r#"{"path":"a"}"#, r#"{"limit":5,"path":"a"}"#]
        );
        assert!(events.contains(&CanonicalStreamEvent::ContentBlockStart {
            index: 1,
            block: BlockStart::ToolUse {
                id: "c1".into(),
                name: "read".into()
            }
        }));
    }

    #[test]
    fn test_empty_parts_without_finish_is_invalid() {
        let mut transcoder = GeminiTranscoder::new("gemini-2.5-pro");
        let mut trace = TransformTrace::new("gemini", "Gemini");
        let mut events = transcoder.push_event(
            &SseEvent::data(r#"{"candidates":[{"content":{"role":"model","parts":[]}}]}"#),
            &mut trace,
        );
        events.extend(transcoder.finalize(&mut trace));
        events.extend(transcoder.finalize(&mut trace));
        assert_eq!(
            events,
            vec![
                CanonicalStreamEvent::Error {
                    message: "Invalid stream: NO_RESPONSE_TEXT".into()
                },
                CanonicalStreamEvent::MessageStop,
            ]
        );
        assert_eq!(trace.metadata[INVALID_STREAM_TYPE], NO_RESPONSE_TEXT);
    }

    #[test]
    fn test_malformed_function_call_and_thoughts() {
        let (events, trace) = run(
            &[
                r#"{"candidates":[{"content":{"parts":[{"text":"hmm","thought":true}]}}]}"#,
                r#"{"candidates":[{"content":{"parts":[]},"finishReason":"MALFORMED_FUNCTION_CALL"}]}"#,
            ],
            true,
        );
        assert!(!events.iter().any(|event| matches!(
            event,
            CanonicalStreamEvent::ContentBlockDelta { .. }
        )));
        assert_eq!(
            events.iter().filter(|event| **event == CanonicalStreamEvent::MessageStop).count(),
            1
        );
        assert_eq!(trace.metadata["reasoningChars"], 3);
        assert_eq!(trace.metadata[INVALID_STREAM_TYPE], MALFORMED_FUNCTION_CALL);
    }

    #[test]
    fn test_array_frame_is_accepted() {
        let (events, _) = run(
            &[r#"[{"candidates":[{"content":{"parts":[{"text":"a"}]}}]},{"candidates":[{"content":{"parts":[{"text":"b"}]},"finishReason":"MAX_TOKENS"}]}]"#],
            false,
        );
        assert!(events.contains(&CanonicalStreamEvent::MessageDelta {
            stop_reason: StopReason::MaxTokens,
            usage: Some(Default::default())
        }));
    }
}
