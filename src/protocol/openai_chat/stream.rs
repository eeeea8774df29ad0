use super::{error_message, OpenAiStreamChunk};
use crate::protocol::canonical::CanonicalStreamEvent;
use crate::protocol::mapping::{openai_chat_usage, openai_finish_to_stop};
use crate::stream::sse::SseEvent;
use crate::stream::state::{ToolKey, TranscoderState};
use crate::transform::trace::TransformTrace;

/// Chat Completions stream to client events.
///
/// Tool calls are keyed by `tool_calls[].index`. A `finish_reason` or the
/// `[DONE]` sentinel counts as the completion marker; the terminal sequence
/// itself is deferred to `[DONE]` or `finalize` so a trailing usage-only
/// chunk is still reported.
#[derive(Debug)]
pub struct OpenAiChatTranscoder {
    state: TranscoderState,
    saw_finish: bool,
}

impl OpenAiChatTranscoder {
    #[must_use]
    pub fn new(model: &str) -> Self {
        Self {
            state: TranscoderState::new(model),
            saw_finish: false,
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
        if event.is_done() {
            self.state.finish(true, trace, &mut out);
            return out;
        }
        let chunk: OpenAiStreamChunk = match serde_json::from_str(&event.data) {
            Ok(chunk) => chunk,
            Err(err) => {
                trace.bump_metadata("skippedFrames", 1);
                tracing::debug!(error = %err, "skipping unparseable chat stream frame");
                return out;
            }
        };

        if let Some(error) = chunk.error.as_ref().filter(|error| !error.is_null()) {
            self.state.fail(&error_message(error), trace, &mut out);
            return out;
        }
        if let Some(model) = chunk.model.as_deref() {
            self.state.set_model(model);
        }
        if let Some(usage) = chunk.usage.as_ref().filter(|usage| usage.is_object()) {
            self.state.merge_usage(&openai_chat_usage(usage));
        }

        for choice in chunk.choices {
            let delta = choice.delta;
            if let Some(content) = delta.content.as_deref() {
                self.state.push_text(content, &mut out);
            } else if let Some(refusal) = delta.refusal.as_deref() {
                self.state.push_text(refusal, &mut out);
            } else {
                self.state.ensure_started(&mut out);
            }

            for (position, call) in delta.tool_calls.unwrap_or_default().into_iter().enumerate() {
                let index = call
                    .index
                    .unwrap_or_else(|| u32::try_from(position).unwrap_or(u32::MAX));
                let (name, arguments) = match call.function {
                    Some(function) => (function.name, function.arguments.unwrap_or_default()),
                    None => (None, String::new()),
                };
                self.state.tool_fragment(
                    ToolKey::Index(index),
                    call.id.as_deref(),
                    name.as_deref(),
                    &arguments,
                    trace,
                    &mut out,
                );
            }

            if let Some(reason) = choice.finish_reason.as_deref() {
                self.state.set_stop_reason(openai_finish_to_stop(Some(reason)));
                self.saw_finish = true;
            }
        }
        out
    }

    /// Terminate after upstream EOF; a seen `finish_reason` counts as completion.
    pub fn finalize(&mut self, trace: &mut TransformTrace) -> Vec<CanonicalStreamEvent> {
        let mut out = Vec::new();
        self.state.finish(self.saw_finish, trace, &mut out);
        out
    }
}
