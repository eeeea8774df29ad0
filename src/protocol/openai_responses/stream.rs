use super::{
    custom_tool_input, error_message, ResponsesEnvelope, ResponsesItem, ResponsesStreamEvent,
};
use crate::config::CustomToolCallStrategy;
use crate::protocol::canonical::{BlockDelta, CanonicalStreamEvent};
use crate::protocol::mapping::{responses_status_to_stop, responses_usage};
use crate::protocol::tool_name::ShortNameMap;
use crate::stream::sse::SseEvent;
use crate::stream::state::{ToolKey, TranscoderState};
use crate::transform::trace::TransformTrace;

/// Responses API (Codex) stream to client events.
///
/// Function calls are keyed by output item id. `output_item.added` opens the
/// block, argument deltas stream into it, and `output_item.done` forwards
/// whatever the deltas missed before closing it as a tool-use boundary.
/// Final arguments that contradict the streamed ones are resent whole.
#[derive(Debug)]
pub struct OpenAiResponsesTranscoder {
    state: TranscoderState,
    tool_names: ShortNameMap,
    strategy: CustomToolCallStrategy,
}

impl OpenAiResponsesTranscoder {
    #[must_use]
    pub fn new(model: &str, tool_names: ShortNameMap, strategy: CustomToolCallStrategy) -> Self {
        Self {
            state: TranscoderState::new(model),
            tool_names,
            strategy,
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
        if self.state.is_terminal() || event.is_done() {
            return out;
        }
        let parsed: ResponsesStreamEvent = match serde_json::from_str(&event.data) {
            Ok(parsed) => parsed,
            Err(err) => {
                trace.bump_metadata("skippedFrames", 1);
                tracing::debug!(error = %err, "skipping unparseable responses stream frame");
                return out;
            }
        };

        match parsed {
            ResponsesStreamEvent::Created { response } => {
                if let Some(model) = response.model.as_deref() {
                    self.state.set_model(model);
                }
                self.state.ensure_started(&mut out);
            }
            ResponsesStreamEvent::OutputTextDelta { delta }
            | ResponsesStreamEvent::RefusalDelta { delta } => {
                self.state.push_text(&delta, &mut out);
            }
            ResponsesStreamEvent::OutputItemAdded { item } => {
                self.item_added(&item, trace, &mut out);
            }
            ResponsesStreamEvent::FunctionCallArgumentsDelta { item_id, delta } => {
                self.state.ensure_started(&mut out);
                match item_id {
                    Some(item_id) => {
                        let key = ToolKey::Id(item_id);
                        if self.state.is_tool_pending(&key) {
                            self.state.tool_fragment(key, None, None, &delta, trace, &mut out);
                        }
                    }
                    None => tracing::debug!("argument delta without item_id"),
                }
            }
            ResponsesStreamEvent::OutputItemDone { item } => self.item_done(&item, trace, &mut out),
            ResponsesStreamEvent::ReasoningSummaryDelta { delta }
            | ResponsesStreamEvent::ReasoningTextDelta { delta } => {
                self.state.ensure_started(&mut out);
                let chars = u64::try_from(delta.chars().count()).unwrap_or(u64::MAX);
                trace.bump_metadata("reasoningChars", chars);
            }
            ResponsesStreamEvent::Completed { response }
            | ResponsesStreamEvent::Incomplete { response } => {
                self.apply_terminal_response(&response);
                self.state.finish(true, trace, &mut out);
            }
            ResponsesStreamEvent::Failed { response } => {
                let message = response
                    .error
                    .as_ref()
                    .filter(|error| !error.is_null())
                    .map_or_else(|| "upstream response failed".to_string(), error_message);
                self.state.fail(&message, trace, &mut out);
            }
            ResponsesStreamEvent::Error {
                code,
                message,
                error,
            } => {
                let error = error.as_ref().filter(|error| !error.is_null());
                let message = match (error, code, message) {
                    (Some(error), _, _) => error_message(error),
                    (None, Some(code), Some(message)) => format!("{code}: {message}"),
                    (None, None, Some(message)) => message,
                    (None, Some(code), None) => code,
                    (None, None, None) => "upstream stream error".to_string(),
                };
                self.state.fail(&message, trace, &mut out);
            }
            ResponsesStreamEvent::Other => self.state.ensure_started(&mut out),
        }
        out
    }

    fn apply_terminal_response(&mut self, response: &ResponsesEnvelope) {
        if let Some(usage) = response.usage.as_ref().filter(|usage| usage.is_object()) {
            self.state.merge_usage(&responses_usage(usage));
        }
        let reason = response
            .incomplete_details
            .as_ref()
            .and_then(|details| details.reason.as_deref());
        self.state.set_stop_reason(responses_status_to_stop(
            response.status.as_deref(),
            reason,
            self.state.saw_tool_call(),
        ));
    }

    fn item_added(
        &mut self,
        item: &ResponsesItem,
        trace: &mut TransformTrace,
        out: &mut Vec<CanonicalStreamEvent>,
    ) {
        self.state.ensure_started(out);
        if item.kind != "function_call" {
            return;
        }
        let Some(key) = item.stream_key().map(|id| ToolKey::Id(id.to_string())) else {
            return;
        };
        let name = self.tool_names.restore(item.name.as_deref().unwrap_or_default());
        let arguments = item.arguments.as_deref().unwrap_or_default();
        let was_started = self.state.tool_block_index(&key).is_some();
        self.state
            .tool_fragment(key.clone(), item.client_call_id(), Some(name), arguments, trace, out);
        if let (false, Some(index), true) = (
            was_started,
            self.state.tool_block_index(&key),
            arguments.is_empty(),
        ) {
            out.push(CanonicalStreamEvent::ContentBlockDelta {
                index,
                delta: BlockDelta::PartialJson(String::new()),
            });
        }
    }

    fn item_done(
        &mut self,
        item: &ResponsesItem,
        trace: &mut TransformTrace,
        out: &mut Vec<CanonicalStreamEvent>,
    ) {
        self.state.ensure_started(out);
        let Some(key) = item.stream_key().map(|id| ToolKey::Id(id.to_string())) else {
            return;
        };
        let name = self.tool_names.restore(item.name.as_deref().unwrap_or_default());
        match item.kind.as_str() {
            "function_call" => {
                let full = item.arguments.as_deref().unwrap_or_default();
                match self.state.tool_arguments(&key).map(str::to_string) {
                    None => self.state.tool_fragment(
                        key.clone(),
                        item.client_call_id(),
                        Some(name),
                        full,
                        trace,
                        out,
                    ),
                    Some(streamed) => match full.strip_prefix(streamed.as_str()) {
                        Some(suffix) => {
                            self.state
                                .tool_fragment(key.clone(), None, None, suffix, trace, out);
                        }
                        // A done item without arguments keeps what was streamed.
                        None if full.is_empty() => {}
                        None => self.state.replace_tool_arguments(&key, full, trace, out),
                    },
                }
                self.state.close_tool(&key, true, trace, out);
            }
            "custom_tool_call" => {
                let input = item.input.as_deref().unwrap_or_default();
                match custom_tool_input(name, input, self.strategy) {
                    Ok(value) => {
                        self.state.tool_fragment(
                            key.clone(),
                            item.client_call_id(),
                            Some(name),
                            &value.to_string(),
                            trace,
                            out,
                        );
                        self.state.close_tool(&key, true, trace, out);
                    }
                    Err(message) => {
                        tracing::warn!(tool = name, "rejecting custom tool call with string input");
                        self.state.fail(&message, trace, out);
                    }
                }
            }
            _ => {}
        }
    }

    pub fn finalize(&mut self, trace: &mut TransformTrace) -> Vec<CanonicalStreamEvent> {
        let mut out = Vec::new();
        self.state.finish(false, trace, &mut out);
        out
    }
}
