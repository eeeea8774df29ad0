use crate::config::CustomToolCallStrategy;
use crate::protocol::anthropic::stream::{encode_event_frame, AnthropicPassthroughTranscoder};
use crate::protocol::canonical::{CanonicalStreamEvent, TargetProtocol};
use crate::protocol::gemini::stream::GeminiTranscoder;
use crate::protocol::openai_chat::stream::OpenAiChatTranscoder;
use crate::protocol::openai_responses::stream::OpenAiResponsesTranscoder;
use crate::protocol::tool_name::ShortNameMap;
use crate::stream::sse::SseEvent;
use crate::stream::state::TranscoderState;
use crate::transform::trace::TransformTrace;

/// Converts one upstream event stream into client events.
///
/// One variant per upstream protocol; every variant exposes the same
/// `push_event`/`finalize` pair over its own [`TranscoderState`].
#[derive(Debug)]
pub enum StreamTranscoder {
    Anthropic(AnthropicPassthroughTranscoder),
    OpenAiChat(OpenAiChatTranscoder),
    OpenAiResponses(OpenAiResponsesTranscoder),
    Gemini(GeminiTranscoder),
}

impl StreamTranscoder {
    /// `tool_names` is only consulted by the Responses variant.
    #[must_use]
    pub fn new(
        protocol: TargetProtocol,
        model: &str,
        tool_names: ShortNameMap,
        custom_tool_call_strategy: CustomToolCallStrategy,
    ) -> Self {
        match protocol {
            TargetProtocol::Anthropic => {
                StreamTranscoder::Anthropic(AnthropicPassthroughTranscoder::new(model))
            }
            TargetProtocol::OpenAiChat => {
                StreamTranscoder::OpenAiChat(OpenAiChatTranscoder::new(model))
            }
            TargetProtocol::OpenAiResponses => StreamTranscoder::OpenAiResponses(
                OpenAiResponsesTranscoder::new(model, tool_names, custom_tool_call_strategy),
            ),
            TargetProtocol::Gemini => StreamTranscoder::Gemini(GeminiTranscoder::new(model)),
        }
    }

    #[must_use]
    pub fn protocol(&self) -> TargetProtocol {
        match self {
            StreamTranscoder::Anthropic(_) => TargetProtocol::Anthropic,
            StreamTranscoder::OpenAiChat(_) => TargetProtocol::OpenAiChat,
            StreamTranscoder::OpenAiResponses(_) => TargetProtocol::OpenAiResponses,
            StreamTranscoder::Gemini(_) => TargetProtocol::Gemini,
        }
    }

    #[must_use]
    pub fn state(&self) -> &TranscoderState {
        match self {
            StreamTranscoder::Anthropic(inner) => inner.state(),
            StreamTranscoder::OpenAiChat(inner) => inner.state(),
            StreamTranscoder::OpenAiResponses(inner) => inner.state(),
            StreamTranscoder::Gemini(inner) => inner.state(),
        }
    }

    /// Whether `message_stop` has been emitted.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn push_event(
        &mut self,
        event: &SseEvent,
        trace: &mut TransformTrace,
    ) -> Vec<CanonicalStreamEvent> {
        match self {
            StreamTranscoder::Anthropic(inner) => inner.push_event(event, trace),
            StreamTranscoder::OpenAiChat(inner) => inner.push_event(event, trace),
            StreamTranscoder::OpenAiResponses(inner) => inner.push_event(event, trace),
            StreamTranscoder::Gemini(inner) => inner.push_event(event, trace),
        }
    }

    /// Emit whatever is needed to end the client stream. Idempotent.
    pub fn finalize(&mut self, trace: &mut TransformTrace) -> Vec<CanonicalStreamEvent> {
        match self {
            StreamTranscoder::Anthropic(inner) => inner.finalize(trace),
            StreamTranscoder::OpenAiChat(inner) => inner.finalize(trace),
            StreamTranscoder::OpenAiResponses(inner) => inner.finalize(trace),
            StreamTranscoder::Gemini(inner) => inner.finalize(trace),
        }
    }

    /// Transcode one upstream event straight into client SSE text.
    pub fn push_event_into(
        &mut self,
        event: &SseEvent,
        trace: &mut TransformTrace,
        out: &mut String,
    ) {
        for canonical in self.push_event(event, trace) {
            encode_event_frame(&canonical, out);
        }
    }

    /// Finalize straight into client SSE text.
    pub fn finalize_into(&mut self, trace: &mut TransformTrace, out: &mut String) {
        for canonical in self.finalize(trace) {
            encode_event_frame(&canonical, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_protocol_terminates_on_empty_input() {
        for protocol in [
            TargetProtocol::Anthropic,
            TargetProtocol::OpenAiChat,
            TargetProtocol::OpenAiResponses,
            TargetProtocol::Gemini,
        ] {
            let mut transcoder = StreamTranscoder::new(
                protocol,
                "m",
                ShortNameMap::default(),
                CustomToolCallStrategy::default(),
            );
            assert_eq!(transcoder.protocol(), protocol);
            let mut trace = TransformTrace::new("s", "S");
            let mut out = String::new();
            transcoder.finalize_into(&mut trace, &mut out);
            assert!(out.starts_with("event: message_start\n"), "{protocol:?}: {out}");
            assert!(out.ends_with("event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n"));
            assert!(transcoder.is_terminal());

            let mut again = String::new();
            transcoder.finalize_into(&mut trace, &mut again);
            assert!(again.is_empty(), "{protocol:?} finalized twice");
        }
    }
}
