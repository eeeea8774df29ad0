//! Async glue between an upstream byte stream and the client SSE body.
//!
//! The transcoders are synchronous; this module feeds them from the
//! network and guarantees the terminal sequence on every exit path:
//! upstream EOF, upstream transport error, and the client going away.

use std::collections::VecDeque;
use std::fmt::Display;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::Stream;
use pin_project_lite::pin_project;

use super::sse::{SseEvent, SseParser, Utf8Decoder};
use super::transcoder::StreamTranscoder;
use crate::protocol::canonical::StopReason;
use crate::transform::trace::TransformTrace;

/// How a transcoded stream ended, handed to the completion callback.
#[derive(Debug)]
pub struct StreamOutcome {
    pub trace: TransformTrace,
    /// The client stopped reading before `message_stop` was delivered.
    pub partial: bool,
    pub stop_reason: Option<StopReason>,
}

pub type CompletionCallback = Box<dyn FnOnce(StreamOutcome) + Send>;

struct Session {
    transcoder: StreamTranscoder,
    parser: SseParser,
    decoder: Utf8Decoder,
    events: Vec<SseEvent>,
    pending: VecDeque<Bytes>,
    trace: Option<TransformTrace>,
    on_complete: Option<CompletionCallback>,
    upstream_done: bool,
}

impl Session {
    fn trace_mut(&mut self) -> Option<&mut TransformTrace> {
        self.trace.as_mut()
    }

    /// Transcode every complete frame in `events` into `pending`.
    fn drain_events(&mut self) {
        let Some(trace) = self.trace.as_mut() else {
            return;
        };
        let mut out = String::new();
        for event in self.events.drain(..) {
            self.transcoder.push_event_into(&event, trace, &mut out);
            if self.transcoder.is_terminal() {
                break;
            }
        }
        if !out.is_empty() {
            self.pending.push_back(Bytes::from(out));
        }
    }

    fn on_chunk(&mut self, chunk: &[u8]) {
        self.decoder
            .decode_into(chunk, &mut self.parser, &mut self.events);
        self.drain_events();
        if self.transcoder.is_terminal() {
            self.upstream_done = true;
        }
    }

    fn on_upstream_end(&mut self) {
        self.parser.finish(&mut self.events);
        self.drain_events();
        self.finalize();
        self.upstream_done = true;
    }

    fn on_upstream_error(&mut self, message: String) {
        tracing::warn!(error = %message, "upstream stream read failed");
        if let Some(trace) = self.trace_mut() {
            trace.warn(format!("Upstream read failed: {message}"));
        }
        self.finalize();
        self.upstream_done = true;
    }

    fn finalize(&mut self) {
        let Some(trace) = self.trace.as_mut() else {
            return;
        };
        let mut out = String::new();
        self.transcoder.finalize_into(trace, &mut out);
        if !out.is_empty() {
            self.pending.push_back(Bytes::from(out));
        }
    }

    fn complete(&mut self, partial: bool) {
        let Some(mut trace) = self.trace.take() else {
            return;
        };
        if partial {
            // The client is gone; terminate locally and discard the frames.
            let _ = self.transcoder.finalize(&mut trace);
            trace.set_metadata("clientDisconnected", true);
            tracing::info!(supplier = %trace.supplier_id, "client disconnected mid-stream");
        }
        let stop_reason = self.transcoder.state().stop_reason();
        if let Some(on_complete) = self.on_complete.take() {
            on_complete(StreamOutcome {
                trace,
                partial,
                stop_reason,
            });
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let partial = !(self.upstream_done && self.pending.is_empty());
        self.complete(partial);
    }
}

pin_project! {
    /// Client SSE bytes transcoded from an upstream byte stream.
    pub struct TranscodedSseStream<S> {
        #[pin]
        upstream: S,
        session: Session,
    }
}

/// Wrap `upstream` so it yields client SSE frames.
///
/// `on_complete` runs exactly once: when the last frame has been yielded,
/// or when the stream is dropped early, in which case the outcome is
/// marked partial.
pub fn transcode_sse_body<S, E>(
    upstream: S,
    transcoder: StreamTranscoder,
    trace: TransformTrace,
    on_complete: Option<CompletionCallback>,
) -> TranscodedSseStream<S>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    TranscodedSseStream {
        upstream,
        session: Session {
            transcoder,
            parser: SseParser::new(),
            decoder: Utf8Decoder::default(),
            events: Vec::with_capacity(8),
            pending: VecDeque::with_capacity(4),
            trace: Some(trace),
            on_complete,
            upstream_done: false,
        },
    }
}

impl<S, E> Stream for TranscodedSseStream<S>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    type Item = Bytes;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            if let Some(frame) = this.session.pending.pop_front() {
                return Poll::Ready(Some(frame));
            }
            if this.session.upstream_done {
                this.session.complete(false);
                return Poll::Ready(None);
            }
            match this.upstream.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => this.session.on_chunk(&chunk),
                Poll::Ready(Some(Err(err))) => this.session.on_upstream_error(err.to_string()),
                Poll::Ready(None) => this.session.on_upstream_end(),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CustomToolCallStrategy;
    use crate::protocol::canonical::TargetProtocol;
    use crate::protocol::tool_name::ShortNameMap;
    use futures_util::StreamExt;
    use std::sync::{Arc, Mutex};

    fn chat_transcoder() -> StreamTranscoder {
        StreamTranscoder::new(
            TargetProtocol::OpenAiChat,
            "gpt-4o",
            ShortNameMap::default(),
            CustomToolCallStrategy::default(),
        )
    }

    fn recorder() -> (Arc<Mutex<Option<StreamOutcome>>>, Option<CompletionCallback>) {
        let slot = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&slot);
        let callback: CompletionCallback = Box::new(move |outcome| {
            *sink.lock().unwrap() = Some(outcome);
        });
        (slot, Some(callback))
    }

    #[tokio::test]
    async fn test_split_frames_are_reassembled() {
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n")),
            Ok(Bytes::from_static(b"\ndata: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n")),
            Ok(Bytes::from_static(b"data: [DONE]\n\n")),
        ];
        let (slot, callback) = recorder();
        let stream = transcode_sse_body(
            futures_util::stream::iter(chunks),
            chat_transcoder(),
            TransformTrace::new("s", "S"),
            callback,
        );
        let frames: Vec<Bytes> = stream.collect().await;
        let body: String = frames
            .iter()
            .map(|frame| String::from_utf8_lossy(frame).into_owned())
            .collect();
        assert!(body.contains("\"text\":\"Hi\""));
        assert_eq!(body.matches("event: message_stop").count(), 1);

        let outcome = slot.lock().unwrap().take().unwrap();
        assert!(!outcome.partial);
        assert_eq!(outcome.stop_reason, Some(StopReason::EndTurn));
    }

    #[tokio::test]
    async fn test_upstream_error_still_terminates() {
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n")),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
        ];
        let stream = transcode_sse_body(
            futures_util::stream::iter(chunks),
            chat_transcoder(),
            TransformTrace::new("s", "S"),
            None,
        );
        let frames: Vec<Bytes> = stream.collect().await;
        let body: String = frames
            .iter()
            .map(|frame| String::from_utf8_lossy(frame).into_owned())
            .collect();
        assert!(body.ends_with("event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n"));
    }

    #[tokio::test]
    async fn test_client_drop_reports_partial() {
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![Ok(Bytes::from_static(
            b"data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n",
        ))];
        let (slot, callback) = recorder();
        let upstream = futures_util::stream::iter(chunks).chain(futures_util::stream::pending());
        let mut stream = Box::pin(transcode_sse_body(
            upstream,
            chat_transcoder(),
            TransformTrace::new("s", "S"),
            callback,
        ));
        let first = stream.next().await;
        assert!(first.is_some());
        drop(stream);

        let outcome = slot.lock().unwrap().take().unwrap();
        assert!(outcome.partial);
        assert!(outcome.trace.metadata_flag("clientDisconnected"));
    }
}
