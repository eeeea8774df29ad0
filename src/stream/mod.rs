//! Upstream SSE framing, per-connection transcoding state, and the async
//! driver that turns an upstream body into client frames.

pub mod driver;
pub mod sse;
pub mod state;
pub mod transcoder;

pub use driver::{transcode_sse_body, CompletionCallback, StreamOutcome, TranscodedSseStream};
pub use sse::{SseEvent, SseParser};
pub use transcoder::StreamTranscoder;
