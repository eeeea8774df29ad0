/// SSE (Server-Sent Events) frame parser and encoder.
///
/// Handles the low-level parsing of SSE frames from a byte stream,
/// including buffering partial lines and partial UTF-8 sequences, per the
/// [SSE specification](https://html.spec.whatwg.org/multipage/server-sent-events.html).
use memchr::memchr_iter;

/// A parsed SSE frame from the upstream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

impl SseEvent {
    /// Unnamed event carrying only `data`.
    #[must_use]
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
            id: None,
        }
    }

    /// Named event.
    #[must_use]
    pub fn named(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
            id: None,
        }
    }

    /// `OpenAI`-style terminal `[DONE]` marker.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

// ---------------------------------------------------------------------------
// SseParser — incremental SSE line parser
// ---------------------------------------------------------------------------

/// Incremental SSE line parser.
///
/// Feed it raw text chunks (potentially arriving in arbitrary byte
/// boundaries) and it yields fully-assembled [`SseEvent`] frames.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    read_offset: usize,
    event_type: Option<String>,
    data_buffer: String,
    has_data: bool,
    last_event_id: Option<String>,
}

impl SseParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw text and return any complete events parsed.
    ///
    /// - `event:` sets the event type for the next frame
    /// - `data:` appends to the data buffer (one leading space stripped);
    ///   multiple `data:` lines are joined with `\n`
    /// - an empty line terminates a frame
    /// - `:` lines are comments
    /// - `id:` sets the last event id; `retry:` and unknown fields are ignored
    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        let mut out = Vec::new();
        self.feed_into(chunk, &mut out);
        out
    }

    /// Feed raw text and append complete events into a caller-provided buffer.
    pub fn feed_into(&mut self, chunk: &str, out: &mut Vec<SseEvent>) {
        self.buffer.push_str(chunk);
        let mut processed_up_to = self.read_offset;
        let scan_start = processed_up_to;
        for rel_pos in memchr_iter(b'\n', &self.buffer.as_bytes()[scan_start..]) {
            let line_end = scan_start + rel_pos;
            let mut line = &self.buffer[processed_up_to..line_end];
            if let Some(stripped) = line.strip_suffix('\r') {
                line = stripped;
            }
            Self::process_line(
                line,
                &mut self.event_type,
                &mut self.data_buffer,
                &mut self.has_data,
                &mut self.last_event_id,
                out,
            );
            processed_up_to = line_end + 1;
        }

        self.read_offset = processed_up_to;
        if self.read_offset == self.buffer.len() {
            self.buffer.clear();
            self.read_offset = 0;
            return;
        }
        let should_compact = self.read_offset > 0
            && (self.read_offset >= self.buffer.len() / 2 || self.read_offset >= 8 * 1024);
        if should_compact {
            self.buffer.drain(..self.read_offset);
            self.read_offset = 0;
        }
    }

    /// Dispatch whatever is buffered when the byte stream ends without a
    /// trailing blank line.
    pub fn finish(&mut self, out: &mut Vec<SseEvent>) {
        if self.read_offset < self.buffer.len() {
            let tail = self.buffer[self.read_offset..].to_string();
            let line = tail.strip_suffix('\r').unwrap_or(&tail);
            Self::process_line(
                line,
                &mut self.event_type,
                &mut self.data_buffer,
                &mut self.has_data,
                &mut self.last_event_id,
                out,
            );
        }
        self.buffer.clear();
        self.read_offset = 0;
        Self::process_line(
            "",
            &mut self.event_type,
            &mut self.data_buffer,
            &mut self.has_data,
            &mut self.last_event_id,
            out,
        );
    }

    fn process_line(
        line: &str,
        event_type: &mut Option<String>,
        data_buffer: &mut String,
        has_data: &mut bool,
        last_event_id: &mut Option<String>,
        events: &mut Vec<SseEvent>,
    ) {
        if line.is_empty() {
            if *has_data {
                events.push(SseEvent {
                    event: event_type.take(),
                    data: std::mem::take(data_buffer),
                    id: last_event_id.clone(),
                });
                *has_data = false;
            }
            return;
        }

        if line.starts_with(':') {
            return;
        }

        if let Some(value) = line.strip_prefix("data:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            if *has_data {
                data_buffer.push('\n');
            } else {
                *has_data = true;
            }
            data_buffer.push_str(value);
        } else if let Some(value) = line.strip_prefix("event:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            *event_type = Some(value.to_string());
        } else if let Some(value) = line.strip_prefix("id:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            *last_event_id = Some(value.to_string());
        }
    }
}

// ---------------------------------------------------------------------------
// Utf8Decoder — carries split multi-byte sequences across chunks
// ---------------------------------------------------------------------------

/// Decodes a byte stream as UTF-8, holding back an incomplete trailing
/// sequence until the next chunk completes it.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    remainder: Vec<u8>,
}

impl Utf8Decoder {
    /// Decode `bytes` (prefixed by any held-back remainder) and feed the
    /// valid text to `parser`.
    pub fn decode_into(&mut self, bytes: &[u8], parser: &mut SseParser, out: &mut Vec<SseEvent>) {
        self.remainder.extend_from_slice(bytes);
        let valid_up_to = match std::str::from_utf8(&self.remainder) {
            Ok(text) => {
                parser.feed_into(text, out);
                self.remainder.clear();
                return;
            }
            Err(err) => err.valid_up_to(),
        };
        if let Ok(text) = std::str::from_utf8(&self.remainder[..valid_up_to]) {
            parser.feed_into(text, out);
        }
        self.remainder.drain(..valid_up_to);
        // An invalid sequence (not merely incomplete) can never become valid.
        if self.remainder.len() >= 4 {
            self.remainder.clear();
        }
    }
}

// ---------------------------------------------------------------------------
// Encoding helpers
// ---------------------------------------------------------------------------

/// Format an event-named SSE frame: `event: {name}\ndata: {json}\n\n`.
pub fn push_named_frame(out: &mut String, event_type: &str, json: &str) {
    out.reserve(18 + event_type.len() + json.len());
    out.push_str("event: ");
    out.push_str(event_type);
    out.push('\n');
    out.push_str("data: ");
    out.push_str(json);
    out.push_str("\n\n");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_data_frame() {
        let mut parser = SseParser::new();
        let events = parser.feed("data: hello world\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "hello world");
        assert!(events[0].event.is_none());
    }

    #[test]
    fn test_parse_named_event() {
        let mut parser = SseParser::new();
        let events =
            parser.feed("event: response.created\ndata: {\"type\":\"response.created\"}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("response.created"));
        assert_eq!(events[0].data, "{\"type\":\"response.created\"}");
    }

    #[test]
    fn test_parse_multiline_data() {
        let mut parser = SseParser::new();
        let events = parser.feed("data: line1\ndata: line2\ndata: line3\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "line1\nline2\nline3");
    }

    #[test]
    fn test_parse_ignores_comments() {
        let mut parser = SseParser::new();
        let events = parser.feed(": keep-alive\ndata: hello\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "hello");
    }

    #[test]
    fn test_parse_done_frame() {
        let mut parser = SseParser::new();
        let events = parser.feed("data: [DONE]\n\n");
        assert!(events[0].is_done());
    }

    #[test]
    fn test_parse_incremental_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.feed("data: hel").is_empty());
        assert!(parser.feed("lo\n").is_empty());
        let events = parser.feed("\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "hello");
    }

    #[test]
    fn test_parse_crlf_line_endings() {
        let mut parser = SseParser::new();
        let events = parser.feed("data: hello\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "hello");
    }

    #[test]
    fn test_parse_id_field() {
        let mut parser = SseParser::new();
        let events = parser.feed("id: 42\ndata: hello\n\n");
        assert_eq!(events[0].id.as_deref(), Some("42"));
    }

    #[test]
    fn test_finish_flushes_unterminated_frame() {
        let mut parser = SseParser::new();
        let mut out = Vec::new();
        parser.feed_into("data: {\"a\":1}\n\ndata: tail", &mut out);
        assert_eq!(out.len(), 1);
        parser.finish(&mut out);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].data, "tail");

        let mut out = Vec::new();
        parser.finish(&mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_utf8_decoder_joins_split_sequences() {
        let mut parser = SseParser::new();
        let mut decoder = Utf8Decoder::default();
        let mut out = Vec::new();
        let bytes = "data: caf\u{e9}\n\n".as_bytes();
        let split = bytes.iter().position(|&b| b == 0xc3).unwrap() + 1;
        decoder.decode_into(&bytes[..split], &mut parser, &mut out);
        assert!(out.is_empty());
        decoder.decode_into(&bytes[split..], &mut parser, &mut out);
        assert_eq!(out[0].data, "caf\u{e9}");
    }

    #[test]
    fn test_push_named_frame() {
        let mut out = String::new();
        push_named_frame(&mut out, "message_stop", "{\"type\":\"message_stop\"}");
        assert_eq!(
            out,
            "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n"
        );
    }
}
