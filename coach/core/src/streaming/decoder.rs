//! Event Decoder
//!
//! Incremental parser for the reply stream. Bytes are pushed in whatever
//! chunks the transport delivers; complete events are pulled out one at a
//! time.
//!
//! # Wire Format
//!
//! ```text
//! : comment line, ignored
//! data: {"token":"Hello"}
//!
//! data: plain text is passed through verbatim
//!
//! data: __META__:{"style_used":"supportive","emotion_detected":"motivated"}
//!
//! data: [DONE]
//!
//! ```
//!
//! Events end at a blank line. `\r\n` is treated as `\n`. Several `data:`
//! lines in one event are joined with `\n`.

use tracing::debug;

use crate::diagnostics::Diagnostics;
use crate::error::StreamError;

/// Prefix marking an out-of-band metadata payload
pub const META_PREFIX: &str = "__META__:";

/// Payload that ends the stream
pub const DONE_SENTINEL: &str = "[DONE]";

/// Largest event the decoder buffers while waiting for its delimiter (1 MiB)
pub const MAX_EVENT_SIZE: usize = 1024 * 1024;

/// Initial buffer capacity
const MIN_BUFFER_CAPACITY: usize = 4096;

/// One decoded item of the reply stream
#[derive(Clone, Debug, PartialEq)]
pub enum Token {
    /// Text to append to the reply
    Content(String),
    /// Replacement diagnostics for the reply
    Meta(Diagnostics),
}

/// Incremental SSE decoder
#[derive(Debug)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    /// Start of the current (undelimited) event
    read_pos: usize,
    /// Where the delimiter search resumes
    scan_pos: usize,
    default_style: String,
    max_event_size: usize,
    done: bool,
    malformed_meta: usize,
}

impl SseDecoder {
    /// Create a decoder; `default_style` fills metadata without a style
    pub fn new(default_style: impl Into<String>) -> Self {
        Self {
            buffer: Vec::with_capacity(MIN_BUFFER_CAPACITY),
            read_pos: 0,
            scan_pos: 0,
            default_style: default_style.into(),
            max_event_size: MAX_EVENT_SIZE,
            done: false,
            malformed_meta: 0,
        }
    }

    /// Override the per-event size limit
    #[must_use]
    pub fn with_max_event_size(mut self, limit: usize) -> Self {
        self.max_event_size = limit;
        self
    }

    /// Append bytes from the transport
    ///
    /// Carriage returns are dropped so `\r\n` framing splits like `\n`, even
    /// when the pair straddles two chunks. Bytes after `[DONE]` are ignored.
    pub fn push(&mut self, data: &[u8]) {
        if self.done {
            return;
        }
        if self.read_pos > self.buffer.len() / 2 && self.read_pos > MIN_BUFFER_CAPACITY {
            self.buffer.drain(..self.read_pos);
            self.scan_pos -= self.read_pos;
            self.read_pos = 0;
        }
        self.buffer
            .extend(data.iter().copied().filter(|&b| b != b'\r'));
    }

    /// Bytes buffered but not yet decoded
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    /// Whether `[DONE]` was seen
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Metadata events dropped because their JSON did not parse
    #[must_use]
    pub fn malformed_meta(&self) -> usize {
        self.malformed_meta
    }

    /// Try to decode the next token
    ///
    /// Returns:
    /// - `Ok(Some(token))` for a content or metadata event
    /// - `Ok(None)` if more data is needed, or after `[DONE]`
    /// - `Err(StreamError::EventTooLarge)` if an event outgrew the limit
    pub fn next_token(&mut self) -> Result<Option<Token>, StreamError> {
        while !self.done {
            let Some(end) = self.find_delimiter() else {
                if self.pending() > self.max_event_size {
                    return Err(StreamError::EventTooLarge {
                        limit: self.max_event_size,
                    });
                }
                return Ok(None);
            };

            // Whole event is buffered, so multi-byte characters are complete.
            let event = String::from_utf8_lossy(&self.buffer[self.read_pos..end]).into_owned();
            self.read_pos = end + 2;
            self.scan_pos = self.read_pos;

            if let Some(payload) = event_payload(&event) {
                if let Some(token) = self.classify(payload) {
                    return Ok(Some(token));
                }
            }
        }
        Ok(None)
    }

    /// Check the buffer once the transport has closed
    ///
    /// # Errors
    ///
    /// `StreamError::Truncated` when the stream ended without `[DONE]` while a
    /// non-blank partial event was buffered. The partial event is discarded.
    pub fn finish(&mut self) -> Result<(), StreamError> {
        if self.done {
            return Ok(());
        }
        let rest = &self.buffer[self.read_pos..];
        let pending_bytes = rest.len();
        let blank = rest.iter().all(u8::is_ascii_whitespace);
        self.read_pos = self.buffer.len();
        self.scan_pos = self.read_pos;
        self.done = true;
        if blank {
            Ok(())
        } else {
            Err(StreamError::Truncated { pending_bytes })
        }
    }

    fn find_delimiter(&mut self) -> Option<usize> {
        let start = self.scan_pos.max(self.read_pos);
        match self.buffer[start..].windows(2).position(|w| w == b"\n\n") {
            Some(offset) => Some(start + offset),
            None => {
                // Resume one byte back so a delimiter split across pushes is found.
                self.scan_pos = self.buffer.len().saturating_sub(1).max(self.read_pos);
                None
            }
        }
    }

    fn classify(&mut self, payload: String) -> Option<Token> {
        // The sentinel may arrive raw or as the `token` field.
        let text = content_of(payload);
        if text.trim() == DONE_SENTINEL {
            self.done = true;
            self.buffer.clear();
            self.read_pos = 0;
            self.scan_pos = 0;
            return None;
        }

        if let Some(meta) = text.trim_start().strip_prefix(META_PREFIX) {
            return match Diagnostics::from_meta(meta, &self.default_style) {
                Ok(diagnostics) => Some(Token::Meta(diagnostics)),
                Err(err) => {
                    self.malformed_meta += 1;
                    debug!(error = %err, count = self.malformed_meta, "Dropping malformed metadata event");
                    None
                }
            };
        }

        if text.is_empty() {
            None
        } else {
            Some(Token::Content(text))
        }
    }
}

/// Joined `data:` payload of one event, or `None` for comment-only events
fn event_payload(event: &str) -> Option<String> {
    let mut data: Option<String> = None;
    for line in event.split('\n') {
        if line.starts_with(':') {
            continue;
        }
        let Some(value) = line.strip_prefix("data:") else {
            continue;
        };
        let value = value.strip_prefix(' ').unwrap_or(value);
        match data.as_mut() {
            Some(existing) => {
                existing.push('\n');
                existing.push_str(value);
            }
            None => data = Some(value.to_string()),
        }
    }
    data
}

/// Token text carried by a payload: the JSON `token` field, or the raw payload
fn content_of(payload: String) -> String {
    if payload.trim_start().starts_with('{') {
        if let Ok(serde_json::Value::Object(map)) = serde_json::from_str(&payload) {
            if let Some(serde_json::Value::String(token)) = map.get("token") {
                return token.clone();
            }
        }
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn decode_all(decoder: &mut SseDecoder) -> Vec<Token> {
        let mut tokens = Vec::new();
        while let Some(token) = decoder.next_token().unwrap() {
            tokens.push(token);
        }
        tokens
    }

    fn content(text: &str) -> Token {
        Token::Content(text.to_string())
    }

    #[test]
    fn test_single_json_token() {
        let mut decoder = SseDecoder::new("supportive");
        decoder.push(b"data: {\"token\":\"Hi\"}\n\ndata: [DONE]\n\n");

        assert_eq!(decode_all(&mut decoder), vec![content("Hi")]);
        assert!(decoder.is_done());
        assert!(decoder.finish().is_ok());
    }

    #[test]
    fn test_raw_payload_and_no_space() {
        let mut decoder = SseDecoder::new("s");
        decoder.push(b"data:plain text\n\ndata: {\"other\":1}\n\n");

        assert_eq!(
            decode_all(&mut decoder),
            vec![content("plain text"), content("{\"other\":1}")]
        );
    }

    #[test]
    fn test_comments_ignored() {
        let mut decoder = SseDecoder::new("s");
        decoder.push(b": keep-alive\n\n: another\ndata: {\"token\":\"x\"}\n\n");
        assert_eq!(decode_all(&mut decoder), vec![content("x")]);
    }

    #[test]
    fn test_meta_event() {
        let mut decoder = SseDecoder::new("supportive");
        decoder.push(b"data: __META__:{\"emotion_detected\":\"motivated\"}\n\ndata: {\"token\":\"Go\"}\n\n");

        let tokens = decode_all(&mut decoder);
        assert_eq!(tokens.len(), 2);
        match &tokens[0] {
            Token::Meta(d) => {
                assert_eq!(d.emotion_detected, "motivated");
                assert_eq!(d.style_used, "supportive");
                assert_eq!(d.goal_link, "professional_growth");
            }
            other => panic!("expected meta, got {other:?}"),
        }
        assert_eq!(tokens[1], content("Go"));
    }

    #[test]
    fn test_meta_inside_token_field() {
        let mut decoder = SseDecoder::new("s");
        decoder.push(b"data: {\"token\":\"__META__:{}\"}\n\n");
        assert!(matches!(decode_all(&mut decoder).as_slice(), [Token::Meta(_)]));
    }

    #[test]
    fn test_malformed_meta_swallowed() {
        let mut decoder = SseDecoder::new("s");
        decoder.push(b"data: __META__:{broken\n\ndata: {\"token\":\"ok\"}\n\n");

        assert_eq!(decode_all(&mut decoder), vec![content("ok")]);
        assert_eq!(decoder.malformed_meta(), 1);
    }

    #[test]
    fn test_done_discards_trailing_data() {
        let mut decoder = SseDecoder::new("s");
        decoder.push(b"data: a\n\ndata: [DONE]\n\ndata: b\n\ndata: partial");

        assert_eq!(decode_all(&mut decoder), vec![content("a")]);
        decoder.push(b"data: c\n\n");
        assert_eq!(decoder.next_token().unwrap(), None);
        assert_eq!(decoder.pending(), 0);
        assert!(decoder.finish().is_ok());
    }

    #[test]
    fn test_done_inside_token_field() {
        let mut decoder = SseDecoder::new("s");
        decoder.push(b"data: {\"token\":\"Hi\"}\n\ndata: {\"token\":\"[DONE]\"}\n\ndata: {\"token\":\"after\"}\n\n");

        assert_eq!(decode_all(&mut decoder), vec![content("Hi")]);
        assert!(decoder.is_done());
        assert_eq!(decoder.pending(), 0);
        assert!(decoder.finish().is_ok());
    }

    #[test]
    fn test_one_byte_chunks_with_multibyte_utf8() {
        let wire = "data: {\"token\":\"caf\u{e9} \u{1f680}\"}\n\ndata: 想一想\n\ndata: [DONE]\n\n";
        let mut decoder = SseDecoder::new("s");
        let mut tokens = Vec::new();
        for byte in wire.as_bytes() {
            decoder.push(std::slice::from_ref(byte));
            while let Some(token) = decoder.next_token().unwrap() {
                tokens.push(token);
            }
        }
        assert_eq!(
            tokens,
            vec![content("caf\u{e9} \u{1f680}"), content("想一想")]
        );
        assert!(decoder.is_done());
    }

    #[test]
    fn test_crlf_framing_split_across_chunks() {
        let mut decoder = SseDecoder::new("s");
        decoder.push(b"data: one\r");
        decoder.push(b"\n\r");
        decoder.push(b"\ndata: two\r\n\r\n");
        assert_eq!(decode_all(&mut decoder), vec![content("one"), content("two")]);
    }

    #[test]
    fn test_multiline_data_joined() {
        let mut decoder = SseDecoder::new("s");
        decoder.push(b"data: line one\ndata: line two\n\n");
        assert_eq!(decode_all(&mut decoder), vec![content("line one\nline two")]);
    }

    #[test]
    fn test_truncated_partial_event() {
        let mut decoder = SseDecoder::new("s");
        decoder.push(b"data: {\"token\":\"Hi\"}\n\ndata: {\"tok");

        assert_eq!(decode_all(&mut decoder), vec![content("Hi")]);
        match decoder.finish() {
            Err(StreamError::Truncated { pending_bytes }) => assert_eq!(pending_bytes, 11),
            other => panic!("expected truncation, got {other:?}"),
        }
    }

    #[test]
    fn test_clean_end_without_done() {
        let mut decoder = SseDecoder::new("s");
        decoder.push(b"data: last\n\n\n");
        assert_eq!(decode_all(&mut decoder), vec![content("last")]);
        assert!(decoder.finish().is_ok());
    }

    #[test]
    fn test_event_too_large() {
        let mut decoder = SseDecoder::new("s").with_max_event_size(16);
        decoder.push(b"data: this event never ends");
        assert!(matches!(
            decoder.next_token(),
            Err(StreamError::EventTooLarge { limit: 16 })
        ));
    }

    #[test]
    fn test_buffer_compaction_keeps_positions() {
        let mut decoder = SseDecoder::new("s");
        let filler = format!("data: {}\n\n", "x".repeat(MIN_BUFFER_CAPACITY));
        decoder.push(filler.as_bytes());
        decoder.push(b"data: tail-");
        assert_eq!(decode_all(&mut decoder).len(), 1);

        // Next push compacts the consumed filler.
        decoder.push(b"end\n\n");
        assert_eq!(decode_all(&mut decoder), vec![content("tail-end")]);
    }
}
