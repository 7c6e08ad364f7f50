//! Line-oriented SSE framer.
//!
//! Every `data:` line is its own record. Handles:
//! - Records split across TCP chunks
//! - CRLF and LF line endings
//! - Non-`data` lines and blank lines (skipped)
//! - Buffer compaction to prevent unbounded growth

use bytes::{Buf, BytesMut};
use memchr::memchr;

/// Payload that marks the normal end of a stream.
pub const DONE_SENTINEL: &str = "[DONE]";

const DATA_FIELD: &[u8] = b"data:";

/// Buffered splitter yielding the payload of each complete `data:` line.
pub struct SseParser {
    buffer: BytesMut,
    /// Offset of unconsumed data in buffer.
    consumed: usize,
}

impl SseParser {
    /// Create a new parser with default buffer capacity.
    pub fn new() -> Self {
        Self::with_capacity(8192)
    }

    /// Create a new parser with specified initial capacity.
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(cap),
            consumed: 0,
        }
    }

    /// Feed bytes into the parser.
    #[inline]
    pub fn feed(&mut self, data: &[u8]) {
        // Compact buffer if we've consumed more than half
        if self.consumed > self.buffer.len() / 2 && self.consumed > 4096 {
            self.compact();
        }
        self.buffer.extend_from_slice(data);
    }

    fn compact(&mut self) {
        if self.consumed > 0 {
            self.buffer.advance(self.consumed);
            self.consumed = 0;
        }
    }

    /// Payload of the next complete `data:` line.
    /// Returns `None` if more data is needed.
    pub fn next_data(&mut self) -> Option<&str> {
        let (from, to) = loop {
            let start = self.consumed;
            let line_end = start + memchr(b'\n', &self.buffer[start..])?;
            self.consumed = line_end + 1;

            if let Some((from, to)) = data_range(&self.buffer[start..line_end]) {
                let range = (start + from, start + to);
                // Non UTF-8 records are dropped like any other malformed frame
                if std::str::from_utf8(&self.buffer[range.0..range.1]).is_ok() {
                    break range;
                }
            }
        };
        std::str::from_utf8(&self.buffer[from..to]).ok()
    }

    /// Payload of a trailing line that never received its newline.
    ///
    /// Called once the transport has closed; drains the buffer.
    pub fn finish(&mut self) -> Option<String> {
        let rest = &self.buffer[self.consumed..];
        let data = data_range(rest)
            .and_then(|(from, to)| std::str::from_utf8(&rest[from..to]).ok())
            .map(str::to_owned);
        self.reset();
        data
    }

    /// Check if the data indicates end of stream (`[DONE]`).
    #[inline]
    pub fn is_done(data: &str) -> bool {
        data == DONE_SENTINEL
    }

    /// Reset parser state.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.consumed = 0;
    }

    /// Current buffer size.
    pub fn buffer_len(&self) -> usize {
        self.buffer.len() - self.consumed
    }
}

impl Default for SseParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Byte range of the payload within a `data:` line, CR and one leading space stripped.
fn data_range(line: &[u8]) -> Option<(usize, usize)> {
    let end = if line.ends_with(b"\r") {
        line.len() - 1
    } else {
        line.len()
    };
    if !line[..end].starts_with(DATA_FIELD) {
        return None;
    }
    let mut from = DATA_FIELD.len();
    if line.get(from) == Some(&b' ') && from < end {
        from += 1;
    }
    Some((from, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_record() {
        let mut parser = SseParser::new();
        parser.feed(b"data: hello world\n");
        assert_eq!(parser.next_data(), Some("hello world"));
        assert_eq!(parser.next_data(), None);
    }

    #[test]
    fn test_no_space_after_colon() {
        let mut parser = SseParser::new();
        parser.feed(b"data:payload\n");
        assert_eq!(parser.next_data(), Some("payload"));
    }

    #[test]
    fn test_skips_blank_and_foreign_lines() {
        let mut parser = SseParser::new();
        parser.feed(b"\n: keep-alive\nevent: message\nid: 7\n\ndata: payload\n\n");
        assert_eq!(parser.next_data(), Some("payload"));
        assert_eq!(parser.next_data(), None);
        assert_eq!(parser.buffer_len(), 0);
    }

    #[test]
    fn test_crlf() {
        let mut parser = SseParser::new();
        parser.feed(b"data: hello\r\n\r\n");
        assert_eq!(parser.next_data(), Some("hello"));
    }

    #[test]
    fn test_partial_record() {
        let mut parser = SseParser::new();
        parser.feed(b"data: hel");
        assert!(parser.next_data().is_none());

        parser.feed(b"lo\n");
        assert_eq!(parser.next_data(), Some("hello"));
    }

    #[test]
    fn test_coalesced_records() {
        let mut parser = SseParser::new();
        // Multiple records in one TCP frame
        parser.feed(b"data: a\ndata: b\n\ndata: c\n");

        assert_eq!(parser.next_data(), Some("a"));
        assert_eq!(parser.next_data(), Some("b"));
        assert_eq!(parser.next_data(), Some("c"));
        assert!(parser.next_data().is_none());
    }

    #[test]
    fn test_finish_flushes_unterminated_line() {
        let mut parser = SseParser::new();
        parser.feed(b"data: first\ndata: [DONE]");
        assert_eq!(parser.next_data(), Some("first"));
        assert!(parser.next_data().is_none());
        assert_eq!(parser.finish().as_deref(), Some("[DONE]"));
        assert_eq!(parser.buffer_len(), 0);
        assert!(parser.finish().is_none());
    }

    #[test]
    fn test_empty_payload() {
        let mut parser = SseParser::new();
        parser.feed(b"data:\ndata: \n");
        assert_eq!(parser.next_data(), Some(""));
        assert_eq!(parser.next_data(), Some(""));
    }

    #[test]
    fn test_compaction_keeps_pending_bytes() {
        let mut parser = SseParser::with_capacity(16);
        let record = format!("data: {}\n", "x".repeat(5000));
        parser.feed(record.as_bytes());
        assert_eq!(parser.next_data().map(str::len), Some(5000));

        parser.feed(b"data: tail");
        parser.feed(b"\n");
        assert_eq!(parser.next_data(), Some("tail"));
    }

    #[test]
    fn test_done_marker() {
        assert!(SseParser::is_done("[DONE]"));
        assert!(!SseParser::is_done("data"));
    }
}
