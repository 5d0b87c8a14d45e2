//! Incremental Server-Sent Events decoder.
//!
//! Converts the raw byte stream of a streaming completion response into
//! [`SseFrame`]s. Handles field parsing (`data:`, `event:`, `id:`),
//! multi-line data, comment lines, CRLF line endings, frames split across
//! chunk boundaries, and the `[DONE]` sentinel.

/// One decoded SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// The `event:` field, if present.
    pub event: Option<String>,
    /// The `data:` payload; multiple data lines join with `\n`.
    pub data: String,
}

impl SseFrame {
    /// Whether this frame is the `[DONE]` end-of-stream sentinel.
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

/// Incremental SSE decoder. Feed raw chunks, collect complete frames.
#[derive(Debug, Default)]
pub struct SseDecoder {
    line: Vec<u8>,
    event: Option<String>,
    data_lines: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a chunk of response bytes, returning frames completed by it.
    ///
    /// Multi-byte UTF-8 sequences may straddle chunk boundaries; bytes
    /// accumulate per line and are decoded lossily only at line ends.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        for &byte in chunk {
            if byte == b'\n' {
                let raw = std::mem::take(&mut self.line);
                let line = String::from_utf8_lossy(&raw);
                if let Some(frame) = self.take_line(line.strip_suffix('\r').unwrap_or(&line)) {
                    frames.push(frame);
                }
            } else {
                self.line.push(byte);
            }
        }
        frames
    }

    /// Flush any buffered frame at end of stream.
    pub fn finish(&mut self) -> Option<SseFrame> {
        if !self.line.is_empty() {
            let raw = std::mem::take(&mut self.line);
            let line = String::from_utf8_lossy(&raw);
            if let Some(frame) = self.take_line(line.strip_suffix('\r').unwrap_or(&line)) {
                return Some(frame);
            }
        }
        if self.data_lines.is_empty() {
            return None;
        }
        Some(self.build())
    }

    /// Process one complete line; a blank line closes the pending frame.
    fn take_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            if self.data_lines.is_empty() {
                return None;
            }
            return Some(self.build());
        }
        if line.starts_with(':') {
            return None; // comment
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => return None,
        };
        match field {
            "data" => self.data_lines.push(value.to_owned()),
            "event" => self.event = Some(value.to_owned()),
            // `id`, `retry`, and unknown fields are ignored.
            _ => {}
        }
        None
    }

    fn build(&mut self) -> SseFrame {
        SseFrame {
            event: self.event.take(),
            data: std::mem::take(&mut self.data_lines).join("\n"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &str) -> Vec<SseFrame> {
        let mut decoder = SseDecoder::new();
        let mut frames = decoder.feed(input.as_bytes());
        if let Some(trailing) = decoder.finish() {
            frames.push(trailing);
        }
        frames
    }

    #[test]
    fn single_frame() {
        let frames = decode_all("data: hello\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "hello");
        assert!(frames[0].event.is_none());
    }

    #[test]
    fn multiple_frames() {
        let frames = decode_all("data: first\n\ndata: second\n\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data, "first");
        assert_eq!(frames[1].data, "second");
    }

    #[test]
    fn event_field_is_captured() {
        let frames = decode_all("event: delta\ndata: body\n\n");
        assert_eq!(frames[0].event.as_deref(), Some("delta"));
        assert_eq!(frames[0].data, "body");
    }

    #[test]
    fn multi_line_data_joins_with_newline() {
        let frames = decode_all("data: one\ndata: two\n\n");
        assert_eq!(frames[0].data, "one\ntwo");
    }

    #[test]
    fn no_space_after_colon() {
        let frames = decode_all("data:tight\n\n");
        assert_eq!(frames[0].data, "tight");
    }

    #[test]
    fn colons_inside_value_preserved() {
        let frames = decode_all("data: {\"key\":\"value\"}\n\n");
        assert_eq!(frames[0].data, "{\"key\":\"value\"}");
    }

    #[test]
    fn comments_and_unknown_fields_ignored() {
        let frames = decode_all(": keep-alive\nretry: 5000\ndata: body\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "body");
    }

    #[test]
    fn crlf_line_endings() {
        let frames = decode_all("data: hello\r\n\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "hello");
    }

    #[test]
    fn frame_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: hel").is_empty());
        let frames = decoder.feed(b"lo\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "hello");
    }

    #[test]
    fn boundary_split_between_frames() {
        let mut decoder = SseDecoder::new();
        let first = decoder.feed(b"data: a\n\ndata: b");
        assert_eq!(first.len(), 1);
        let second = decoder.feed(b"\n\n");
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].data, "b");
    }

    #[test]
    fn done_sentinel() {
        let frames = decode_all("data: {\"x\":1}\n\ndata: [DONE]\n\n");
        assert!(!frames[0].is_done());
        assert!(frames[1].is_done());
    }

    #[test]
    fn finish_flushes_trailing_frame() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: trailing").is_empty());
        let trailing = decoder.finish().expect("trailing frame");
        assert_eq!(trailing.data, "trailing");
    }

    #[test]
    fn finish_on_empty_decoder_is_none() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn blank_lines_without_data_emit_nothing() {
        assert!(decode_all("\n\n\n").is_empty());
    }

    #[test]
    fn multibyte_utf8_split_across_chunks() {
        let bytes = "data: héllo\n\n".as_bytes();
        // Split in the middle of the two-byte 'é' sequence.
        let split = bytes.iter().position(|&b| b == 0xc3).expect("é lead byte") + 1;
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(&bytes[..split]).is_empty());
        let frames = decoder.feed(&bytes[split..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "héllo");
    }
}
