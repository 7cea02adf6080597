//! Incremental Server-Sent Events decoder
//!
//! Bytes arrive in arbitrary chunks. Incomplete lines, including a multi-byte
//! UTF-8 sequence split across chunks, stay buffered until their newline
//! arrives. A bare JSON object line outside of an SSE frame is dispatched as a
//! message on its own, so newline-delimited JSON streams decode as well.
//!
//! A line or frame larger than [`MAX_MESSAGE_BYTES`] is discarded and counted
//! instead of being buffered.

use std::time::Duration;

/// Upper bound for one buffered line and for one frame's joined data
pub const MAX_MESSAGE_BYTES: usize = 1 << 20;

/// One dispatched message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// SSE `event:` field, if any
    pub event: Option<String>,
    pub data: String,
    /// Last event id seen when this message was dispatched
    pub id: Option<String>,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    /// Bytes after the last complete line
    pending: Vec<u8>,
    /// Skipping the rest of an oversized line
    discarding: bool,
    data: Vec<String>,
    data_len: usize,
    /// Ignoring the rest of an oversized frame
    frame_overflowed: bool,
    event: Option<String>,
    last_event_id: Option<String>,
    retry: Option<Duration>,
    oversized: u64,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every message it completes
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Message> {
        let mut messages = Vec::new();
        let mut chunk = chunk;
        if self.discarding {
            match chunk.iter().position(|&b| b == b'\n') {
                Some(offset) => {
                    self.discarding = false;
                    chunk = &chunk[offset + 1..];
                }
                None => return messages,
            }
        }

        // Older pending bytes hold no newline, only the new ones are searched
        let mut search = self.pending.len();
        self.pending.extend_from_slice(chunk);
        let mut consumed = 0;
        while let Some(offset) = self.pending[search..].iter().position(|&b| b == b'\n') {
            let end = search + offset;
            let mut line = &self.pending[consumed..end];
            if let Some(stripped) = line.strip_suffix(b"\r") {
                line = stripped;
            }
            if line.len() > MAX_MESSAGE_BYTES {
                self.overflow();
            } else {
                let line = String::from_utf8_lossy(line).into_owned();
                self.process_line(&line, &mut messages);
            }
            consumed = end + 1;
            search = consumed;
        }
        self.pending.drain(..consumed);

        if self.pending.len() > MAX_MESSAGE_BYTES {
            self.pending.clear();
            self.discarding = true;
            self.overflow();
        }
        messages
    }

    /// Count an oversized payload and drop the frame it belongs to
    fn overflow(&mut self) {
        self.oversized += 1;
        self.data.clear();
        self.data_len = 0;
        self.frame_overflowed = true;
    }

    fn process_line(&mut self, line: &str, messages: &mut Vec<Message>) {
        if line.is_empty() {
            self.dispatch(messages);
            return;
        }
        if line.starts_with(':') {
            // Comment, typically a keep-alive
            return;
        }
        if self.data.is_empty()
            && self.event.is_none()
            && !self.frame_overflowed
            && line.trim_start().starts_with('{')
        {
            messages.push(Message {
                event: None,
                data: line.to_string(),
                id: self.last_event_id.clone(),
            });
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" if self.frame_overflowed => {}
            "data" => {
                self.data_len += value.len() + 1;
                if self.data_len > MAX_MESSAGE_BYTES {
                    self.overflow();
                } else {
                    self.data.push(value.to_string());
                }
            }
            "event" => self.event = Some(value.to_string()),
            "id" if !value.contains('\0') => self.last_event_id = Some(value.to_string()),
            "retry" => {
                if let Ok(ms) = value.trim().parse::<u64>() {
                    self.retry = Some(Duration::from_millis(ms));
                }
            }
            _ => {}
        }
    }

    fn dispatch(&mut self, messages: &mut Vec<Message>) {
        let event = self.event.take();
        self.data_len = 0;
        self.frame_overflowed = false;
        if self.data.is_empty() {
            return;
        }
        messages.push(Message {
            event,
            data: self.data.join("\n"),
            id: self.last_event_id.clone(),
        });
        self.data.clear();
    }

    /// Id of the last event, sent back as `Last-Event-ID` on reconnect
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Reconnect delay requested by the server since the last call
    pub fn take_retry(&mut self) -> Option<Duration> {
        self.retry.take()
    }

    /// Oversized lines or frames discarded since the last call
    pub fn take_oversized(&mut self) -> u64 {
        std::mem::take(&mut self.oversized)
    }

    /// Drop partial state from a lost connection, keeping the last event id
    pub fn reset(&mut self) {
        self.pending.clear();
        self.discarding = false;
        self.data.clear();
        self.data_len = 0;
        self.frame_overflowed = false;
        self.event = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|m| m.data.as_str()).collect()
    }

    #[test]
    fn test_single_event() {
        let mut decoder = SseDecoder::new();
        let messages = decoder.feed(b"data: {\"a\":1}\n\n");
        assert_eq!(data(&messages), vec!["{\"a\":1}"]);
    }

    #[test]
    fn test_event_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"da").is_empty());
        assert!(decoder.feed(b"ta: {\"type\":").is_empty());
        assert!(decoder.feed(b"\"removed\"}\r\n").is_empty());
        let messages = decoder.feed(b"\r\n");
        assert_eq!(data(&messages), vec!["{\"type\":\"removed\"}"]);
    }

    #[test]
    fn test_utf8_split_across_chunks() {
        let payload = "data: {\"brand\":\"Café\"}\n\n".as_bytes();
        // Split inside the two-byte 'é'
        let split = payload.iter().position(|&b| b == 0xC3).unwrap() + 1;
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(&payload[..split]).is_empty());
        let messages = decoder.feed(&payload[split..]);
        assert_eq!(data(&messages), vec!["{\"brand\":\"Café\"}"]);
    }

    #[test]
    fn test_multiline_data_and_comments() {
        let mut decoder = SseDecoder::new();
        let messages = decoder.feed(b": keep-alive\ndata: line one\ndata:line two\n\n:\n\n");
        assert_eq!(data(&messages), vec!["line one\nline two"]);
    }

    #[test]
    fn test_event_id_and_retry() {
        let mut decoder = SseDecoder::new();
        let messages = decoder.feed(b"id: 17\nevent: update\nretry: 2500\ndata: x\n\n");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id.as_deref(), Some("17"));
        assert_eq!(messages[0].event.as_deref(), Some("update"));
        assert_eq!(decoder.last_event_id(), Some("17"));
        assert_eq!(decoder.take_retry(), Some(Duration::from_millis(2500)));
        assert_eq!(decoder.take_retry(), None);

        // Event type does not leak into the next message
        let messages = decoder.feed(b"data: y\n\n");
        assert_eq!(messages[0].event, None);
        assert_eq!(messages[0].id.as_deref(), Some("17"));
    }

    #[test]
    fn test_bare_json_lines() {
        let mut decoder = SseDecoder::new();
        let messages = decoder.feed(b"{\"a\":1}\n{\"b\":2}\n{\"c\"");
        assert_eq!(data(&messages), vec!["{\"a\":1}", "{\"b\":2}"]);
        let messages = decoder.feed(b":3}\n");
        assert_eq!(data(&messages), vec!["{\"c\":3}"]);
    }

    #[test]
    fn test_empty_frame_is_not_dispatched() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"event: ping\n\n\n\n").is_empty());
    }

    #[test]
    fn test_reset_keeps_last_event_id() {
        let mut decoder = SseDecoder::new();
        decoder.feed(b"id: 5\ndata: x\n\ndata: partial");
        decoder.reset();
        assert_eq!(decoder.last_event_id(), Some("5"));
        // The partial frame from the lost connection is gone
        let messages = decoder.feed(b"\n\n");
        assert!(messages.is_empty());
    }

    #[test]
    fn test_unterminated_line_is_discarded_at_limit() {
        let mut decoder = SseDecoder::new();
        let filler = vec![b'x'; 64 * 1024];
        assert!(decoder.feed(b"data: {\"huge\":\"").is_empty());
        for _ in 0..(MAX_MESSAGE_BYTES / filler.len() + 1) {
            assert!(decoder.feed(&filler).is_empty());
        }
        assert_eq!(decoder.take_oversized(), 1);
        assert!(decoder.pending.is_empty());

        // Still skipping until the newline, then decoding resumes
        assert!(decoder.feed(&filler).is_empty());
        assert!(decoder.pending.is_empty());
        let messages = decoder.feed(b"\"}\n\ndata: ok\n\n");
        assert_eq!(data(&messages), vec!["ok"]);
        assert_eq!(decoder.take_oversized(), 0);
    }

    #[test]
    fn test_oversized_line_in_one_chunk() {
        let mut decoder = SseDecoder::new();
        let mut chunk = b"data: first\ndata: ".to_vec();
        chunk.extend(std::iter::repeat_n(b'x', MAX_MESSAGE_BYTES + 1));
        chunk.extend_from_slice(b"\ndata: last\n\n{\"a\":1}\n");

        let messages = decoder.feed(&chunk);
        // The whole frame is dropped, the following line decodes
        assert_eq!(data(&messages), vec!["{\"a\":1}"]);
        assert_eq!(decoder.take_oversized(), 1);
    }

    #[test]
    fn test_oversized_frame_from_many_lines() {
        let mut decoder = SseDecoder::new();
        let line = format!("data: {}\n", "y".repeat(1023));
        for _ in 0..(MAX_MESSAGE_BYTES / 1024 + 1) {
            assert!(decoder.feed(line.as_bytes()).is_empty());
        }
        let messages = decoder.feed(b"\ndata: next\n\n");
        assert_eq!(data(&messages), vec!["next"]);
        assert_eq!(decoder.take_oversized(), 1);
    }
}
