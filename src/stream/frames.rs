use std::collections::VecDeque;

use anyhow::Result;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tracing::{debug, warn};

const FRAME_DELIMITER: &[u8] = b"\n\n";
const DATA_PREFIX: &str = "data: ";

/// Incremental `text/event-stream` parser.
///
/// Raw bytes are buffered until a blank-line delimiter completes a frame, so
/// a frame (or a multi-byte character) split across chunks parses the same as
/// one delivered whole.
#[derive(Debug, Default)]
pub struct FrameParser {
    buffer: Vec<u8>,
    /// Offset in `buffer` before which no delimiter can start.
    scanned: usize,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns the events of every frame it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        let mut consumed = 0;
        let mut from = self.scanned;
        while let Some(pos) = find_delimiter(&self.buffer[from..]) {
            let end = from + pos;
            parse_frame(&self.buffer[consumed..end], &mut events);
            consumed = end + FRAME_DELIMITER.len();
            from = consumed;
        }
        self.buffer.drain(..consumed);
        // A delimiter may still complete across the tail of what is left.
        self.scanned = self.buffer.len().saturating_sub(FRAME_DELIMITER.len() - 1);
        events
    }

    /// Flush whatever is left once the stream has ended. A last frame that
    /// was never followed by a delimiter still counts.
    pub fn finish(&mut self) -> Vec<Value> {
        let rest = std::mem::take(&mut self.buffer);
        self.scanned = 0;
        let mut events = Vec::new();
        parse_frame(&rest, &mut events);
        events
    }

    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }
}

fn find_delimiter(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(FRAME_DELIMITER.len())
        .position(|w| w == FRAME_DELIMITER)
}

/// Only `data: ` lines matter; a line that is not valid JSON is dropped
/// without affecting the rest of the stream.
fn parse_frame(frame: &[u8], events: &mut Vec<Value>) {
    if frame.is_empty() {
        return;
    }
    let text = String::from_utf8_lossy(frame);
    for line in text.lines() {
        let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
            continue;
        };
        let payload = payload.trim();
        if payload.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(payload) {
            Ok(value) => events.push(value),
            Err(e) => warn!(error = %e, payload, "skipping malformed event frame"),
        }
    }
}

struct EventStreamState {
    inner: BoxStream<'static, Result<Bytes>>,
    parser: FrameParser,
    pending: VecDeque<Value>,
    finished: bool,
}

/// Turn a response body into a lazy stream of JSON events.
///
/// Transport errors are passed through and end the stream.
pub fn event_stream(
    bytes: BoxStream<'static, Result<Bytes>>,
) -> impl Stream<Item = Result<Value>> + Send + 'static {
    let state = EventStreamState {
        inner: bytes,
        parser: FrameParser::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((Ok(event), state));
            }
            if state.finished {
                return None;
            }
            match state.inner.next().await {
                Some(Ok(chunk)) => {
                    let events = state.parser.push(&chunk);
                    state.pending.extend(events);
                }
                Some(Err(e)) => {
                    state.finished = true;
                    state.pending.clear();
                    return Some((Err(e), state));
                }
                None => {
                    state.finished = true;
                    let pending = state.parser.pending_bytes();
                    if pending > 0 {
                        debug!(pending, "stream ended without a closing delimiter");
                    }
                    let events = state.parser.finish();
                    state.pending.extend(events);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const BODY: &str = "data: {\"type\":\"text\",\"content\":\"Hé\"}\n\n\
                        event: message\ndata: {\"type\":\"tool_call\",\"tool\":\"search_pages\",\"input\":{}}\n\n\
                        data: {\"type\":\"done\"}";

    fn parse_in_chunks(body: &[u8], size: usize) -> Vec<Value> {
        let mut parser = FrameParser::new();
        let mut events = Vec::new();
        for chunk in body.chunks(size) {
            events.extend(parser.push(chunk));
        }
        events.extend(parser.finish());
        events
    }

    #[test]
    fn test_chunk_boundaries_do_not_matter() {
        let whole = parse_in_chunks(BODY.as_bytes(), BODY.len());
        assert_eq!(whole.len(), 3);
        assert_eq!(whole[0], json!({"type": "text", "content": "Hé"}));
        for size in 1..BODY.len() {
            assert_eq!(parse_in_chunks(BODY.as_bytes(), size), whole, "chunk size {}", size);
        }
    }

    #[test]
    fn test_partial_frame_is_retained() {
        let mut parser = FrameParser::new();
        assert!(parser.push(b"data: {\"type\":").is_empty());
        assert!(parser.pending_bytes() > 0);
        let events = parser.push(b"\"done\"}\n\n");
        assert_eq!(events, vec![json!({"type": "done"})]);
        assert_eq!(parser.pending_bytes(), 0);
    }

    #[test]
    fn test_large_frame_in_small_chunks() {
        let content = "x".repeat(50_000);
        let body = format!(
            "data: {}\n\ndata: {{\"type\":\"done\"}}\n\n",
            json!({"type": "text", "content": content})
        );
        let mut parser = FrameParser::new();
        let mut events = Vec::new();
        for chunk in body.as_bytes().chunks(3) {
            events.extend(parser.push(chunk));
            assert!(parser.scanned <= parser.pending_bytes());
        }
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["content"].as_str().map(str::len), Some(50_000));
        assert_eq!(parser.pending_bytes(), 0);
    }

    #[test]
    fn test_delimiter_split_across_chunks() {
        let mut parser = FrameParser::new();
        assert!(parser.push(b"data: {\"a\":1}\n").is_empty());
        assert_eq!(parser.push(b"\ndata: {\"b\":2}"), vec![json!({"a": 1})]);
        assert!(parser.push(b"\n").is_empty());
        assert_eq!(parser.push(b"\n"), vec![json!({"b": 2})]);
    }

    #[test]
    fn test_malformed_line_is_skipped() {
        let mut parser = FrameParser::new();
        let events = parser.push(b"data: {not json\n\ndata: {\"type\":\"done\"}\n\n");
        assert_eq!(events, vec![json!({"type": "done"})]);
    }

    #[test]
    fn test_ignores_non_data_lines_and_empty_payloads() {
        let mut parser = FrameParser::new();
        let events = parser.push(b": keepalive\nid: 4\ndata: \n\ndata:   {\"a\":1}  \r\n\n");
        assert_eq!(events, vec![json!({"a": 1})]);
    }

    #[test]
    fn test_multiple_data_lines_in_one_frame() {
        let mut parser = FrameParser::new();
        let events = parser.push(b"data: {\"n\":1}\ndata: {\"n\":2}\n\n");
        assert_eq!(events, vec![json!({"n": 1}), json!({"n": 2})]);
    }

    #[tokio::test]
    async fn test_event_stream_flushes_tail() {
        let chunks: Vec<Result<Bytes>> = BODY
            .as_bytes()
            .chunks(7)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        let events: Vec<Value> = event_stream(futures::stream::iter(chunks).boxed())
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[2], json!({"type": "done"}));
    }

    #[tokio::test]
    async fn test_event_stream_passes_transport_error() {
        let chunks: Vec<Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"data: {\"type\":\"text\",\"content\":\"a\"}\n\n")),
            Err(anyhow::anyhow!("connection reset")),
            Ok(Bytes::from_static(b"data: {\"type\":\"done\"}\n\n")),
        ];
        let results: Vec<Result<Value>> = event_stream(futures::stream::iter(chunks).boxed())
            .collect()
            .await;
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }
}
