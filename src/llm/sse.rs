//! Incremental server-sent-event parsing for upstream byte streams.
//!
//! Providers frame their streaming responses as SSE but differ in the
//! details (event names, `[DONE]` sentinels, ping comments). This module
//! handles the framing only; each adapter interprets the event payloads.

use futures::{Stream, StreamExt};

use super::providers::UpstreamError;

/// One parsed SSE event.
#[derive(Debug, Clone, Default)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

impl SseEvent {
    /// True for the OpenAI-style end-of-stream sentinel.
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

/// Stateful parser that turns arbitrary byte chunks into SSE events.
/// Events may span chunk boundaries, so unconsumed bytes stay buffered.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<SseEvent>, UpstreamError> {
        let text = std::str::from_utf8(chunk).map_err(|err| {
            UpstreamError::transient(format!("invalid utf-8 in event stream: {err}"))
        })?;
        self.buffer.push_str(text);

        let mut events = Vec::new();
        while let Some(boundary) = find_boundary(&self.buffer) {
            let block: String = self.buffer.drain(..boundary.end).collect();
            if let Some(event) = parse_block(&block[..boundary.start]) {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// Whatever is left once the upstream closes. A non-empty remainder
    /// usually means a truncated stream.
    pub fn remainder(&self) -> Option<&str> {
        let rest = self.buffer.trim();
        (!rest.is_empty()).then_some(rest)
    }
}

struct Boundary {
    start: usize,
    end: usize,
}

/// Events end at a blank line; both `\n\n` and `\r\n\r\n` occur in the wild.
fn find_boundary(buffer: &str) -> Option<Boundary> {
    let lf = buffer.find("\n\n");
    let crlf = buffer.find("\r\n\r\n");
    match (lf, crlf) {
        (Some(a), Some(b)) if b < a => Some(Boundary { start: b, end: b + 4 }),
        (Some(a), _) => Some(Boundary { start: a, end: a + 2 }),
        (None, Some(b)) => Some(Boundary { start: b, end: b + 4 }),
        (None, None) => None,
    }
}

fn parse_block(block: &str) -> Option<SseEvent> {
    let mut event = SseEvent::default();
    let mut data_lines = Vec::new();

    for line in block.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => event.event = Some(value.to_string()),
            "data" => data_lines.push(value.to_string()),
            "id" => event.id = Some(value.to_string()),
            _ => {}
        }
    }

    if event.event.is_none() && data_lines.is_empty() {
        return None;
    }
    event.data = data_lines.join("\n");
    Some(event)
}

/// Adapt a reqwest byte stream into a stream of SSE events.
pub fn event_stream(
    response: reqwest::Response,
) -> impl Stream<Item = Result<SseEvent, UpstreamError>> + Send {
    let bytes = response.bytes_stream();
    let parser = SseParser::new();

    futures::stream::unfold(
        (bytes, parser, Vec::<SseEvent>::new(), false),
        |(mut bytes, mut parser, mut pending, done)| async move {
            loop {
                if let Some(event) = pending.pop() {
                    return Some((Ok(event), (bytes, parser, pending, done)));
                }
                if done {
                    return None;
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => match parser.push(&chunk) {
                        Ok(mut events) => {
                            // Popped from the back; keep arrival order.
                            events.reverse();
                            pending = events;
                        }
                        Err(err) => return Some((Err(err), (bytes, parser, pending, true))),
                    },
                    Some(Err(err)) => {
                        let err = UpstreamError::transient(format!("stream read failed: {err}"));
                        return Some((Err(err), (bytes, parser, pending, true)));
                    }
                    None => return None,
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_data_event() {
        let mut parser = SseParser::new();
        let events = parser.push(b"data: {\"x\":1}\n\n").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"x\":1}");
        assert!(parser.remainder().is_none());
    }

    #[test]
    fn buffers_across_chunk_boundaries() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"data: hel").unwrap().is_empty());
        let events = parser.push(b"lo\n\ndata: next").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "hello");
        assert_eq!(parser.remainder(), Some("data: next"));
    }

    #[test]
    fn parses_named_events_and_crlf() {
        let mut parser = SseParser::new();
        let events = parser
            .push(b"event: message_start\r\ndata: {}\r\n\r\n")
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("message_start"));
    }

    #[test]
    fn skips_comment_pings() {
        let mut parser = SseParser::new();
        let events = parser.push(b": ping\n\ndata: real\n\n").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "real");
    }

    #[test]
    fn multiline_data_joins_with_newline() {
        let mut parser = SseParser::new();
        let events = parser.push(b"data: a\ndata: b\n\n").unwrap();
        assert_eq!(events[0].data, "a\nb");
    }

    #[test]
    fn done_sentinel_detected() {
        let mut parser = SseParser::new();
        let events = parser.push(b"data: [DONE]\n\n").unwrap();
        assert!(events[0].is_done());
    }
}
