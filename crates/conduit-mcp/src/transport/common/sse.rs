//! Minimal Server-Sent Events framing.
//!
//! Emitting side: `event:` line, one `data:` line per payload line, blank
//! line terminator, UTF-8 throughout, one flush per event. Parsing side:
//! only the `event:` and `data:` fields are recognized; every other field,
//! comment lines, and anything before the first event is ignored. An event
//! without an `event:` line has the default type `message`.

use bytes::{Bytes, BytesMut};

pub const EVENT_TYPE_MESSAGE: &str = "message";
pub const EVENT_TYPE_ENDPOINT: &str = "endpoint";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: Option<String>,
}

impl SseEvent {
    pub fn message(data: impl Into<String>) -> Self {
        Self {
            event: Some(EVENT_TYPE_MESSAGE.to_string()),
            data: Some(data.into()),
        }
    }

    pub fn endpoint(data: impl Into<String>) -> Self {
        Self {
            event: Some(EVENT_TYPE_ENDPOINT.to_string()),
            data: Some(data.into()),
        }
    }

    pub fn event_type(&self) -> &str {
        self.event.as_deref().unwrap_or(EVENT_TYPE_MESSAGE)
    }

    pub fn encode(&self) -> Bytes {
        let mut out = String::new();
        if let Some(event) = &self.event {
            out.push_str("event: ");
            out.push_str(event);
            out.push('\n');
        }
        if let Some(data) = &self.data {
            for line in data.split('\n') {
                out.push_str("data: ");
                out.push_str(line);
                out.push('\n');
            }
        }
        out.push('\n');
        Bytes::from(out)
    }
}

/// A keep-alive comment frame. Ignored by compliant parsers.
pub fn keep_alive_frame() -> Bytes {
    Bytes::from_static(b":ping\n\n")
}

/// Incremental parser for a `text/event-stream` body.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: BytesMut,
    event: Option<String>,
    data: Option<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of the body, returning every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line = self.buffer.split_to(newline + 1);
            let line = String::from_utf8_lossy(&line[..newline]);
            let line = line.strip_suffix('\r').unwrap_or(&line);
            if line.is_empty() {
                if let Some(event) = self.take_event() {
                    events.push(event);
                }
            } else {
                self.field(line);
            }
        }
        events
    }

    fn take_event(&mut self) -> Option<SseEvent> {
        if self.event.is_none() && self.data.is_none() {
            return None;
        }
        Some(SseEvent {
            event: self.event.take(),
            data: self.data.take(),
        })
    }

    fn field(&mut self, line: &str) {
        if line.starts_with(':') {
            return;
        }
        let (name, value) = match line.split_once(':') {
            Some((name, value)) => (name, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match name {
            "event" => self.event = Some(value.to_string()),
            "data" => match &mut self.data {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => self.data = Some(value.to_string()),
            },
            _ => {}
        }
    }
}

/// Resolve the data of an `endpoint` event against the SSE endpoint URL.
///
/// The data may be an absolute URL, an absolute path, or a path relative to
/// the SSE endpoint's parent.
pub fn resolve_endpoint(sse_url: &str, data: &str) -> String {
    if data.contains("://") {
        return data.to_string();
    }
    let scheme_end = sse_url.find("://").map(|idx| idx + 3).unwrap_or(0);
    if let Some(path) = data.strip_prefix('/') {
        let origin_end = sse_url[scheme_end..]
            .find('/')
            .map(|idx| scheme_end + idx)
            .unwrap_or(sse_url.len());
        return format!("{}/{}", &sse_url[..origin_end], path);
    }
    let parent_end = sse_url
        .rfind('/')
        .filter(|idx| *idx >= scheme_end)
        .unwrap_or(sse_url.len());
    format!("{}/{}", &sse_url[..parent_end], data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_message_event() {
        let event = SseEvent::message(r#"{"jsonrpc":"2.0","method":"ping"}"#);
        assert_eq!(
            event.encode(),
            Bytes::from_static(
                b"event: message\ndata: {\"jsonrpc\":\"2.0\",\"method\":\"ping\"}\n\n"
            )
        );
    }

    #[test]
    fn test_encode_multi_line_data() {
        let event = SseEvent::message("a\nb");
        assert_eq!(
            event.encode(),
            Bytes::from_static(b"event: message\ndata: a\ndata: b\n\n")
        );
    }

    #[test]
    fn test_parse_round_trip() {
        let mut parser = SseParser::new();
        let events = parser.push(&SseEvent::message("payload").encode());
        assert_eq!(events, vec![SseEvent::message("payload")]);
    }

    #[test]
    fn test_parse_defaults_event_type_to_message() {
        let mut parser = SseParser::new();
        let events = parser.push(b"data: hello\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type(), EVENT_TYPE_MESSAGE);
        assert_eq!(events[0].data.as_deref(), Some("hello"));
    }

    #[test]
    fn test_parse_across_chunk_boundaries() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"event: mess").is_empty());
        assert!(parser.push(b"age\ndata: hi").is_empty());
        let events = parser.push(b"\n\n");
        assert_eq!(events, vec![SseEvent::message("hi")]);
    }

    #[test]
    fn test_parse_ignores_comments_and_unknown_fields() {
        let mut parser = SseParser::new();
        let events = parser.push(b":ping\n\nretry: 100\nid: 4\ndata: x\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data.as_deref(), Some("x"));
    }

    #[test]
    fn test_parse_joins_data_lines() {
        let mut parser = SseParser::new();
        let events = parser.push(b"data: a\ndata: b\n\n");
        assert_eq!(events[0].data.as_deref(), Some("a\nb"));
    }

    #[test]
    fn test_parse_handles_crlf() {
        let mut parser = SseParser::new();
        let events = parser.push(b"event: endpoint\r\ndata: /message\r\n\r\n");
        assert_eq!(events, vec![SseEvent::endpoint("/message")]);
    }

    #[test]
    fn test_resolve_endpoint_absolute_url() {
        assert_eq!(
            resolve_endpoint("http://host:8080/sse", "http://other/message"),
            "http://other/message"
        );
    }

    #[test]
    fn test_resolve_endpoint_absolute_path() {
        assert_eq!(
            resolve_endpoint("http://host:8080/api/sse", "/message?sessionId=1"),
            "http://host:8080/message?sessionId=1"
        );
    }

    #[test]
    fn test_resolve_endpoint_relative_path() {
        assert_eq!(
            resolve_endpoint("http://host:8080/api/sse", "message?sessionId=1"),
            "http://host:8080/api/message?sessionId=1"
        );
    }
}
