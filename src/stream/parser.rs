use crate::protocol::StreamEvent;
use serde_json::Value;
use tracing::warn;

pub const DATA_PREFIX: &str = "data: ";
pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    /// Not an event line, an empty payload, or an event type this client does not know.
    NoEvent,
    EndOfStream,
    Event(StreamEvent),
    /// The payload could not be read. The caller logs it and keeps consuming the stream.
    ParseError { payload: String, reason: String },
}

pub fn parse_line(line: &str) -> ParsedLine {
    let Some(rest) = line.strip_prefix(DATA_PREFIX) else {
        return ParsedLine::NoEvent;
    };

    let payload = rest.trim();
    if payload == DONE_SENTINEL {
        return ParsedLine::EndOfStream;
    }
    if payload.is_empty() {
        return ParsedLine::NoEvent;
    }

    let value: Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(err) => return parse_error(payload, err.to_string()),
    };

    let Some(kind) = value.get("type").and_then(Value::as_str) else {
        return parse_error(payload, "missing `type` field".to_string());
    };

    if !StreamEvent::KNOWN_TYPES.iter().any(|known| *known == kind) {
        warn!(event_type = kind, "ignoring unknown stream event type");
        return ParsedLine::NoEvent;
    }

    match serde_json::from_value(value) {
        Ok(event) => ParsedLine::Event(event),
        Err(err) => parse_error(payload, err.to_string()),
    }
}

fn parse_error(payload: &str, reason: String) -> ParsedLine {
    ParsedLine::ParseError {
        payload: payload.to_string(),
        reason,
    }
}
