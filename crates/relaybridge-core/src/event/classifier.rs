//! Event classification for framed worker lines.
//!
//! A worker writes human-readable progress and machine-readable metrics to
//! the same stdout; structured lines carry the [`STRUCTURED_PREFIX`] sentinel.
//! Classification never fails: a bad payload becomes an `error` event.

use serde_json::{Map, Value};

use super::types::Event;
use crate::error::{Error, Result};

/// Sentinel marking a structured (JSON object) line.
pub const STRUCTURED_PREFIX: &str = "JSON_DATA:";

/// Which worker stream a line was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// Classify one trimmed line into exactly one [`Event`].
pub fn classify(line: &str, stream: OutputStream) -> Event {
    if stream == OutputStream::Stderr {
        return Event::error(line);
    }

    match line.strip_prefix(STRUCTURED_PREFIX) {
        Some(payload) => match parse_structured(line, payload) {
            Ok(fields) => Event::Structured { fields },
            Err(e) => {
                tracing::warn!(error = %e, "Malformed structured line");
                Event::error(e.to_string())
            }
        },
        None => Event::log(line),
    }
}

/// Parse the payload of a `JSON_DATA:` line into its field map.
///
/// `line` is only used for the diagnostic carried by
/// [`Error::MalformedEvent`].
pub fn parse_structured(line: &str, payload: &str) -> Result<Map<String, Value>> {
    let value: Value = serde_json::from_str(payload).map_err(|e| Error::MalformedEvent {
        line: line.to_string(),
        reason: e.to_string(),
    })?;
    match value {
        Value::Object(fields) => Ok(fields),
        other => Err(Error::MalformedEvent {
            line: line.to_string(),
            reason: format!("expected a JSON object, found {}", json_type_name(&other)),
        }),
    }
}

const fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use serde_json::json;

    #[test]
    fn structured_line_yields_exact_fields() {
        let event = classify(
            r#"JSON_DATA:{"game_num":0,"total_games":10,"score":1.5,"winner":"red"}"#,
            OutputStream::Stdout,
        );
        let fields = event.fields().unwrap();
        assert_eq!(
            Value::Object(fields.clone()),
            json!({"game_num": 0, "total_games": 10, "score": 1.5, "winner": "red"})
        );
    }

    #[test]
    fn whitespace_after_prefix_is_tolerated() {
        let event = classify(r#"JSON_DATA: {"a":1}"#, OutputStream::Stdout);
        assert_eq!(event.kind(), EventKind::Structured);
    }

    #[test]
    fn invalid_payload_becomes_error_event() {
        let line = r#"JSON_DATA:{"game_num":"#;
        let event = classify(line, OutputStream::Stdout);
        assert_eq!(event.kind(), EventKind::Error);
        let message = event.message().unwrap();
        assert!(message.contains(line), "raw line kept: {message}");
        assert!(message.contains("EOF"), "parse reason kept: {message}");
    }

    #[test]
    fn non_object_payload_is_malformed() {
        let event = classify("JSON_DATA:[1,2]", OutputStream::Stdout);
        assert_eq!(event.kind(), EventKind::Error);
        assert!(event.message().unwrap().contains("found array"));
    }

    #[test]
    fn plain_line_is_log() {
        let event = classify("game 0 is over", OutputStream::Stdout);
        assert_eq!(event, Event::log("game 0 is over"));
    }

    #[test]
    fn prefix_must_lead_the_line() {
        let event = classify(r#"note JSON_DATA:{"a":1}"#, OutputStream::Stdout);
        assert_eq!(event.kind(), EventKind::Log);
    }

    #[test]
    fn stderr_is_always_error() {
        let event = classify(r#"JSON_DATA:{"a":1}"#, OutputStream::Stderr);
        assert_eq!(event, Event::error(r#"JSON_DATA:{"a":1}"#));
    }
}
