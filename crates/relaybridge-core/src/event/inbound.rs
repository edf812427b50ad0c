//! Messages received from the upstream aggregator.

use serde_json::Value;

/// Parsed form of one inbound upstream message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// `{"type":"command","command":...}`; handled by the bridge itself.
    Command { command: Value },
    /// Anything else, passed on verbatim to the controller connection.
    Forward(String),
}

/// Classify an inbound text message. Never fails: unparseable text is forwarded.
pub fn parse_inbound(text: &str) -> Inbound {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        return Inbound::Forward(text.to_string());
    };
    if value.get("type").and_then(Value::as_str) == Some("command") {
        let command = value.get("command").cloned().unwrap_or(Value::Null);
        return Inbound::Command { command };
    }
    Inbound::Forward(text.to_string())
}

impl Inbound {
    /// Render a command as a single stdin line for the worker.
    ///
    /// String commands are written verbatim, anything else as compact JSON.
    pub fn command_line(command: &Value) -> String {
        match command {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}
