//! Event types shared by the broadcast hub and the upstream link.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Discriminant of an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Structured,
    Log,
    Error,
    System,
}

impl EventKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Structured => "structured",
            Self::Log => "log",
            Self::Error => "error",
            Self::System => "system",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One classified unit of worker output.
///
/// Serialized as a single JSON object tagged by `kind`, e.g.
/// `{"kind":"log","message":"round over"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    /// A `JSON_DATA:` line; fields are worker-defined and passed through untouched.
    Structured { fields: Map<String, Value> },
    /// Plain stdout text.
    Log { message: String },
    /// Stderr text, malformed structured lines, and bridge-side failures.
    Error { message: String },
    /// Bridge lifecycle notices (greeting, worker exit, controller changes).
    System {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
}

impl Event {
    pub fn log(message: impl Into<String>) -> Self {
        Self::Log {
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::System {
            message: message.into(),
            exit_code: None,
        }
    }

    /// Synthetic event announcing that the worker process has exited.
    ///
    /// `code` is `None` when the process was killed by a signal.
    pub fn worker_exited(code: Option<i32>) -> Self {
        let message = match code {
            Some(code) => format!("Worker process finished (exit code: {code})"),
            None => "Worker process terminated by signal".to_string(),
        };
        Self::System {
            message,
            exit_code: code,
        }
    }

    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Structured { .. } => EventKind::Structured,
            Self::Log { .. } => EventKind::Log,
            Self::Error { .. } => EventKind::Error,
            Self::System { .. } => EventKind::System,
        }
    }

    /// Message text for log/error/system events, `None` for structured ones.
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Structured { .. } => None,
            Self::Log { message } | Self::Error { message } | Self::System { message, .. } => {
                Some(message.as_str())
            }
        }
    }

    /// Structured fields, `None` for message-carrying events.
    pub const fn fields(&self) -> Option<&Map<String, Value>> {
        match self {
            Self::Structured { fields } => Some(fields),
            _ => None,
        }
    }

    /// Serialize to the single-frame wire representation.
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Human-facing round progress derived from a structured event.
///
/// Workers report `game_num` 0-based; the display is 1-based. The event
/// itself is never altered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// 1-based round number.
    pub round: u64,
    pub total: Option<u64>,
}

impl Progress {
    pub fn from_fields(fields: &Map<String, Value>) -> Option<Self> {
        let game_num = fields.get("game_num")?.as_u64()?;
        let total = fields.get("total_games").and_then(Value::as_u64);
        Some(Self {
            round: game_num.saturating_add(1),
            total,
        })
    }

    pub fn from_event(event: &Event) -> Option<Self> {
        event.fields().and_then(Self::from_fields)
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.total {
            Some(total) => write!(f, "[Round {}/{}]", self.round, total),
            None => write!(f, "[Round {}]", self.round),
        }
    }
}
