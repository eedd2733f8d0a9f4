//! Messages streamed back to callers for a single invocation.

use serde::{Deserialize, Serialize};

/// Synthetic status emitted as soon as a run is accepted.
pub const THINKING_STATUS: &str = "Thinking…";

/// One message of an invocation's output stream.
///
/// `Error` and `Done` are terminal: nothing follows either of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "text", rename_all = "snake_case")]
pub enum AgentMessage {
    /// Incremental human-readable progress text.
    Status(String),
    /// Failure description.
    Error(String),
    /// Successful end of the invocation.
    Done,
}

impl AgentMessage {
    /// Create a status message.
    #[must_use]
    pub fn status(text: impl Into<String>) -> Self {
        Self::Status(text.into())
    }

    /// Create an error message.
    #[must_use]
    pub fn error(text: impl Into<String>) -> Self {
        Self::Error(text.into())
    }

    /// Whether no further messages may follow this one.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Error(_) | Self::Done)
    }

    /// Event name used on the wire (`status`, `error`, `done`).
    #[must_use]
    pub const fn event_name(&self) -> &'static str {
        match self {
            Self::Status(_) => "status",
            Self::Error(_) => "error",
            Self::Done => "done",
        }
    }

    /// Payload text; empty for `Done`.
    #[must_use]
    pub fn content(&self) -> &str {
        match self {
            Self::Status(text) | Self::Error(text) => text,
            Self::Done => "",
        }
    }
}
