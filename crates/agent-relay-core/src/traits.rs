//! The handler contract every agent provider implements.

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{AgentMessage, RunRequest};

/// Lazily produced messages of one invocation.
pub type AgentStream = BoxStream<'static, AgentMessage>;

/// Handler method addressed by an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerMethod {
    Run,
    Abort,
    Undo,
    Redo,
}

impl HandlerMethod {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Abort => "abort",
            Self::Undo => "undo",
            Self::Redo => "redo",
        }
    }
}

impl fmt::Display for HandlerMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handler error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    #[error("handler not found: {0}")]
    NotFound(String),
    #[error("handler disconnected: {0}")]
    Disconnected(String),
    #[error("{name} is not installed. Install: {install_hint}")]
    BinaryMissing { name: String, install_hint: String },
    #[error("{binary} exited with code {code}")]
    ProcessFailed { binary: String, code: i32 },
    #[error("no completed session to {0}")]
    NoSession(HandlerMethod),
    #[error("session {0} has no thread to resume")]
    NoThread(String),
    #[error("session {0} is still running")]
    Busy(String),
    #[error("{agent_id} does not support {method}")]
    Unsupported {
        agent_id: String,
        method: HandlerMethod,
    },
    #[error("{0}")]
    Failed(String),
}

/// Run/abort/undo/redo capability for one agent provider.
///
/// Implemented by in-process provider handlers and consumed by the relay
/// server, which never needs to know how a run is executed.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Agent id this handler answers to.
    fn agent_id(&self) -> &str;

    /// Whether `undo`/`redo` are available.
    fn supports_undo(&self) -> bool {
        false
    }

    /// Start a run and return its message stream.
    ///
    /// The stream ends after a terminal message, or without one when the
    /// run is aborted.
    async fn run(&self, request: RunRequest) -> AgentStream;

    /// Abort the in-flight run of `session_id`. No-op when nothing runs.
    async fn abort(&self, session_id: &str);

    /// Revert the last change of `session_id`, or of the most recently
    /// completed session when `None`.
    async fn undo(&self, session_id: Option<&str>) -> Result<(), HandlerError>;

    /// Re-apply the last undone change.
    async fn redo(&self, session_id: Option<&str>) -> Result<(), HandlerError>;

    /// Abort everything in flight before the process exits.
    async fn shutdown(&self) {}
}

const _: () = {
    fn _assert_object_safe(_: &dyn Handler) {}
};
