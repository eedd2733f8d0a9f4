//! Wire protocol for the control channel and the HTTP endpoints.

use agent_relay_core::{AgentMessage, HandlerMethod, RunOptions};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON text frame exchanged between the relay host and remote handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ControlMessage {
    /// Remote -> host: route `agent_id` to this connection.
    RegisterHandler { agent_id: String },
    /// Remote -> host: drop the route and close the connection.
    UnregisterHandler { agent_id: String },
    /// Host -> remote: execute a handler method.
    InvokeHandler {
        agent_id: String,
        method: HandlerMethod,
        session_id: String,
        #[serde(default)]
        payload: Value,
    },
    AgentStatus {
        session_id: String,
        agent_id: String,
        content: String,
    },
    AgentError {
        session_id: String,
        agent_id: String,
        content: String,
    },
    AgentDone {
        session_id: String,
        agent_id: String,
        #[serde(default)]
        content: String,
    },
}

impl ControlMessage {
    /// Reply frame carrying `message` for one invocation.
    #[must_use]
    pub fn reply(session_id: &str, agent_id: &str, message: AgentMessage) -> Self {
        let session_id = session_id.to_string();
        let agent_id = agent_id.to_string();
        match message {
            AgentMessage::Status(content) => Self::AgentStatus {
                session_id,
                agent_id,
                content,
            },
            AgentMessage::Error(content) => Self::AgentError {
                session_id,
                agent_id,
                content,
            },
            AgentMessage::Done => Self::AgentDone {
                session_id,
                agent_id,
                content: String::new(),
            },
        }
    }

    /// Split a reply frame into `(session_id, agent_id, message)`.
    #[must_use]
    pub fn into_reply(self) -> Option<(String, String, AgentMessage)> {
        match self {
            Self::AgentStatus {
                session_id,
                agent_id,
                content,
            } => Some((session_id, agent_id, AgentMessage::Status(content))),
            Self::AgentError {
                session_id,
                agent_id,
                content,
            } => Some((session_id, agent_id, AgentMessage::Error(content))),
            Self::AgentDone {
                session_id,
                agent_id,
                ..
            } => Some((session_id, agent_id, AgentMessage::Done)),
            _ => None,
        }
    }
}

/// Payload of a `run` invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunPayload {
    pub prompt: String,
    #[serde(default)]
    pub options: RunOptions,
}

/// Body of `POST /agent`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    /// Selected page context, appended to the prompt.
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub options: RunOptions,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Target agent; the host's own provider when absent.
    #[serde(default)]
    pub agent_id: Option<String>,
}

/// Body of `POST /undo` and `POST /redo`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusResponse {
    #[must_use]
    pub fn ok() -> Self {
        Self {
            status: "ok".into(),
            message: None,
        }
    }

    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error".into(),
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    /// Agent id of the host's own provider.
    pub provider: String,
}

/// Where a registered handler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerLocation {
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerInfo {
    pub agent_id: String,
    pub location: HandlerLocation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlersResponse {
    pub handlers: Vec<HandlerInfo>,
}
