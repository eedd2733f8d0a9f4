//! Per-provider argument and event-mapping tables.
//!
//! Every supported CLI is described by a [`ProviderSpec`]: which binary to
//! launch, how to turn run options into argv, and how to translate one
//! line of its structured output into [`ProviderEvent`]s. The process
//! adapter itself is provider-agnostic.

use std::fmt;

use agent_relay_core::RunOptions;
use serde_json::Value;

use crate::providers;

static BUILT_IN: [&ProviderSpec; 7] = [
    &providers::claude::SPEC,
    &providers::codex::SPEC,
    &providers::cursor::SPEC,
    &providers::gemini::SPEC,
    &providers::opencode::SPEC,
    &providers::amp::SPEC,
    &providers::droid::SPEC,
];

/// What a provider event line means to the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    /// Progress text to forward to the caller.
    Status(String),
    /// The run failed; terminal.
    Error(String),
    /// The CLI's own conversation/resume token.
    ThreadId(String),
    /// The run finished successfully; terminal.
    Completed,
}

/// Inputs to a provider's argument builder.
#[derive(Debug, Clone, Copy)]
pub struct ArgsContext<'a> {
    pub options: &'a RunOptions,
    /// Thread id to resume, if the session already has one.
    pub resume: Option<&'a str>,
}

/// Static description of one provider CLI.
pub struct ProviderSpec {
    /// Agent id the provider registers under.
    pub id: &'static str,
    /// Human-readable name used in messages.
    pub name: &'static str,
    /// Default executable.
    pub binary: &'static str,
    /// Where to get the CLI when it is missing.
    pub install_hint: &'static str,
    /// Whether undo/redo can be replayed against a thread.
    pub supports_undo: bool,
    pub build_args: fn(&ArgsContext<'_>) -> Vec<String>,
    pub map_event: fn(&Value) -> Vec<ProviderEvent>,
}

impl fmt::Debug for ProviderSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderSpec")
            .field("id", &self.id)
            .field("binary", &self.binary)
            .field("supports_undo", &self.supports_undo)
            .finish_non_exhaustive()
    }
}

impl ProviderSpec {
    /// Look up a built-in provider by agent id or binary name.
    #[must_use]
    pub fn find(name: &str) -> Option<&'static Self> {
        Self::all()
            .iter()
            .copied()
            .find(|spec| spec.id == name || spec.binary == name)
    }

    /// All built-in providers.
    #[must_use]
    pub fn all() -> &'static [&'static Self] {
        &BUILT_IN
    }

    /// Build argv (without the program) for one run.
    #[must_use]
    pub fn args(&self, options: &RunOptions, resume: Option<&str>) -> Vec<String> {
        (self.build_args)(&ArgsContext { options, resume })
    }

    /// Parse one stdout line. Blank and non-JSON lines yield nothing.
    #[must_use]
    pub fn parse_line(&self, line: &str) -> Vec<ProviderEvent> {
        let line = line.trim();
        if line.is_empty() {
            return Vec::new();
        }
        match serde_json::from_str::<Value>(line) {
            Ok(value) => (self.map_event)(&value),
            Err(err) => {
                tracing::trace!(provider = self.id, %err, "Skipping malformed output line");
                Vec::new()
            }
        }
    }

    /// Error text for a missing executable.
    #[must_use]
    pub fn missing_binary_message(&self) -> String {
        format!("{} is not installed. Install: {}", self.name, self.install_hint)
    }
}

/// `"Using <tool>…"` status text.
pub(crate) fn tool_status(tool: &str) -> ProviderEvent {
    ProviderEvent::Status(format!("Using {}…", tool.trim()))
}

/// Non-empty trimmed text as a status.
pub(crate) fn text_status(text: &str) -> Option<ProviderEvent> {
    let text = text.trim();
    (!text.is_empty()).then(|| ProviderEvent::Status(text.to_string()))
}

pub(crate) fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

/// Claude-style `assistant` content blocks (`text` and `tool_use`).
pub(crate) fn content_block_events(message: &Value) -> Vec<ProviderEvent> {
    let Some(blocks) = message.get("content").and_then(Value::as_array) else {
        return Vec::new();
    };
    blocks
        .iter()
        .filter_map(|block| match str_field(block, "type") {
            Some("text") => str_field(block, "text").and_then(text_status),
            Some("tool_use") => Some(tool_status(str_field(block, "name").unwrap_or("tool"))),
            _ => None,
        })
        .collect()
}

/// Whether the autonomy level asks for fully unattended execution.
pub(crate) fn wants_full_auto(options: &RunOptions) -> bool {
    matches!(
        options.auto_level.as_deref(),
        Some("full" | "yolo" | "bypass")
    )
}
