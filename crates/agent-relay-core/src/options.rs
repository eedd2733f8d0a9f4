//! Options and requests for a single agent run.

use std::{collections::HashMap, path::PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Caller-supplied options for an agent run.
///
/// Known fields drive the provider argument builders; anything else the
/// client sends is kept in `metadata`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOptions {
    /// Working directory for the external CLI.
    #[serde(default, alias = "cwd", skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,

    /// Model name passed through to the CLI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Autonomy/sandbox level, interpreted per provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_level: Option<String>,

    /// Arbitrary extra options.
    #[serde(default, flatten)]
    pub metadata: HashMap<String, Value>,
}

impl RunOptions {
    /// Options with just a working directory.
    #[must_use]
    pub fn new(working_dir: PathBuf) -> Self {
        Self {
            working_dir: Some(working_dir),
            ..Self::default()
        }
    }

    /// Fill unset fields from `defaults`. Fields set on `self` win.
    #[must_use]
    pub fn with_defaults(mut self, defaults: &Self) -> Self {
        if self.working_dir.is_none() {
            self.working_dir.clone_from(&defaults.working_dir);
        }
        if self.model.is_none() {
            self.model.clone_from(&defaults.model);
        }
        if self.auto_level.is_none() {
            self.auto_level.clone_from(&defaults.auto_level);
        }
        for (key, value) in &defaults.metadata {
            self.metadata
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        self
    }

    /// Get a metadata value by key.
    #[must_use]
    pub fn get_metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// Set a metadata value.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: Value) {
        self.metadata.insert(key.into(), value);
    }
}

/// A `run` invocation as seen by a handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub session_id: String,
    pub prompt: String,
    #[serde(default)]
    pub options: RunOptions,
}

impl RunRequest {
    #[must_use]
    pub fn new(session_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            prompt: prompt.into(),
            options: RunOptions::default(),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }
}

/// Join the user's instruction with the selected page context.
#[must_use]
pub fn compose_prompt(prompt: &str, content: &str) -> String {
    let content = content.trim();
    if content.is_empty() {
        prompt.to_string()
    } else {
        format!("{prompt}\n\n{content}")
    }
}
