//! Command building utilities.

use std::path::PathBuf;

use thiserror::Error;

use crate::resolve::resolve_executable_path;

/// Command build error.
#[derive(Debug, Error)]
pub enum CommandBuildError {
    #[error("Base command cannot be parsed: {0}")]
    InvalidBase(String),
    #[error("Base command is empty after parsing")]
    EmptyCommand,
    #[error("Executable not found: {0}")]
    NotFound(String),
}

/// Parsed command parts (program + args).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandParts {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandParts {
    /// Create new command parts.
    #[must_use]
    pub const fn new(program: String, args: Vec<String>) -> Self {
        Self { program, args }
    }

    /// Resolve the program to an absolute path.
    ///
    /// # Errors
    /// Returns `NotFound` if the executable cannot be located.
    pub async fn into_resolved(self) -> Result<(PathBuf, Vec<String>), CommandBuildError> {
        let Self { program, args } = self;
        let executable = resolve_executable_path(&program)
            .await
            .ok_or(CommandBuildError::NotFound(program))?;
        Ok((executable, args))
    }
}

/// Builder for provider CLI commands.
///
/// The base may carry its own arguments (`"npx -y some-cli"`); provider
/// arguments are appended after them.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    /// Base executable command.
    pub base: String,
}

impl CommandBuilder {
    /// Create a new command builder.
    #[must_use]
    pub fn new<S: Into<String>>(base: S) -> Self {
        Self { base: base.into() }
    }

    /// Override the base command.
    #[must_use]
    pub fn override_base<S: Into<String>>(mut self, base: S) -> Self {
        self.base = base.into();
        self
    }

    /// Build the command with per-run arguments appended.
    ///
    /// # Errors
    /// Returns error if the base cannot be split or nothing remains.
    pub fn build(&self, run_args: &[String]) -> Result<CommandParts, CommandBuildError> {
        let mut parts = shlex::split(&self.base)
            .ok_or_else(|| CommandBuildError::InvalidBase(self.base.clone()))?;
        parts.extend(run_args.iter().cloned());

        if parts.is_empty() {
            return Err(CommandBuildError::EmptyCommand);
        }

        let program = parts.remove(0);
        Ok(CommandParts::new(program, parts))
    }

    /// Program name the base resolves to, for messages.
    #[must_use]
    pub fn program_name(&self) -> String {
        shlex::split(&self.base)
            .and_then(|parts| parts.into_iter().next())
            .unwrap_or_else(|| self.base.clone())
    }
}
