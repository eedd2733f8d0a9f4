//! Generic process adapter for provider CLIs.
//!
//! One [`ProcessAdapter::run`] spawns one CLI invocation in its own process
//! group, writes the prompt to stdin, and turns stdout lines into
//! [`AdapterEvent`]s through the provider's [`ProviderSpec`].

use std::{io, process::Stdio, time::Duration};

use agent_relay_core::{AgentMessage, HandlerError, RunOptions};
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use futures::{StreamExt, stream::BoxStream};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::Command,
    sync::mpsc,
};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::{
    command::{CommandBuildError, CommandBuilder},
    provider::{ProviderEvent, ProviderSpec},
};

/// Time a cancelled CLI gets between SIGTERM and SIGKILL.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(3);

const EVENT_BUFFER: usize = 64;

/// Output of a single run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterEvent {
    /// The provider's thread id, reported once when first seen.
    ThreadId(String),
    /// A message for the caller.
    Message(AgentMessage),
}

/// Spawns and parses one provider CLI.
#[derive(Debug, Clone)]
pub struct ProcessAdapter {
    spec: &'static ProviderSpec,
    command: CommandBuilder,
    grace_period: Duration,
}

impl ProcessAdapter {
    /// Adapter for `spec` using its default binary.
    #[must_use]
    pub fn new(spec: &'static ProviderSpec) -> Self {
        Self {
            spec,
            command: CommandBuilder::new(spec.binary),
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    /// Launch a different executable (or wrapper command) for this provider.
    #[must_use]
    pub fn with_binary(mut self, base: impl Into<String>) -> Self {
        self.command = self.command.override_base(base);
        self
    }

    #[must_use]
    pub const fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    #[must_use]
    pub const fn spec(&self) -> &'static ProviderSpec {
        self.spec
    }

    /// Start a run.
    ///
    /// Nothing is emitted once `cancel` fires; the CLI then gets SIGTERM and,
    /// after the grace period, SIGKILL. Dropping the returned stream has the
    /// same effect as cancelling.
    #[must_use]
    pub fn run(
        &self,
        prompt: String,
        options: RunOptions,
        resume: Option<String>,
        cancel: CancellationToken,
    ) -> BoxStream<'static, AdapterEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let adapter = self.clone();
        tokio::spawn(async move {
            adapter.drive(prompt, options, resume, cancel, tx).await;
        });
        ReceiverStream::new(rx).boxed()
    }

    /// Run `prompt` against `thread` and wait for the result.
    ///
    /// Used for undo/redo, which are short follow-up turns on an existing
    /// thread.
    ///
    /// # Errors
    /// Returns the run's error text, or an error if it ended without a
    /// terminal message.
    pub async fn run_to_completion(
        &self,
        prompt: String,
        options: RunOptions,
        thread: &str,
    ) -> Result<(), HandlerError> {
        let mut events = self.run(
            prompt,
            options,
            Some(thread.to_string()),
            CancellationToken::new(),
        );
        while let Some(event) = events.next().await {
            match event {
                AdapterEvent::Message(AgentMessage::Done) => return Ok(()),
                AdapterEvent::Message(AgentMessage::Error(text)) => {
                    return Err(HandlerError::Failed(text));
                }
                AdapterEvent::Message(AgentMessage::Status(_)) | AdapterEvent::ThreadId(_) => {}
            }
        }
        Err(HandlerError::Failed(format!(
            "{} ended without a result",
            self.spec.binary
        )))
    }

    async fn spawn(
        &self,
        options: &RunOptions,
        resume: Option<&str>,
    ) -> Result<AsyncGroupChild, HandlerError> {
        let missing = || HandlerError::BinaryMissing {
            name: self.spec.name.to_string(),
            install_hint: self.spec.install_hint.to_string(),
        };

        let args = self.spec.args(options, resume);
        let (executable, args) = match self.command.build(&args) {
            Ok(parts) => parts.into_resolved().await,
            Err(err) => Err(err),
        }
        .map_err(|err| match err {
            CommandBuildError::NotFound(_) => missing(),
            other => HandlerError::Failed(format!(
                "Invalid command for {}: {other}",
                self.spec.name
            )),
        })?;

        let mut command = Command::new(&executable);
        command
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &options.working_dir {
            command.current_dir(dir);
        }

        tracing::info!(
            provider = self.spec.id,
            program = %executable.display(),
            ?args,
            resume = resume.is_some(),
            "Spawning agent CLI"
        );

        command.group_spawn().map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                missing()
            } else {
                HandlerError::Failed(format!("Failed to start {}: {err}", self.spec.binary))
            }
        })
    }

    async fn drive(
        self,
        prompt: String,
        options: RunOptions,
        resume: Option<String>,
        cancel: CancellationToken,
        tx: mpsc::Sender<AdapterEvent>,
    ) {
        let spec = self.spec;
        let mut child = match self.spawn(&options, resume.as_deref()).await {
            Ok(child) => child,
            Err(err) => {
                tracing::warn!(provider = spec.id, error = %err, "Agent CLI did not start");
                if !cancel.is_cancelled() {
                    let _ = tx
                        .send(AdapterEvent::Message(AgentMessage::error(err.to_string())))
                        .await;
                }
                return;
            }
        };
        let pid = child.id();

        if let Some(mut stdin) = child.inner().stdin.take() {
            tokio::spawn(async move {
                if let Err(err) = stdin.write_all(prompt.as_bytes()).await {
                    tracing::debug!(?pid, %err, "Failed to write prompt to agent stdin");
                }
                let _ = stdin.shutdown().await;
            });
        }

        if let Some(stderr) = child.inner().stderr.take() {
            let provider = spec.id;
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(provider, ?pid, "agent stderr: {line}");
                }
            });
        }

        let Some(stdout) = child.inner().stdout.take() else {
            stop(&mut child, self.grace_period).await;
            let _ = tx
                .send(AdapterEvent::Message(AgentMessage::error(format!(
                    "Failed to capture output of {}",
                    spec.binary
                ))))
                .await;
            return;
        };

        let mut lines = BufReader::new(stdout).lines();
        let mut state = RunState::default();

        loop {
            let line = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    tracing::debug!(provider = spec.id, ?pid, "Run cancelled");
                    stop(&mut child, self.grace_period).await;
                    return;
                }
                line = lines.next_line() => line,
            };

            match line {
                Ok(Some(line)) => {
                    for event in spec.parse_line(&line) {
                        let Some(out) = state.accept(event) else {
                            continue;
                        };
                        if cancel.is_cancelled() || tx.send(out).await.is_err() {
                            tracing::debug!(provider = spec.id, ?pid, "Run abandoned");
                            stop(&mut child, self.grace_period).await;
                            return;
                        }
                    }
                    if state.terminal {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(provider = spec.id, ?pid, %err, "Failed to read agent stdout");
                    break;
                }
            }
        }

        // After its result the CLI gets one grace period to exit by itself.
        let grace_period = self.grace_period;
        let terminal = state.terminal;
        let linger = async move {
            if terminal {
                tokio::time::sleep(grace_period).await;
            } else {
                std::future::pending::<()>().await;
            }
        };

        let status = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                stop(&mut child, grace_period).await;
                return;
            }
            status = child.wait() => status,
            () = linger => {
                tracing::debug!(
                    provider = spec.id,
                    ?pid,
                    "Agent CLI still running after its result"
                );
                stop(&mut child, grace_period).await;
                return;
            }
        };

        tracing::info!(provider = spec.id, ?pid, ?status, "Agent CLI exited");
        if cancel.is_cancelled() || state.terminal {
            return;
        }

        let message = match status {
            Ok(status) if status.success() => AgentMessage::Done,
            Ok(status) => match status.code() {
                Some(code) => AgentMessage::error(
                    HandlerError::ProcessFailed {
                        binary: spec.binary.to_string(),
                        code,
                    }
                    .to_string(),
                ),
                None => AgentMessage::error(format!("{} was terminated by a signal", spec.binary)),
            },
            Err(err) => AgentMessage::error(format!("Failed to wait for {}: {err}", spec.binary)),
        };
        let _ = tx.send(AdapterEvent::Message(message)).await;
    }
}

/// Per-run bookkeeping between parsed provider events and emitted output.
#[derive(Debug, Default)]
struct RunState {
    terminal: bool,
    thread_id: Option<String>,
}

impl RunState {
    /// Translate a provider event, dropping anything after a terminal
    /// message and repeated thread ids.
    fn accept(&mut self, event: ProviderEvent) -> Option<AdapterEvent> {
        match event {
            ProviderEvent::ThreadId(id) => {
                if self.thread_id.as_deref() == Some(id.as_str()) {
                    return None;
                }
                self.thread_id = Some(id.clone());
                Some(AdapterEvent::ThreadId(id))
            }
            _ if self.terminal => None,
            ProviderEvent::Status(text) => Some(AdapterEvent::Message(AgentMessage::Status(text))),
            ProviderEvent::Error(text) => {
                self.terminal = true;
                Some(AdapterEvent::Message(AgentMessage::Error(text)))
            }
            ProviderEvent::Completed => {
                self.terminal = true;
                Some(AdapterEvent::Message(AgentMessage::Done))
            }
        }
    }
}

/// SIGTERM the process group, then SIGKILL once the grace period is over.
async fn stop(child: &mut AsyncGroupChild, grace_period: Duration) {
    if matches!(child.try_wait(), Ok(Some(_))) {
        return;
    }
    terminate_group(child);
    if tokio::time::timeout(grace_period, child.wait()).await.is_err() {
        tracing::debug!(pid = ?child.id(), "Agent CLI ignored SIGTERM, killing");
        if let Err(err) = child.start_kill() {
            tracing::warn!(pid = ?child.id(), %err, "Failed to kill agent CLI");
        }
        let _ = child.wait().await;
    }
}

#[cfg(unix)]
fn terminate_group(child: &mut AsyncGroupChild) {
    use nix::{
        sys::signal::{Signal, killpg},
        unistd::Pid,
    };

    let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) else {
        return;
    };
    if let Err(err) = killpg(Pid::from_raw(pid), Signal::SIGTERM) {
        tracing::debug!(pid, %err, "Failed to signal agent process group");
    }
}

#[cfg(not(unix))]
fn terminate_group(child: &mut AsyncGroupChild) {
    let _ = child.start_kill();
}
