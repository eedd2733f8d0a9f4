//! [`Handler`] implementation backed by the process adapter.

use std::sync::Arc;

use agent_relay_core::{
    AgentMessage, AgentStream, Handler, HandlerError, HandlerMethod, RunOptions, RunRequest,
};
use agent_relay_executor::{AdapterEvent, ProcessAdapter};
use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::registry::{CancellationHandle, SessionRegistry};

const UNDO_PROMPT: &str = "Undo the most recent change you made to the files in this \
conversation. Restore them exactly as they were before that change and make no other edits.";

const REDO_PROMPT: &str = "Re-apply the change you just undid, exactly as it was before the \
undo. Make no other edits.";

const FORWARD_BUFFER: usize = 32;

/// Handler for one provider CLI.
///
/// Each `run` becomes one adapter invocation; follow-up runs on a session
/// resume the provider thread recorded in the registry.
pub struct ProviderHandler {
    adapter: ProcessAdapter,
    registry: Arc<SessionRegistry>,
    defaults: RunOptions,
}

impl ProviderHandler {
    #[must_use]
    pub fn new(adapter: ProcessAdapter, registry: Arc<SessionRegistry>) -> Self {
        Self {
            adapter,
            registry,
            defaults: RunOptions::default(),
        }
    }

    /// Options applied to every run unless the caller sets them.
    #[must_use]
    pub fn with_defaults(mut self, defaults: RunOptions) -> Self {
        self.defaults = defaults;
        self
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    async fn replay(
        &self,
        method: HandlerMethod,
        session_id: Option<&str>,
        prompt: &str,
    ) -> Result<(), HandlerError> {
        let spec = self.adapter.spec();
        if !spec.supports_undo {
            return Err(HandlerError::Unsupported {
                agent_id: spec.id.to_string(),
                method,
            });
        }

        let session_id = match session_id.filter(|id| !id.is_empty()) {
            Some(id) => id.to_string(),
            None => self
                .registry
                .last_completed()
                .ok_or(HandlerError::NoSession(method))?,
        };
        let session = self
            .registry
            .get(&session_id)
            .ok_or(HandlerError::NoSession(method))?;
        let thread = session
            .external_thread_id
            .ok_or_else(|| HandlerError::NoThread(session_id.clone()))?;

        tracing::info!(agent_id = spec.id, %session_id, %thread, %method, "Replaying turn");
        self.adapter
            .run_to_completion(prompt.to_string(), session.last_options, &thread)
            .await
    }
}

#[async_trait]
impl Handler for ProviderHandler {
    fn agent_id(&self) -> &str {
        self.adapter.spec().id
    }

    fn supports_undo(&self) -> bool {
        self.adapter.spec().supports_undo
    }

    async fn run(&self, request: RunRequest) -> AgentStream {
        let RunRequest {
            session_id,
            prompt,
            options,
        } = request;
        let options = options.with_defaults(&self.defaults);
        let session = self.registry.begin(&session_id, options.clone());

        let handle = CancellationHandle::new();
        if let Some(previous) = self
            .registry
            .register_cancellation(&session_id, handle.clone())
        {
            tracing::info!(
                agent_id = self.agent_id(),
                %session_id,
                "Session already streaming, cancelling earlier run"
            );
            previous.cancel();
        }

        tracing::info!(
            agent_id = self.agent_id(),
            %session_id,
            follow_up = session.external_thread_id.is_some(),
            "Starting run"
        );
        let events = self
            .adapter
            .run(prompt, options, session.external_thread_id, handle.token());

        let (tx, rx) = mpsc::channel(FORWARD_BUFFER);
        tokio::spawn(forward(
            events,
            tx,
            Arc::clone(&self.registry),
            session_id,
            handle,
        ));
        ReceiverStream::new(rx).boxed()
    }

    async fn abort(&self, session_id: &str) {
        if let Some(handle) = self.registry.take_cancellation(session_id) {
            tracing::info!(agent_id = self.agent_id(), session_id, "Aborting run");
            handle.cancel();
        }
    }

    async fn undo(&self, session_id: Option<&str>) -> Result<(), HandlerError> {
        self.replay(HandlerMethod::Undo, session_id, UNDO_PROMPT)
            .await
    }

    async fn redo(&self, session_id: Option<&str>) -> Result<(), HandlerError> {
        self.replay(HandlerMethod::Redo, session_id, REDO_PROMPT)
            .await
    }

    async fn shutdown(&self) {
        self.registry.cancel_all();
    }
}

/// Pump adapter events into the caller's stream and keep the registry
/// current. A dropped receiver cancels the run.
async fn forward(
    mut events: BoxStream<'static, AdapterEvent>,
    tx: mpsc::Sender<AgentMessage>,
    registry: Arc<SessionRegistry>,
    session_id: String,
    handle: CancellationHandle,
) {
    loop {
        let event = tokio::select! {
            () = tx.closed() => {
                tracing::debug!(%session_id, "Caller went away, cancelling run");
                handle.cancel();
                break;
            }
            event = events.next() => event,
        };
        let Some(event) = event else {
            break;
        };

        match event {
            AdapterEvent::ThreadId(thread_id) => registry.upsert_thread_id(&session_id, thread_id),
            AdapterEvent::Message(message) => {
                if handle.is_cancelled() {
                    break;
                }
                match &message {
                    AgentMessage::Status(text) => registry.record_status(&session_id, text),
                    AgentMessage::Done => registry.mark_completed(&session_id),
                    AgentMessage::Error(text) => {
                        tracing::warn!(%session_id, error = %text, "Run failed");
                    }
                }
                let terminal = message.is_terminal();
                if tx.send(message).await.is_err() {
                    handle.cancel();
                    break;
                }
                if terminal {
                    break;
                }
            }
        }
    }
    registry.release(&session_id, handle.invocation_id());
}
