//! In-memory session and cancellation registry.
//!
//! Keyed by the caller's session id. Entries live as long as the process
//! and are never written to disk.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use agent_relay_core::RunOptions;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// What the relay knows about one caller session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentSession {
    pub session_id: String,
    /// Provider-native thread id, once seen in the CLI output.
    pub external_thread_id: Option<String>,
    pub is_streaming: bool,
    pub last_status: Option<String>,
    /// Options of the latest run, reused by undo/redo.
    pub last_options: RunOptions,
}

/// Cancellation for one in-flight invocation.
#[derive(Debug, Clone)]
pub struct CancellationHandle {
    invocation_id: Uuid,
    token: CancellationToken,
}

impl CancellationHandle {
    #[must_use]
    pub fn new() -> Self {
        Self {
            invocation_id: Uuid::new_v4(),
            token: CancellationToken::new(),
        }
    }

    #[must_use]
    pub const fn invocation_id(&self) -> Uuid {
        self.invocation_id
    }

    /// Token handed to the process adapter.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Default for CancellationHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct Inner {
    sessions: HashMap<String, AgentSession>,
    cancellations: HashMap<String, CancellationHandle>,
    last_completed: Option<String>,
}

/// Session/abort registry owned by the process that executes runs.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    inner: Mutex<Inner>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of a session.
    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<AgentSession> {
        self.lock().sessions.get(session_id).cloned()
    }

    /// Create or refresh a session for a new run and return its snapshot.
    pub fn begin(&self, session_id: &str, options: RunOptions) -> AgentSession {
        let mut inner = self.lock();
        let session = inner
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| AgentSession {
                session_id: session_id.to_string(),
                ..AgentSession::default()
            });
        session.is_streaming = true;
        session.last_status = None;
        session.last_options = options;
        session.clone()
    }

    /// Record the provider thread id; the latest value wins.
    pub fn upsert_thread_id(&self, session_id: &str, thread_id: impl Into<String>) {
        let thread_id = thread_id.into();
        let mut inner = self.lock();
        let session = inner
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| AgentSession {
                session_id: session_id.to_string(),
                ..AgentSession::default()
            });
        if session.external_thread_id.as_deref() != Some(thread_id.as_str()) {
            tracing::debug!(session_id, %thread_id, "Recorded provider thread");
            session.external_thread_id = Some(thread_id);
        }
    }

    pub fn record_status(&self, session_id: &str, status: &str) {
        if let Some(session) = self.lock().sessions.get_mut(session_id) {
            session.last_status = Some(status.to_string());
        }
    }

    /// Register the handle of a starting invocation, returning the one it
    /// replaces.
    pub fn register_cancellation(
        &self,
        session_id: &str,
        handle: CancellationHandle,
    ) -> Option<CancellationHandle> {
        self.lock()
            .cancellations
            .insert(session_id.to_string(), handle)
    }

    /// Remove and return the session's handle. A second call returns `None`.
    pub fn take_cancellation(&self, session_id: &str) -> Option<CancellationHandle> {
        let mut inner = self.lock();
        let handle = inner.cancellations.remove(session_id);
        if handle.is_some() {
            if let Some(session) = inner.sessions.get_mut(session_id) {
                session.is_streaming = false;
            }
        }
        handle
    }

    /// Remove the session's handle if it still belongs to `invocation_id`.
    ///
    /// Returns whether anything was removed.
    pub fn release(&self, session_id: &str, invocation_id: Uuid) -> bool {
        let mut inner = self.lock();
        let owned = inner
            .cancellations
            .get(session_id)
            .is_some_and(|handle| handle.invocation_id == invocation_id);
        if owned {
            inner.cancellations.remove(session_id);
            if let Some(session) = inner.sessions.get_mut(session_id) {
                session.is_streaming = false;
            }
        }
        owned
    }

    pub fn mark_completed(&self, session_id: &str) {
        self.lock().last_completed = Some(session_id.to_string());
    }

    /// Most recently completed session, if any.
    #[must_use]
    pub fn last_completed(&self) -> Option<String> {
        self.lock().last_completed.clone()
    }

    /// Number of invocations currently holding a handle.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.lock().cancellations.len()
    }

    /// Cancel every in-flight invocation.
    pub fn cancel_all(&self) {
        let handles: Vec<_> = {
            let mut inner = self.lock();
            for session in inner.sessions.values_mut() {
                session.is_streaming = false;
            }
            inner.cancellations.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.cancel();
        }
    }
}
