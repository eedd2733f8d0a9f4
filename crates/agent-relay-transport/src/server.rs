//! Relay server state: handler registrations, routing and in-flight runs.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use agent_relay_core::{
    AgentMessage, AgentStream, Handler, HandlerError, HandlerMethod, RunOptions,
};
use futures::{StreamExt, stream};
use serde_json::Value;
use tokio::sync::{RwLock, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    dispatch::{dispatch, replay_result},
    protocol::{ControlMessage, HandlerInfo, HandlerLocation, RunPayload},
    stream::InvocationStream,
};

type PendingKey = (String, String);

/// Receiver of the replies to one forwarded invocation.
#[derive(Debug)]
struct Waiter {
    invocation_id: Uuid,
    tx: mpsc::UnboundedSender<AgentMessage>,
}

/// One control-channel connection from a remote handler process.
///
/// Replies carry only `(agent_id, session_id)`, so at most one invocation
/// per pair waits for replies at a time.
#[derive(Debug)]
pub struct RemoteConnection {
    id: Uuid,
    outbound: mpsc::UnboundedSender<ControlMessage>,
    pending: Mutex<HashMap<PendingKey, Waiter>>,
    closed: CancellationToken,
}

impl RemoteConnection {
    /// Connection whose outgoing frames are written from `outbound`.
    #[must_use]
    pub fn new(outbound: mpsc::UnboundedSender<ControlMessage>) -> Self {
        Self {
            id: Uuid::new_v4(),
            outbound,
            pending: Mutex::new(HashMap::new()),
            closed: CancellationToken::new(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<PendingKey, Waiter>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a frame for the remote.
    ///
    /// # Errors
    /// Returns `Disconnected` once the socket writer is gone.
    pub fn send(&self, agent_id: &str, message: ControlMessage) -> Result<(), HandlerError> {
        if self.closed.is_cancelled() {
            return Err(HandlerError::Disconnected(agent_id.to_string()));
        }
        self.outbound
            .send(message)
            .map_err(|_| HandlerError::Disconnected(agent_id.to_string()))
    }

    /// Expect replies for `(agent_id, session_id)` on behalf of
    /// `invocation_id`.
    ///
    /// With `replace`, an earlier waiter for the pair is dropped, which ends
    /// its stream. Without it, an occupied pair yields `None`.
    fn expect_replies(
        &self,
        agent_id: &str,
        session_id: &str,
        invocation_id: Uuid,
        replace: bool,
    ) -> Option<mpsc::UnboundedReceiver<AgentMessage>> {
        let key = (agent_id.to_string(), session_id.to_string());
        let mut pending = self.pending();
        if !replace && pending.contains_key(&key) {
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        pending.insert(key, Waiter { invocation_id, tx });
        Some(rx)
    }

    /// Drop whatever waits on `(agent_id, session_id)`.
    fn discard(&self, agent_id: &str, session_id: &str) {
        self.pending()
            .remove(&(agent_id.to_string(), session_id.to_string()));
    }

    /// Drop the waiter of `invocation_id`. Returns `false` when the pair
    /// already belongs to another invocation or nothing waits on it.
    fn release(&self, agent_id: &str, session_id: &str, invocation_id: Uuid) -> bool {
        let key = (agent_id.to_string(), session_id.to_string());
        let mut pending = self.pending();
        let owned = pending
            .get(&key)
            .is_some_and(|waiter| waiter.invocation_id == invocation_id);
        if owned {
            pending.remove(&key);
        }
        owned
    }

    /// Route a reply frame to its waiting invocation.
    pub fn deliver(&self, agent_id: &str, session_id: &str, message: AgentMessage) {
        let key = (agent_id.to_string(), session_id.to_string());
        let mut pending = self.pending();
        let terminal = message.is_terminal();
        let Some(waiter) = pending.get(&key) else {
            tracing::debug!(agent_id, session_id, "Reply for unknown invocation");
            return;
        };
        if waiter.tx.send(message).is_err() || terminal {
            pending.remove(&key);
        }
    }

    /// End every waiting invocation with a disconnect error.
    pub fn fail_all(&self) {
        for ((agent_id, _), waiter) in self.pending().drain() {
            let _ = waiter.tx.send(AgentMessage::error(
                HandlerError::Disconnected(agent_id).to_string(),
            ));
        }
    }

    /// Ask the socket task to close the connection.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Resolves once the connection is closing.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }
}

struct ActiveRun {
    agent_id: String,
    invocation_id: Uuid,
    stop: CancellationToken,
}

/// Runs started through [`RelayServer::run`].
#[derive(Default)]
struct RunTable {
    active: HashMap<String, ActiveRun>,
    /// Agent that last completed each session.
    completed: HashMap<String, String>,
    last_completed: Option<String>,
}

impl RunTable {
    /// Remove the session's entry if it still belongs to `invocation_id`.
    fn finish(&mut self, session_id: &str, invocation_id: Uuid) {
        if self
            .active
            .get(session_id)
            .is_some_and(|run| run.invocation_id == invocation_id)
        {
            self.active.remove(session_id);
        }
    }

    /// Agent that should handle an undo/redo addressed only by session.
    fn owner(&self, session_id: &str) -> Option<String> {
        self.active
            .get(session_id)
            .map(|run| run.agent_id.clone())
            .or_else(|| self.completed.get(session_id).cloned())
    }
}

fn lock_runs(runs: &Mutex<RunTable>) -> MutexGuard<'_, RunTable> {
    runs.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Keeps the run table current for one streamed run. Dropping it releases
/// the run's entry.
struct RunGuard {
    runs: Arc<Mutex<RunTable>>,
    agent_id: String,
    session_id: String,
    invocation_id: Uuid,
}

impl RunGuard {
    fn observe(&self, message: &AgentMessage) {
        if !message.is_terminal() {
            return;
        }
        let mut runs = lock_runs(&self.runs);
        runs.finish(&self.session_id, self.invocation_id);
        if *message == AgentMessage::Done {
            runs.completed
                .insert(self.session_id.clone(), self.agent_id.clone());
            runs.last_completed = Some(self.session_id.clone());
        }
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        lock_runs(&self.runs).finish(&self.session_id, self.invocation_id);
    }
}

/// Host-side relay state.
///
/// Owns the handler registrations (in-process and remote) and routes every
/// invocation to the right one.
pub struct RelayServer {
    provider: String,
    local: RwLock<HashMap<String, Arc<dyn Handler>>>,
    remote: RwLock<HashMap<String, Arc<RemoteConnection>>>,
    runs: Arc<Mutex<RunTable>>,
    shutdown: CancellationToken,
}

impl RelayServer {
    /// Server whose default agent is `provider`.
    #[must_use]
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            local: RwLock::new(HashMap::new()),
            remote: RwLock::new(HashMap::new()),
            runs: Arc::new(Mutex::new(RunTable::default())),
            shutdown: CancellationToken::new(),
        }
    }

    /// Agent id of the host's own provider.
    #[must_use]
    pub fn provider(&self) -> &str {
        &self.provider
    }

    fn runs(&self) -> MutexGuard<'_, RunTable> {
        lock_runs(&self.runs)
    }

    /// Token cancelled when the server shuts down.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn register_handler(&self, handler: Arc<dyn Handler>) {
        let agent_id = handler.agent_id().to_string();
        tracing::info!(agent_id, "Registered local handler");
        self.local.write().await.insert(agent_id, handler);
    }

    pub async fn unregister_handler(&self, agent_id: &str) -> Option<Arc<dyn Handler>> {
        let removed = self.local.write().await.remove(agent_id);
        if removed.is_some() {
            tracing::info!(agent_id, "Unregistered local handler");
        }
        removed
    }

    /// Route `agent_id` to a remote connection, replacing any earlier route.
    pub async fn register_remote(&self, agent_id: &str, connection: Arc<RemoteConnection>) {
        let previous = self
            .remote
            .write()
            .await
            .insert(agent_id.to_string(), Arc::clone(&connection));
        if let Some(previous) = previous.filter(|p| p.id != connection.id) {
            tracing::warn!(
                agent_id,
                old = %previous.id,
                new = %connection.id,
                "Remote handler re-registered on a new connection"
            );
        } else {
            tracing::info!(agent_id, connection = %connection.id, "Registered remote handler");
        }
    }

    /// Drop the route for `agent_id` if it belongs to `connection_id`.
    pub async fn unregister_remote(&self, agent_id: &str, connection_id: Uuid) -> bool {
        let mut remote = self.remote.write().await;
        if remote.get(agent_id).is_some_and(|c| c.id == connection_id) {
            remote.remove(agent_id);
            tracing::info!(agent_id, connection = %connection_id, "Unregistered remote handler");
            true
        } else {
            false
        }
    }

    /// Forget a closed connection: remove its routes and fail its
    /// in-flight invocations.
    pub async fn drop_connection(&self, connection: &RemoteConnection) {
        let removed: Vec<String> = {
            let mut remote = self.remote.write().await;
            let ids: Vec<String> = remote
                .iter()
                .filter(|(_, c)| c.id == connection.id)
                .map(|(agent_id, _)| agent_id.clone())
                .collect();
            for agent_id in &ids {
                remote.remove(agent_id);
            }
            ids
        };
        if !removed.is_empty() {
            tracing::info!(
                connection = %connection.id,
                agents = ?removed,
                "Remote handler disconnected"
            );
        }
        connection.fail_all();
    }

    /// Registered agent ids with their location, sorted by id.
    pub async fn handlers(&self) -> Vec<HandlerInfo> {
        let mut handlers: Vec<HandlerInfo> = self
            .local
            .read()
            .await
            .keys()
            .map(|agent_id| HandlerInfo {
                agent_id: agent_id.clone(),
                location: HandlerLocation::Local,
            })
            .collect();
        {
            let remote = self.remote.read().await;
            let local: Vec<String> = handlers.iter().map(|h| h.agent_id.clone()).collect();
            handlers.extend(
                remote
                    .keys()
                    .filter(|agent_id| !local.contains(agent_id))
                    .map(|agent_id| HandlerInfo {
                        agent_id: agent_id.clone(),
                        location: HandlerLocation::Remote,
                    }),
            );
        }
        handlers.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        handlers
    }

    /// Invoke `method` on whichever handler owns `agent_id`.
    ///
    /// In-process handlers win over remote routes.
    ///
    /// # Errors
    /// `NotFound` when nothing is registered for `agent_id`, `Disconnected`
    /// when the remote connection is already gone, `Busy` for an undo/redo
    /// on a session whose remote run is still streaming.
    pub async fn invoke(
        &self,
        agent_id: &str,
        method: HandlerMethod,
        session_id: &str,
        payload: Value,
    ) -> Result<AgentStream, HandlerError> {
        self.invoke_as(Uuid::new_v4(), agent_id, method, session_id, payload)
            .await
    }

    async fn invoke_as(
        &self,
        invocation_id: Uuid,
        agent_id: &str,
        method: HandlerMethod,
        session_id: &str,
        payload: Value,
    ) -> Result<AgentStream, HandlerError> {
        let local = self.local.read().await.get(agent_id).cloned();
        if let Some(handler) = local {
            tracing::debug!(agent_id, session_id, %method, "Invoking local handler");
            let stream = dispatch(handler, method, session_id, payload).await?;
            return Ok(InvocationStream::new(stream).boxed());
        }

        let route = self.remote.read().await.get(agent_id).cloned();
        let Some(connection) = route else {
            return Err(HandlerError::NotFound(agent_id.to_string()));
        };
        tracing::debug!(
            agent_id,
            session_id,
            %method,
            connection = %connection.id,
            "Invoking remote handler"
        );

        let invoke = ControlMessage::InvokeHandler {
            agent_id: agent_id.to_string(),
            method,
            session_id: session_id.to_string(),
            payload,
        };
        if method == HandlerMethod::Abort {
            connection.discard(agent_id, session_id);
            connection.send(agent_id, invoke)?;
            return Ok(stream::empty().boxed());
        }

        // A new run supersedes the session's previous one; undo/redo must
        // not take over the replies of a run.
        let replace = method == HandlerMethod::Run;
        let replies = connection
            .expect_replies(agent_id, session_id, invocation_id, replace)
            .ok_or_else(|| HandlerError::Busy(session_id.to_string()))?;
        if let Err(err) = connection.send(agent_id, invoke) {
            connection.release(agent_id, session_id, invocation_id);
            return Err(err);
        }

        let stream = InvocationStream::new(UnboundedReceiverStream::new(replies).boxed());
        if method != HandlerMethod::Run {
            return Ok(stream.boxed());
        }
        let agent_id = agent_id.to_string();
        let session_id = session_id.to_string();
        Ok(stream
            .on_abandon(move || {
                // A superseding run already owns the pair.
                if !connection.release(&agent_id, &session_id, invocation_id) {
                    return;
                }
                let _ = connection.send(
                    &agent_id,
                    ControlMessage::InvokeHandler {
                        agent_id: agent_id.clone(),
                        method: HandlerMethod::Abort,
                        session_id: session_id.clone(),
                        payload: Value::Null,
                    },
                );
            })
            .boxed())
    }

    /// Start a run for an external caller.
    ///
    /// Never fails: routing errors become a single `Error` message. The
    /// stream stops as soon as the session is aborted.
    pub async fn run(
        &self,
        agent_id: &str,
        session_id: &str,
        prompt: String,
        options: RunOptions,
    ) -> AgentStream {
        let stop = self.shutdown.child_token();
        let invocation_id = Uuid::new_v4();
        let previous = self.runs().active.insert(
            session_id.to_string(),
            ActiveRun {
                agent_id: agent_id.to_string(),
                invocation_id,
                stop: stop.clone(),
            },
        );
        if let Some(previous) = previous {
            previous.stop.cancel();
        }

        let guard = RunGuard {
            runs: Arc::clone(&self.runs),
            agent_id: agent_id.to_string(),
            session_id: session_id.to_string(),
            invocation_id,
        };
        let payload = serde_json::to_value(RunPayload { prompt, options }).unwrap_or_default();
        match self
            .invoke_as(invocation_id, agent_id, HandlerMethod::Run, session_id, payload)
            .await
        {
            Ok(stream) => stream
                .take_until(stop.cancelled_owned())
                .inspect(move |message| guard.observe(message))
                .boxed(),
            Err(err) => {
                tracing::warn!(agent_id, session_id, error = %err, "Run could not be routed");
                drop(guard);
                stream::once(async move { AgentMessage::error(err.to_string()) }).boxed()
            }
        }
    }

    /// Abort whatever runs for `session_id`. Unknown sessions are ignored.
    pub async fn abort(&self, session_id: &str) {
        let run = self.runs().active.remove(session_id);
        let agent_id = match run {
            Some(run) => {
                run.stop.cancel();
                run.agent_id
            }
            None => self.provider.clone(),
        };
        tracing::info!(agent_id, session_id, "Abort requested");
        if let Err(err) = self
            .invoke(&agent_id, HandlerMethod::Abort, session_id, Value::Null)
            .await
        {
            tracing::debug!(agent_id, session_id, error = %err, "Abort not delivered");
        }
    }

    /// Undo the last change of a session.
    ///
    /// Without `agent_id` the agent that ran the session answers; without
    /// either, the most recently completed run is undone.
    ///
    /// # Errors
    /// Returns the handler's error, or a routing error.
    pub async fn undo(
        &self,
        agent_id: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<(), HandlerError> {
        self.replay(HandlerMethod::Undo, agent_id, session_id).await
    }

    /// Redo the last undone change. Routed like [`RelayServer::undo`].
    ///
    /// # Errors
    /// Returns the handler's error, or a routing error.
    pub async fn redo(
        &self,
        agent_id: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<(), HandlerError> {
        self.replay(HandlerMethod::Redo, agent_id, session_id).await
    }

    /// Pick the agent and session an undo/redo is addressed to.
    fn replay_target(&self, agent_id: Option<&str>, session_id: Option<&str>) -> (String, String) {
        let session_id = session_id.filter(|id| !id.is_empty());
        let runs = self.runs();
        match (agent_id, session_id) {
            (Some(agent_id), session_id) => {
                (agent_id.to_string(), session_id.unwrap_or_default().to_string())
            }
            (None, Some(session_id)) => (
                runs.owner(session_id)
                    .unwrap_or_else(|| self.provider.clone()),
                session_id.to_string(),
            ),
            (None, None) => runs
                .last_completed
                .as_ref()
                .and_then(|session_id| {
                    runs.completed
                        .get(session_id)
                        .map(|agent_id| (agent_id.clone(), session_id.clone()))
                })
                .unwrap_or_else(|| (self.provider.clone(), String::new())),
        }
    }

    async fn replay(
        &self,
        method: HandlerMethod,
        agent_id: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<(), HandlerError> {
        let (agent_id, session_id) = self.replay_target(agent_id, session_id);
        let stream = self
            .invoke(&agent_id, method, &session_id, Value::Null)
            .await?;
        replay_result(stream).await
    }

    /// Stop everything: in-flight runs, local handlers and control channels.
    pub async fn shutdown(&self) {
        tracing::info!("Relay server shutting down");
        self.shutdown.cancel();
        self.runs().active.clear();

        let handlers: Vec<_> = self.local.read().await.values().cloned().collect();
        for handler in handlers {
            handler.shutdown().await;
        }

        let connections: Vec<_> = self.remote.write().await.drain().map(|(_, c)| c).collect();
        for connection in connections {
            connection.fail_all();
            connection.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use agent_relay_core::{RunRequest, THINKING_STATUS};
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;

    /// Echoes the prompt back and records aborts.
    #[derive(Default)]
    struct EchoHandler {
        aborted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Handler for EchoHandler {
        fn agent_id(&self) -> &str {
            "echo"
        }

        async fn run(&self, request: RunRequest) -> AgentStream {
            stream::iter([
                AgentMessage::Status(request.prompt),
                AgentMessage::Done,
                AgentMessage::status("after done"),
            ])
            .boxed()
        }

        async fn abort(&self, session_id: &str) {
            self.aborted
                .lock()
                .unwrap()
                .push(session_id.to_string());
        }

        async fn undo(&self, session_id: Option<&str>) -> Result<(), HandlerError> {
            session_id
                .map(|_| ())
                .ok_or(HandlerError::NoSession(HandlerMethod::Undo))
        }

        async fn redo(&self, _session_id: Option<&str>) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    fn payload(prompt: &str) -> Value {
        json!({"prompt": prompt, "options": {}})
    }

    #[tokio::test]
    async fn local_invocations_stop_at_terminal() {
        let server = RelayServer::new("echo");
        server.register_handler(Arc::new(EchoHandler::default())).await;

        let messages: Vec<_> = server
            .invoke("echo", HandlerMethod::Run, "s1", payload("hi"))
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(messages, vec![AgentMessage::status("hi"), AgentMessage::Done]);
    }

    #[tokio::test]
    async fn unknown_agent_is_not_found() {
        let server = RelayServer::new("echo");
        let err = server
            .invoke("ghost", HandlerMethod::Run, "s1", payload("hi"))
            .await
            .err();
        assert_eq!(err, Some(HandlerError::NotFound("ghost".into())));

        let messages: Vec<_> = server
            .run("ghost", "s1", "hi".into(), RunOptions::default())
            .await
            .collect()
            .await;
        assert_eq!(messages, vec![AgentMessage::error("handler not found: ghost")]);
    }

    #[tokio::test]
    async fn register_invoke_unregister() {
        let server = RelayServer::new("echo");
        server.register_handler(Arc::new(EchoHandler::default())).await;
        assert_eq!(server.handlers().await.len(), 1);

        assert!(server.unregister_handler("echo").await.is_some());
        assert!(server.handlers().await.is_empty());
        assert!(matches!(
            server.invoke("echo", HandlerMethod::Run, "s1", payload("hi")).await,
            Err(HandlerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn remote_replies_are_restreamed_in_order() {
        let server = RelayServer::new("host");
        let (tx, mut outbound) = mpsc::unbounded_channel();
        let connection = Arc::new(RemoteConnection::new(tx));
        server.register_remote("codex", Arc::clone(&connection)).await;

        let mut stream = server
            .invoke("codex", HandlerMethod::Run, "s1", payload("go"))
            .await
            .unwrap();
        assert!(matches!(
            outbound.recv().await,
            Some(ControlMessage::InvokeHandler { method: HandlerMethod::Run, .. })
        ));

        connection.deliver("codex", "s1", AgentMessage::status("one"));
        connection.deliver("codex", "s1", AgentMessage::status("two"));
        connection.deliver("codex", "s1", AgentMessage::Done);
        connection.deliver("codex", "s1", AgentMessage::status("stray"));

        assert_eq!(stream.next().await, Some(AgentMessage::status("one")));
        assert_eq!(stream.next().await, Some(AgentMessage::status("two")));
        assert_eq!(stream.next().await, Some(AgentMessage::Done));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn disconnect_fails_in_flight_invocations() {
        let server = RelayServer::new("host");
        let (tx, _outbound) = mpsc::unbounded_channel();
        let connection = Arc::new(RemoteConnection::new(tx));
        server.register_remote("amp", Arc::clone(&connection)).await;

        let mut stream = server
            .invoke("amp", HandlerMethod::Run, "s1", payload("go"))
            .await
            .unwrap();
        server.drop_connection(&connection).await;

        assert_eq!(
            stream.next().await,
            Some(AgentMessage::error("handler disconnected: amp"))
        );
        assert_eq!(stream.next().await, None);
        assert!(server.handlers().await.is_empty());
    }

    #[tokio::test]
    async fn dropping_a_remote_run_sends_abort() {
        let server = RelayServer::new("host");
        let (tx, mut outbound) = mpsc::unbounded_channel();
        let connection = Arc::new(RemoteConnection::new(tx));
        server.register_remote("amp", Arc::clone(&connection)).await;

        let stream = server
            .invoke("amp", HandlerMethod::Run, "s1", payload("go"))
            .await
            .unwrap();
        let _ = outbound.recv().await;
        drop(stream);

        assert!(matches!(
            outbound.recv().await,
            Some(ControlMessage::InvokeHandler {
                method: HandlerMethod::Abort,
                ref session_id,
                ..
            }) if session_id == "s1"
        ));
    }

    fn remote(provider: &str) -> (RelayServer, Arc<RemoteConnection>, Outbound) {
        let (tx, outbound) = mpsc::unbounded_channel();
        (
            RelayServer::new(provider),
            Arc::new(RemoteConnection::new(tx)),
            outbound,
        )
    }

    type Outbound = mpsc::UnboundedReceiver<ControlMessage>;

    fn sent_methods(outbound: &mut Outbound) -> Vec<(HandlerMethod, String)> {
        let mut sent = Vec::new();
        while let Ok(ControlMessage::InvokeHandler {
            method, session_id, ..
        }) = outbound.try_recv()
        {
            sent.push((method, session_id));
        }
        sent
    }

    #[tokio::test]
    async fn second_remote_run_supersedes_the_first() {
        let (server, connection, mut outbound) = remote("host");
        server.register_remote("codex", Arc::clone(&connection)).await;

        let first = server
            .run("codex", "s1", "first".into(), RunOptions::default())
            .await;
        let mut second = server
            .run("codex", "s1", "second".into(), RunOptions::default())
            .await;
        drop(first);

        connection.deliver("codex", "s1", AgentMessage::status("second working"));
        connection.deliver("codex", "s1", AgentMessage::Done);
        assert_eq!(
            second.next().await,
            Some(AgentMessage::status("second working"))
        );
        assert_eq!(second.next().await, Some(AgentMessage::Done));
        assert_eq!(second.next().await, None);

        // No abort reaches the remote for the superseded run.
        assert_eq!(
            sent_methods(&mut outbound),
            vec![
                (HandlerMethod::Run, "s1".to_string()),
                (HandlerMethod::Run, "s1".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn undo_cannot_take_over_a_streaming_remote_run() {
        let (server, connection, mut outbound) = remote("host");
        server.register_remote("codex", Arc::clone(&connection)).await;

        let mut run = server
            .run("codex", "s1", "go".into(), RunOptions::default())
            .await;
        assert_eq!(
            server.undo(None, Some("s1")).await,
            Err(HandlerError::Busy("s1".into()))
        );

        connection.deliver("codex", "s1", AgentMessage::Done);
        assert_eq!(run.next().await, Some(AgentMessage::Done));
        assert_eq!(
            sent_methods(&mut outbound),
            vec![(HandlerMethod::Run, "s1".to_string())]
        );
    }

    #[tokio::test]
    async fn bare_undo_follows_the_last_remote_completion() {
        let (server, connection, mut outbound) = remote("host");
        server.register_remote("codex", Arc::clone(&connection)).await;

        let mut run = server
            .run("codex", "s1", "go".into(), RunOptions::default())
            .await;
        connection.deliver("codex", "s1", AgentMessage::Done);
        assert_eq!(run.next().await, Some(AgentMessage::Done));
        let _ = outbound.recv().await;

        let (result, ()) = tokio::join!(server.undo(None, None), async {
            match outbound.recv().await {
                Some(ControlMessage::InvokeHandler {
                    agent_id,
                    method,
                    session_id,
                    ..
                }) => {
                    assert_eq!(agent_id, "codex");
                    assert_eq!(method, HandlerMethod::Undo);
                    assert_eq!(session_id, "s1");
                }
                other => panic!("expected a forwarded undo, got {other:?}"),
            }
            connection.deliver("codex", "s1", AgentMessage::Done);
        });
        assert_eq!(result, Ok(()));
    }

    #[tokio::test]
    async fn finished_runs_leave_no_active_entry() {
        let server = RelayServer::new("echo");
        server.register_handler(Arc::new(EchoHandler::default())).await;

        let messages: Vec<_> = server
            .run("echo", "s1", "hi".into(), RunOptions::default())
            .await
            .collect()
            .await;
        assert_eq!(messages, vec![AgentMessage::status("hi"), AgentMessage::Done]);
        {
            let runs = server.runs();
            assert!(runs.active.is_empty());
            assert_eq!(runs.completed.get("s1").map(String::as_str), Some("echo"));
            assert_eq!(runs.last_completed.as_deref(), Some("s1"));
        }

        let (tx, _outbound) = mpsc::unbounded_channel();
        server
            .register_remote("amp", Arc::new(RemoteConnection::new(tx)))
            .await;
        let abandoned = server
            .run("amp", "s2", "go".into(), RunOptions::default())
            .await;
        assert_eq!(server.runs().active.len(), 1);
        drop(abandoned);
        assert!(server.runs().active.is_empty());
        assert_eq!(server.runs().last_completed.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn abort_stops_stream_and_reaches_handler() {
        let server = RelayServer::new("host");
        let (tx, _outbound) = mpsc::unbounded_channel();
        let connection = Arc::new(RemoteConnection::new(tx));
        server.register_remote("codex", Arc::clone(&connection)).await;

        let mut stream = server
            .run("codex", "s1", "go".into(), RunOptions::default())
            .await;
        connection.deliver("codex", "s1", AgentMessage::status(THINKING_STATUS));
        assert_eq!(stream.next().await, Some(AgentMessage::status(THINKING_STATUS)));

        server.abort("s1").await;
        connection.deliver("codex", "s1", AgentMessage::Done);
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn abort_of_idle_session_goes_to_default_provider() {
        let server = RelayServer::new("echo");
        let handler = Arc::new(EchoHandler::default());
        server.register_handler(Arc::clone(&handler) as Arc<dyn Handler>).await;

        server.abort("idle").await;
        assert_eq!(*handler.aborted.lock().unwrap(), vec!["idle".to_string()]);
    }

    #[tokio::test]
    async fn undo_results_map_to_errors() {
        let server = RelayServer::new("echo");
        server.register_handler(Arc::new(EchoHandler::default())).await;

        assert_eq!(server.undo(None, Some("s1")).await, Ok(()));
        assert_eq!(
            server.undo(None, None).await,
            Err(HandlerError::Failed("no completed session to undo".into()))
        );
        assert_eq!(
            server.redo(Some("ghost"), None).await,
            Err(HandlerError::NotFound("ghost".into()))
        );
    }

    #[tokio::test]
    async fn local_handlers_take_precedence_and_list_once() {
        let server = RelayServer::new("echo");
        server.register_handler(Arc::new(EchoHandler::default())).await;
        let (tx, _outbound) = mpsc::unbounded_channel();
        server
            .register_remote("echo", Arc::new(RemoteConnection::new(tx)))
            .await;

        assert_eq!(
            server.handlers().await,
            vec![HandlerInfo {
                agent_id: "echo".into(),
                location: HandlerLocation::Local,
            }]
        );
    }
}
