//! Remote side of the control channel.
//!
//! A process that lost host election registers its handler with the relay
//! host over `/relay` and executes the invocations the host forwards.

use std::{sync::Arc, time::Duration};

use agent_relay_core::{Handler, HandlerMethod};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

use crate::{connection::ConnectionError, dispatch::dispatch, protocol::ControlMessage};

const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Handler registered with a relay host over the control channel.
pub struct RemoteHandlerClient {
    agent_id: String,
    handler: Arc<dyn Handler>,
    outbound: mpsc::UnboundedSender<ControlMessage>,
    closing: CancellationToken,
    closed: CancellationToken,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteHandlerClient {
    /// Open the control channel at `url` and register `handler`.
    ///
    /// # Errors
    /// Returns an error if the WebSocket handshake fails.
    pub async fn connect(url: &str, handler: Arc<dyn Handler>) -> Result<Self, ConnectionError> {
        let (socket, _) = connect_async(url)
            .await
            .map_err(|err| ConnectionError::Channel(err.to_string()))?;
        let (mut sink, mut source) = socket.split();

        let agent_id = handler.agent_id().to_string();
        let (outbound, mut rx) = mpsc::unbounded_channel::<ControlMessage>();
        let closing = CancellationToken::new();
        let closed = CancellationToken::new();

        let writer_closing = closing.clone();
        let writer = tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    biased;
                    msg = rx.recv() => msg,
                    () = writer_closing.cancelled() => {
                        // Flush what is already queued, then close.
                        while let Ok(msg) = rx.try_recv() {
                            if !send_frame(&mut sink, &msg).await {
                                break;
                            }
                        }
                        None
                    }
                };
                let Some(msg) = msg else {
                    break;
                };
                if !send_frame(&mut sink, &msg).await {
                    break;
                }
            }
            let _ = sink.send(Message::Close(None)).await;
        });

        let _ = outbound.send(ControlMessage::RegisterHandler {
            agent_id: agent_id.clone(),
        });
        tracing::info!(%agent_id, url, "Registered with relay host");

        let reader_handler = Arc::clone(&handler);
        let reader_outbound = outbound.clone();
        let reader_closed = closed.clone();
        let reader_agent = agent_id.clone();
        tokio::spawn(async move {
            while let Some(msg) = source.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text.as_str().to_string(),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::warn!("Control channel error: {e}");
                        break;
                    }
                };
                match serde_json::from_str::<ControlMessage>(&text) {
                    Ok(ControlMessage::InvokeHandler {
                        agent_id,
                        method,
                        session_id,
                        payload,
                    }) if agent_id == reader_agent => {
                        tokio::spawn(execute(
                            Arc::clone(&reader_handler),
                            reader_outbound.clone(),
                            method,
                            session_id,
                            payload,
                        ));
                    }
                    Ok(other) => tracing::debug!(?other, "Ignoring control message"),
                    Err(e) => tracing::warn!("Invalid control message: {e}"),
                }
            }
            tracing::info!(agent_id = %reader_agent, "Control channel to relay host closed");
            reader_handler.shutdown().await;
            reader_closed.cancel();
        });

        Ok(Self {
            agent_id,
            handler,
            outbound,
            closing,
            closed,
            writer: Mutex::new(Some(writer)),
        })
    }

    #[must_use]
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Resolves when the host closes the channel.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Unregister from the host, close the channel and abort local runs.
    pub async fn shutdown(&self) {
        let _ = self.outbound.send(ControlMessage::UnregisterHandler {
            agent_id: self.agent_id.clone(),
        });
        self.closing.cancel();
        if let Some(writer) = self.writer.lock().await.take() {
            if tokio::time::timeout(FLUSH_TIMEOUT, writer).await.is_err() {
                tracing::debug!(agent_id = %self.agent_id, "Control channel did not flush in time");
            }
        }
        self.handler.shutdown().await;
    }
}

/// Write one frame. Returns `false` once the socket is unusable.
async fn send_frame<S>(sink: &mut S, msg: &ControlMessage) -> bool
where
    S: futures::Sink<Message> + Unpin,
{
    let json = match serde_json::to_string(msg) {
        Ok(j) => j,
        Err(e) => {
            tracing::error!("Failed to serialize control message: {e}");
            return true;
        }
    };
    sink.send(Message::Text(json.into())).await.is_ok()
}

/// Run one forwarded invocation and stream its replies back to the host.
async fn execute(
    handler: Arc<dyn Handler>,
    outbound: mpsc::UnboundedSender<ControlMessage>,
    method: HandlerMethod,
    session_id: String,
    payload: Value,
) {
    let agent_id = handler.agent_id().to_string();
    tracing::debug!(%agent_id, %session_id, %method, "Executing forwarded invocation");
    let mut stream = match dispatch(Arc::clone(&handler), method, &session_id, payload).await {
        Ok(stream) => stream,
        Err(err) => {
            let _ = outbound.send(ControlMessage::reply(
                &session_id,
                &agent_id,
                agent_relay_core::AgentMessage::error(err.to_string()),
            ));
            return;
        }
    };
    while let Some(message) = stream.next().await {
        let terminal = message.is_terminal();
        if outbound
            .send(ControlMessage::reply(&session_id, &agent_id, message))
            .is_err()
        {
            break;
        }
        if terminal {
            break;
        }
    }
}
