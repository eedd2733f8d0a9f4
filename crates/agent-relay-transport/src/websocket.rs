//! Control-channel WebSocket endpoint on the relay host.

use std::sync::Arc;

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::{
    protocol::ControlMessage,
    server::{RelayServer, RemoteConnection},
};

/// WebSocket upgrade handler for `GET /relay`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(server): State<Arc<RelayServer>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, server))
}

async fn handle_socket(socket: WebSocket, server: Arc<RelayServer>) {
    let (mut sender, mut receiver) = socket.split();

    // Frames for the remote handler
    let (tx, mut rx) = mpsc::unbounded_channel::<ControlMessage>();
    let connection = Arc::new(RemoteConnection::new(tx));
    tracing::debug!(connection = %connection.id(), "Control channel opened");

    let writer = Arc::clone(&connection);
    let send_task = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                msg = rx.recv() => msg,
                () = writer.closed() => None,
            };
            let Some(msg) = msg else {
                break;
            };
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize control message: {e}");
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    loop {
        let msg = tokio::select! {
            msg = receiver.next() => msg,
            () = connection.closed() => break,
        };
        let Some(msg) = msg else {
            break;
        };
        let text = match msg {
            Ok(Message::Text(text)) => text.to_string(),
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s,
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!("Control channel error: {e}");
                break;
            }
        };

        let control: ControlMessage = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("Invalid control message: {e}");
                continue;
            }
        };

        match control {
            ControlMessage::RegisterHandler { agent_id } => {
                server
                    .register_remote(&agent_id, Arc::clone(&connection))
                    .await;
            }
            ControlMessage::UnregisterHandler { agent_id } => {
                server.unregister_remote(&agent_id, connection.id()).await;
                break;
            }
            ControlMessage::InvokeHandler { agent_id, .. } => {
                tracing::warn!(agent_id, "Ignoring invocation sent to the relay host");
            }
            reply => {
                if let Some((session_id, agent_id, message)) = reply.into_reply() {
                    connection.deliver(&agent_id, &session_id, message);
                }
            }
        }
    }

    server.drop_connection(&connection).await;
    connection.close();
    let _ = send_task.await;
    tracing::debug!(connection = %connection.id(), "Control channel closed");
}
