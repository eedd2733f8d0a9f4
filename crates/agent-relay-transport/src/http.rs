//! HTTP surface of the relay host.

use std::{convert::Infallible, sync::Arc, time::Duration};

use agent_relay_core::{AgentMessage, THINKING_STATUS, compose_prompt};
use axum::{
    Json, Router,
    extract::{Path, State},
    response::{
        IntoResponse, Sse,
        sse::{Event, KeepAlive},
    },
    routing::{get, post},
};
use futures::{StreamExt, stream};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::Level;
use uuid::Uuid;

use crate::{
    protocol::{AgentRequest, HandlersResponse, HealthResponse, ReplayRequest, StatusResponse},
    server::RelayServer,
    websocket::ws_handler,
};

/// Router for every host endpoint, including the control channel.
pub fn build_router(server: Arc<RelayServer>) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::DEBUG));

    Router::new()
        .route("/agent", post(post_agent))
        .route("/abort/{session_id}", post(post_abort))
        .route("/undo", post(post_undo))
        .route("/redo", post(post_redo))
        .route("/health", get(get_health))
        .route("/handlers", get(get_handlers))
        .route("/relay", get(ws_handler))
        .layer(trace_layer)
        .layer(CorsLayer::permissive())
        .with_state(server)
}

/// SSE event for one message. SSE data may not contain `\r`.
fn sse_event(message: &AgentMessage) -> Event {
    let data = message.content().replace("\r\n", "\n").replace('\r', "\n");
    Event::default().event(message.event_name()).data(data)
}

async fn post_agent(
    State(server): State<Arc<RelayServer>>,
    Json(request): Json<AgentRequest>,
) -> impl IntoResponse {
    let AgentRequest {
        content,
        prompt,
        options,
        session_id,
        agent_id,
    } = request;
    let agent_id = agent_id.unwrap_or_else(|| server.provider().to_string());
    let session_id = session_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    tracing::info!(%agent_id, %session_id, "Agent request received");

    let messages = server
        .run(&agent_id, &session_id, compose_prompt(&prompt, &content), options)
        .await;
    let events = stream::once(async { AgentMessage::status(THINKING_STATUS) })
        .chain(messages)
        .map(|message| Ok::<_, Infallible>(sse_event(&message)));

    Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

async fn post_abort(
    State(server): State<Arc<RelayServer>>,
    Path(session_id): Path<String>,
) -> Json<StatusResponse> {
    server.abort(&session_id).await;
    Json(StatusResponse::ok())
}

/// Undo/redo bodies are optional.
fn replay_request(body: Option<Json<ReplayRequest>>) -> ReplayRequest {
    body.map(|Json(request)| request).unwrap_or_default()
}

fn replay_response(result: Result<(), agent_relay_core::HandlerError>) -> Json<StatusResponse> {
    Json(match result {
        Ok(()) => StatusResponse::ok(),
        Err(err) => StatusResponse::error(err.to_string()),
    })
}

async fn post_undo(
    State(server): State<Arc<RelayServer>>,
    body: Option<Json<ReplayRequest>>,
) -> Json<StatusResponse> {
    let request = replay_request(body);
    replay_response(
        server
            .undo(request.agent_id.as_deref(), request.session_id.as_deref())
            .await,
    )
}

async fn post_redo(
    State(server): State<Arc<RelayServer>>,
    body: Option<Json<ReplayRequest>>,
) -> Json<StatusResponse> {
    let request = replay_request(body);
    replay_response(
        server
            .redo(request.agent_id.as_deref(), request.session_id.as_deref())
            .await,
    )
}

async fn get_health(State(server): State<Arc<RelayServer>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        provider: server.provider().to_string(),
    })
}

async fn get_handlers(State(server): State<Arc<RelayServer>>) -> Json<HandlersResponse> {
    Json(HandlersResponse {
        handlers: server.handlers().await,
    })
}
