//! End-to-end relay tests on loopback ports.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use agent_relay_core::{AgentMessage, AgentStream, Handler, HandlerError, RunRequest};
use agent_relay_transport::{ConnectionError, RelayConfig, RelayConnection, RelayRole, connect};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// Echoes `<agent>: <prompt>` and finishes, unless the prompt contains
/// "wait", in which case it blocks until aborted.
struct MockHandler {
    agent_id: &'static str,
    runs: Mutex<HashMap<String, CancellationToken>>,
}

impl MockHandler {
    fn new(agent_id: &'static str) -> Arc<Self> {
        Arc::new(Self {
            agent_id,
            runs: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl Handler for MockHandler {
    fn agent_id(&self) -> &str {
        self.agent_id
    }

    async fn run(&self, request: RunRequest) -> AgentStream {
        let token = CancellationToken::new();
        self.runs
            .lock()
            .unwrap()
            .insert(request.session_id.clone(), token.clone());

        let (tx, rx) = mpsc::channel(8);
        let agent_id = self.agent_id;
        tokio::spawn(async move {
            let _ = tx
                .send(AgentMessage::status(format!("{agent_id}: {}", request.prompt)))
                .await;
            if request.prompt.contains("wait") {
                tokio::select! {
                    () = token.cancelled() => {}
                    () = tx.closed() => {}
                }
                return;
            }
            let _ = tx.send(AgentMessage::Done).await;
        });
        ReceiverStream::new(rx).boxed()
    }

    async fn abort(&self, session_id: &str) {
        if let Some(token) = self.runs.lock().unwrap().remove(session_id) {
            token.cancel();
        }
    }

    async fn undo(&self, session_id: Option<&str>) -> Result<(), HandlerError> {
        match session_id {
            Some(_) => Ok(()),
            None => Err(HandlerError::NoSession(agent_relay_core::HandlerMethod::Undo)),
        }
    }

    async fn redo(&self, _session_id: Option<&str>) -> Result<(), HandlerError> {
        Ok(())
    }
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn test_config(port: u16) -> RelayConfig {
    RelayConfig {
        probe_timeout: Duration::from_millis(300),
        bind_retries: 2,
        bind_retry_delay: Duration::from_millis(50),
        release_stale_listener: false,
        ..RelayConfig::new("127.0.0.1", port)
    }
}

/// Loopback client that ignores proxy settings from the environment.
fn http() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

async fn handlers(config: &RelayConfig) -> Value {
    http()
        .get(format!("{}/handlers", config.base_url()))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

/// Poll `/handlers` until it reports `expected`.
async fn wait_for_handlers(config: &RelayConfig, expected: Value) {
    for _ in 0..100 {
        if handlers(config).await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("handlers never became {expected}");
}

async fn post_agent(config: &RelayConfig, body: Value) -> reqwest::Response {
    http()
        .post(format!("{}/agent", config.base_url()))
        .json(&body)
        .send()
        .await
        .unwrap()
}

/// Read SSE chunks until `needle` shows up; returns everything read.
async fn read_until(response: &mut reqwest::Response, needle: &str) -> String {
    let mut body = String::new();
    while !body.contains(needle) {
        let chunk = tokio::time::timeout(Duration::from_secs(5), response.chunk())
            .await
            .expect("timed out waiting for SSE data")
            .unwrap()
            .expect("stream ended early");
        body.push_str(&String::from_utf8_lossy(&chunk));
    }
    body
}

/// Read the rest of an SSE body.
async fn read_to_end(response: &mut reqwest::Response) -> String {
    let mut body = String::new();
    loop {
        let chunk = tokio::time::timeout(Duration::from_secs(5), response.chunk())
            .await
            .expect("timed out waiting for SSE end")
            .unwrap();
        match chunk {
            Some(chunk) => body.push_str(&String::from_utf8_lossy(&chunk)),
            None => return body,
        }
    }
}

#[tokio::test]
async fn second_process_on_the_port_becomes_remote() {
    let config = test_config(free_port());

    let host = connect(&config, MockHandler::new("alpha")).await.unwrap();
    assert_eq!(host.role(), RelayRole::Host);

    let remote = connect(&config, MockHandler::new("beta")).await.unwrap();
    assert_eq!(remote.role(), RelayRole::Remote);

    wait_for_handlers(
        &config,
        json!({"handlers": [
            {"agentId": "alpha", "location": "local"},
            {"agentId": "beta", "location": "remote"}
        ]}),
    )
    .await;

    let mut response = post_agent(
        &config,
        json!({"prompt": "hello", "sessionId": "s1", "agentId": "beta"}),
    )
    .await;
    let body = read_to_end(&mut response).await;
    assert!(body.contains("data: Thinking…"));
    assert!(body.contains("data: beta: hello"));
    assert!(body.contains("event: done"));

    // Without agentId the host's own provider answers.
    let mut response = post_agent(&config, json!({"prompt": "hi", "sessionId": "s2"})).await;
    assert!(read_to_end(&mut response).await.contains("data: alpha: hi"));

    remote.shutdown().await;
    wait_for_handlers(
        &config,
        json!({"handlers": [{"agentId": "alpha", "location": "local"}]}),
    )
    .await;

    let mut response = post_agent(
        &config,
        json!({"prompt": "hello", "sessionId": "s3", "agentId": "beta"}),
    )
    .await;
    assert!(
        read_to_end(&mut response)
            .await
            .contains("event: error\ndata: handler not found: beta")
    );

    host.shutdown().await;
}

#[tokio::test]
async fn occupied_port_without_relay_is_a_bind_conflict() {
    // Accepts connections but never speaks HTTP.
    let squatter = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let config = test_config(squatter.local_addr().unwrap().port());

    match connect(&config, MockHandler::new("alpha")).await {
        Err(ConnectionError::BindConflict { port }) => assert_eq!(port, config.port),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("expected a bind conflict"),
    }
}

#[tokio::test]
async fn abort_ends_the_stream_without_done() {
    let config = test_config(free_port());
    let host = connect(&config, MockHandler::new("alpha")).await.unwrap();

    let mut response = post_agent(&config, json!({"prompt": "wait", "sessionId": "s1"})).await;
    read_until(&mut response, "alpha: wait").await;

    let abort: Value = http()
        .post(format!("{}/abort/s1", config.base_url()))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(abort, json!({"status": "ok"}));

    let rest = read_to_end(&mut response).await;
    assert!(!rest.contains("event: done"));
    assert!(!rest.contains("event: status"));

    host.shutdown().await;
}

#[tokio::test]
async fn remote_abort_and_disconnect() {
    let config = test_config(free_port());
    let host = connect(&config, MockHandler::new("alpha")).await.unwrap();
    let remote = connect(&config, MockHandler::new("beta")).await.unwrap();
    wait_for_handlers(
        &config,
        json!({"handlers": [
            {"agentId": "alpha", "location": "local"},
            {"agentId": "beta", "location": "remote"}
        ]}),
    )
    .await;

    // Abort across the control channel.
    let mut response = post_agent(
        &config,
        json!({"prompt": "wait", "sessionId": "s1", "agentId": "beta"}),
    )
    .await;
    read_until(&mut response, "beta: wait").await;
    http()
        .post(format!("{}/abort/s1", config.base_url()))
        .send()
        .await
        .unwrap();
    assert!(!read_to_end(&mut response).await.contains("event: done"));

    // The remote going away fails what it was running.
    let mut response = post_agent(
        &config,
        json!({"prompt": "wait again", "sessionId": "s2", "agentId": "beta"}),
    )
    .await;
    read_until(&mut response, "beta: wait again").await;
    remote.shutdown().await;
    assert!(
        read_to_end(&mut response)
            .await
            .contains("event: error\ndata: handler disconnected: beta")
    );

    host.shutdown().await;
}

#[tokio::test]
async fn undo_routes_to_the_remote_handler() {
    let config = test_config(free_port());
    let host = connect(&config, MockHandler::new("alpha")).await.unwrap();
    let remote = connect(&config, MockHandler::new("beta")).await.unwrap();
    wait_for_handlers(
        &config,
        json!({"handlers": [
            {"agentId": "alpha", "location": "local"},
            {"agentId": "beta", "location": "remote"}
        ]}),
    )
    .await;

    let client = http();
    let undo = |body: Value| {
        let client = client.clone();
        let url = format!("{}/undo", config.base_url());
        async move {
            client
                .post(url)
                .json(&body)
                .send()
                .await
                .unwrap()
                .json::<Value>()
                .await
                .unwrap()
        }
    };

    assert_eq!(
        undo(json!({"agentId": "beta", "sessionId": "s1"})).await,
        json!({"status": "ok"})
    );
    assert_eq!(
        undo(json!({"agentId": "beta"})).await,
        json!({"status": "error", "message": "no completed session to undo"})
    );

    remote.shutdown().await;
    host.shutdown().await;
}

#[cfg(unix)]
mod process_backed {
    use agent_relay_core::RunOptions;
    use agent_relay_executor::{ArgsContext, ProcessAdapter, ProviderEvent, ProviderSpec};
    use agent_relay_session::{ProviderHandler, SessionRegistry};

    use super::*;

    static SCRIPTED: ProviderSpec = ProviderSpec {
        id: "scripted",
        name: "Scripted CLI",
        binary: "sh",
        install_hint: "n/a",
        supports_undo: true,
        build_args,
        map_event,
    };

    /// The prompt arrives on stdin and is echoed back as a status.
    fn build_args(ctx: &ArgsContext<'_>) -> Vec<String> {
        let script = r#"read -r line
printf '{"t":"thread","text":"th-%s"}\n' "${1:-new}"
printf '{"t":"status","text":"%s"}\n' "$line"
echo '{"t":"ok"}'"#;
        let mut args = vec!["-c".to_string(), script.to_string(), "scripted".to_string()];
        args.extend(ctx.resume.map(String::from));
        args
    }

    fn map_event(event: &Value) -> Vec<ProviderEvent> {
        let text = event
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        match event.get("t").and_then(Value::as_str) {
            Some("thread") => vec![ProviderEvent::ThreadId(text)],
            Some("status") => vec![ProviderEvent::Status(text)],
            Some("ok") => vec![ProviderEvent::Completed],
            _ => Vec::new(),
        }
    }

    #[tokio::test]
    async fn cli_run_then_undo_over_http() {
        let config = test_config(free_port());
        let handler = Arc::new(
            ProviderHandler::new(
                ProcessAdapter::new(&SCRIPTED),
                Arc::new(SessionRegistry::new()),
            )
            .with_defaults(RunOptions::default()),
        );
        let host: RelayConnection = connect(&config, handler.clone()).await.unwrap();

        let mut response = post_agent(
            &config,
            json!({"prompt": "recolor", "content": "", "sessionId": "s1", "options": {}}),
        )
        .await;
        let body = read_to_end(&mut response).await;
        assert!(body.contains("data: recolor"));
        assert!(body.contains("event: done"));
        assert_eq!(
            handler
                .registry()
                .get("s1")
                .and_then(|s| s.external_thread_id)
                .as_deref(),
            Some("th-new")
        );

        let undo: Value = http()
            .post(format!("{}/undo", config.base_url()))
            .json(&json!({}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(undo, json!({"status": "ok"}));

        host.shutdown().await;
    }
}
