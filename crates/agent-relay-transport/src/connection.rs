//! Host election for the local relay.
//!
//! Every process tries the well-known port: if a healthy relay answers it
//! attaches as a remote handler, otherwise it binds the port and hosts.

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use agent_relay_core::Handler;
use thiserror::Error;
use tokio::{net::TcpListener, sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    client::RemoteHandlerClient, config::RelayConfig, http::build_router,
    protocol::HealthResponse, server::RelayServer,
};

const SERVE_DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Connection manager error.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("relay port {port} is in use but no healthy relay answers on it")]
    BindConflict { port: u16 },
    #[error("control channel failed: {0}")]
    Channel(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Role this process ended up with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayRole {
    Host,
    Remote,
}

/// A running relay server with this process's handler registered.
pub struct RelayHost {
    server: Arc<RelayServer>,
    addr: SocketAddr,
    serve: Mutex<Option<JoinHandle<io::Result<()>>>>,
    stopped: CancellationToken,
}

impl RelayHost {
    /// Serve the relay on `listener` with `handler` registered in-process.
    ///
    /// # Errors
    /// Returns an error if the listener address cannot be read.
    pub async fn start(listener: TcpListener, handler: Arc<dyn Handler>) -> io::Result<Self> {
        let addr = listener.local_addr()?;
        let server = Arc::new(RelayServer::new(handler.agent_id()));
        server.register_handler(handler).await;

        let app = build_router(Arc::clone(&server));
        let shutdown = server.shutdown_token();
        let stopped = CancellationToken::new();
        let serve_stopped = stopped.clone();
        let serve = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await;
            serve_stopped.cancel();
            result
        });

        tracing::info!(addr = %addr, provider = server.provider(), "Relay host listening");
        Ok(Self {
            server,
            addr,
            serve: Mutex::new(Some(serve)),
            stopped,
        })
    }

    #[must_use]
    pub const fn server(&self) -> &Arc<RelayServer> {
        &self.server
    }

    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Resolves once the HTTP server has stopped.
    pub async fn stopped(&self) {
        self.stopped.cancelled().await;
    }

    /// Stop accepting, abort in-flight invocations and close control
    /// channels.
    pub async fn shutdown(&self) {
        self.server.shutdown().await;
        if let Some(serve) = self.serve.lock().await.take() {
            match tokio::time::timeout(SERVE_DRAIN_TIMEOUT, serve).await {
                Ok(Ok(Err(err))) => tracing::warn!(%err, "Relay server stopped with error"),
                Err(_) => tracing::warn!("Relay server did not drain in time"),
                _ => {}
            }
        }
    }
}

/// Outcome of host election.
pub enum RelayConnection {
    Host(RelayHost),
    Remote(RemoteHandlerClient),
}

impl RelayConnection {
    #[must_use]
    pub const fn role(&self) -> RelayRole {
        match self {
            Self::Host(_) => RelayRole::Host,
            Self::Remote(_) => RelayRole::Remote,
        }
    }

    /// Resolves when the relay goes away underneath this process.
    pub async fn closed(&self) {
        match self {
            Self::Host(host) => host.stopped().await,
            Self::Remote(client) => client.closed().await,
        }
    }

    pub async fn shutdown(&self) {
        match self {
            Self::Host(host) => host.shutdown().await,
            Self::Remote(client) => client.shutdown().await,
        }
    }
}

/// Become the relay host or attach to the running one.
///
/// # Errors
/// `BindConflict` when the port is taken by something that never answers
/// as a relay; `Channel` when attaching to a healthy relay fails.
pub async fn connect(
    config: &RelayConfig,
    handler: Arc<dyn Handler>,
) -> Result<RelayConnection, ConnectionError> {
    if probe_health(config).await {
        return attach(config, handler).await;
    }

    if config.release_stale_listener {
        release_stale_listener(config.port).await;
    }

    match TcpListener::bind((config.host.as_str(), config.port)).await {
        Ok(listener) => Ok(RelayConnection::Host(
            RelayHost::start(listener, handler).await?,
        )),
        Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
            tracing::info!(port = config.port, "Relay port taken, waiting for its host");
            for attempt in 1..=config.bind_retries {
                tokio::time::sleep(config.bind_retry_delay).await;
                if probe_health(config).await {
                    return attach(config, handler).await;
                }
                tracing::debug!(attempt, port = config.port, "Relay still not healthy");
            }
            Err(ConnectionError::BindConflict { port: config.port })
        }
        Err(err) => Err(err.into()),
    }
}

async fn attach(
    config: &RelayConfig,
    handler: Arc<dyn Handler>,
) -> Result<RelayConnection, ConnectionError> {
    let client = RemoteHandlerClient::connect(&config.relay_url(), handler).await?;
    Ok(RelayConnection::Remote(client))
}

/// Whether a relay answers `GET /health` on the configured port.
pub async fn probe_health(config: &RelayConfig) -> bool {
    let client = match reqwest::Client::builder()
        .timeout(config.probe_timeout)
        .no_proxy()
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            tracing::warn!(%err, "Failed to build health probe client");
            return false;
        }
    };

    let url = format!("{}/health", config.base_url());
    match client.get(&url).send().await {
        Ok(response) if response.status().is_success() => response
            .json::<HealthResponse>()
            .await
            .is_ok_and(|health| health.status == "ok"),
        Ok(response) => {
            tracing::debug!(
                %url,
                status = %response.status(),
                "Relay health check returned non-success status"
            );
            false
        }
        Err(err) => {
            tracing::debug!(%url, %err, "Relay health check failed");
            false
        }
    }
}

/// Terminate a listener on `port` left behind by an earlier run of this
/// executable. Anything else holding the port is left alone.
#[cfg(unix)]
async fn release_stale_listener(port: u16) {
    use nix::{
        sys::signal::{Signal, kill},
        unistd::Pid,
    };
    use tokio::process::Command;

    let Some(exe_name) = std::env::current_exe()
        .ok()
        .and_then(|path| path.file_name().map(|n| n.to_string_lossy().into_owned()))
    else {
        return;
    };

    let output = match Command::new("lsof")
        .args(["-i", &format!(":{port}"), "-t", "-sTCP:LISTEN"])
        .output()
        .await
    {
        Ok(output) if output.status.success() => output,
        _ => return,
    };

    let own = std::process::id();
    let mut released = false;
    for pid in String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|line| line.trim().parse::<u32>().ok())
        .filter(|pid| *pid != own)
    {
        let Some(name) = process_name(pid).await else {
            continue;
        };
        if !same_executable(&name, &exe_name) {
            tracing::debug!(pid, %name, "Port held by another program, leaving it");
            continue;
        }
        let Ok(raw) = i32::try_from(pid) else {
            continue;
        };
        tracing::warn!(pid, port, "Terminating stale relay listener");
        match kill(Pid::from_raw(raw), Signal::SIGTERM) {
            Ok(()) => released = true,
            Err(err) => tracing::debug!(pid, %err, "Failed to signal stale listener"),
        }
    }

    if released {
        tokio::time::sleep(Duration::from_millis(300)).await;
    }
}

#[cfg(not(unix))]
async fn release_stale_listener(_port: u16) {}

#[cfg(unix)]
async fn process_name(pid: u32) -> Option<String> {
    let output = tokio::process::Command::new("ps")
        .args(["-p", &pid.to_string(), "-o", "comm="])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let name = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!name.is_empty()).then_some(name)
}

/// Whether a `ps` command name refers to the executable `exe_name`.
///
/// `comm` may be a full path, or cut to 15 bytes on Linux.
#[cfg_attr(not(unix), allow(dead_code))]
fn same_executable(comm: &str, exe_name: &str) -> bool {
    const COMM_MAX: usize = 15;

    let base = comm.rsplit('/').next().unwrap_or(comm);
    base == exe_name || (base.len() == COMM_MAX && exe_name.starts_with(base))
}
