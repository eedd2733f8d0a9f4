//! `agent-relay`: expose one local AI coding CLI on the shared relay port.
//!
//! The first process on the port hosts the relay; later ones register
//! their provider with it over the control channel.

use std::{path::PathBuf, sync::Arc, time::Duration};

use agent_relay_core::RunOptions;
use agent_relay_executor::{CommandBuilder, ProcessAdapter, ProviderSpec, resolve_executable_path};
use agent_relay_session::{ProviderHandler, SessionRegistry};
use agent_relay_transport::{DEFAULT_HOST, DEFAULT_PORT, RelayConfig, RelayRole, connect};
use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "agent-relay", version, about = "Relay a local AI coding CLI to the browser")]
struct Cli {
    /// Provider to serve (claude, codex, cursor, gemini, opencode, amp, droid)
    #[arg(long, env = "AGENT_RELAY_PROVIDER", default_value = "claude")]
    provider: String,

    /// Relay port shared by every provider process
    #[arg(long, env = "AGENT_RELAY_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    #[arg(long, env = "AGENT_RELAY_HOST", default_value = DEFAULT_HOST)]
    host: String,

    /// Working directory for the CLI (defaults to the current directory)
    #[arg(long, env = "AGENT_RELAY_CWD")]
    cwd: Option<PathBuf>,

    /// Executable or wrapper command to launch instead of the provider's default
    #[arg(long, env = "AGENT_RELAY_BINARY")]
    binary: Option<String>,

    /// Model passed to the CLI unless the request names one
    #[arg(long, env = "AGENT_RELAY_MODEL")]
    model: Option<String>,

    /// Autonomy level passed to the CLI unless the request names one
    #[arg(long, env = "AGENT_RELAY_AUTO_LEVEL")]
    auto_level: Option<String>,

    /// Seconds a cancelled CLI gets before it is killed
    #[arg(long, default_value_t = 3)]
    grace_period: u64,

    /// Leave a stale listener from an earlier run alone
    #[arg(long)]
    keep_stale_listener: bool,

    /// Print the supported providers and exit
    #[arg(long)]
    list_providers: bool,
}

impl Cli {
    fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            release_stale_listener: !self.keep_stale_listener,
            ..RelayConfig::new(self.host.clone(), self.port)
        }
    }

    fn run_defaults(&self) -> RunOptions {
        let working_dir = self
            .cwd
            .clone()
            .or_else(|| std::env::current_dir().ok());
        RunOptions {
            working_dir,
            model: self.model.clone(),
            auto_level: self.auto_level.clone(),
            ..RunOptions::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    if cli.list_providers {
        for spec in ProviderSpec::all() {
            println!("{:<10} {:<14} {}", spec.id, spec.binary, spec.name);
        }
        return Ok(());
    }

    let spec = ProviderSpec::find(&cli.provider)
        .with_context(|| format!("unknown provider: {}", cli.provider))?;

    let program = CommandBuilder::new(cli.binary.as_deref().unwrap_or(spec.binary)).program_name();
    if resolve_executable_path(&program).await.is_none() {
        tracing::warn!("{}", spec.missing_binary_message());
    }

    let mut adapter =
        ProcessAdapter::new(spec).with_grace_period(Duration::from_secs(cli.grace_period));
    if let Some(binary) = &cli.binary {
        adapter = adapter.with_binary(binary.clone());
    }
    let handler = Arc::new(
        ProviderHandler::new(adapter, Arc::new(SessionRegistry::new()))
            .with_defaults(cli.run_defaults()),
    );

    let config = cli.relay_config();
    let connection = connect(&config, handler)
        .await
        .with_context(|| format!("failed to join the relay on port {}", config.port))?;

    match connection.role() {
        RelayRole::Host => {
            tracing::info!(provider = spec.id, "Hosting the relay on {}", config.base_url());
        }
        RelayRole::Remote => {
            tracing::info!(provider = spec.id, "Attached to the relay on {}", config.base_url());
        }
    }

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for ctrl-c")?;
            tracing::info!("Shutting down");
        }
        () = connection.closed() => {
            tracing::warn!("Relay connection closed");
        }
    }

    connection.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_target_the_well_known_port() {
        let cli = Cli::try_parse_from(["agent-relay"]).unwrap();
        assert_eq!(cli.provider, "claude");
        let config = cli.relay_config();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.host, DEFAULT_HOST);
        assert!(config.release_stale_listener);
    }

    #[test]
    fn flags_fill_run_defaults() {
        let cli = Cli::try_parse_from([
            "agent-relay",
            "--provider",
            "codex",
            "--cwd",
            "/srv/app",
            "--model",
            "o3",
            "--auto-level",
            "full",
            "--keep-stale-listener",
        ])
        .unwrap();
        let defaults = cli.run_defaults();
        assert_eq!(defaults.working_dir, Some(PathBuf::from("/srv/app")));
        assert_eq!(defaults.model.as_deref(), Some("o3"));
        assert_eq!(defaults.auto_level.as_deref(), Some("full"));
        assert!(!cli.relay_config().release_stale_listener);
    }

    #[test]
    fn every_listed_provider_resolves() {
        for spec in ProviderSpec::all() {
            assert!(ProviderSpec::find(spec.id).is_some());
        }
    }
}
