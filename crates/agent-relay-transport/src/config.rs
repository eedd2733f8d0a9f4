//! Relay connection settings.

use std::time::Duration;

/// Well-known local relay port.
pub const DEFAULT_PORT: u16 = 4722;
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Where the relay lives and how hard to try becoming its host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    /// Timeout of the `/health` probe.
    pub probe_timeout: Duration,
    /// Re-probes after the port turned out to be taken.
    pub bind_retries: u32,
    pub bind_retry_delay: Duration,
    /// Terminate a stale listener left by an earlier run of this executable.
    pub release_stale_listener: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            probe_timeout: Duration::from_secs(1),
            bind_retries: 3,
            bind_retry_delay: Duration::from_millis(250),
            release_stale_listener: true,
        }
    }
}

impl RelayConfig {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Control-channel URL on the host.
    #[must_use]
    pub fn relay_url(&self) -> String {
        format!("ws://{}:{}/relay", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_follow_host_and_port() {
        let config = RelayConfig::new("127.0.0.1", 5000);
        assert_eq!(config.base_url(), "http://127.0.0.1:5000");
        assert_eq!(config.relay_url(), "ws://127.0.0.1:5000/relay");
    }

    #[test]
    fn defaults_use_well_known_port() {
        let config = RelayConfig::default();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.probe_timeout, Duration::from_secs(1));
    }
}
