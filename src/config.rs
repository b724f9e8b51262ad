//! Server configuration.
//!
//! [`ServerConfig`] is what the server runs with; [`Cli`] is the command
//! line that produces it.

use crate::commands::DeploymentPolicy;
use crate::storage::MemoryCacheConfig;
use crate::{DEFAULT_HOST, DEFAULT_PORT};
use clap::Parser;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Whether INIT responses tell clients to keep request logs
    pub request_logging_enabled: bool,
    pub allow_remote_clients: bool,
    pub event_push_enabled: bool,
    pub persistence_enabled: bool,
    pub persistence_interval: Duration,
    pub cache_type: String,
    pub cache_id: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            request_logging_enabled: false,
            allow_remote_clients: true,
            event_push_enabled: true,
            persistence_enabled: false,
            persistence_interval: Duration::ZERO,
            cache_type: "Local".to_string(),
            cache_id: "default".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn deployment_policy(&self) -> DeploymentPolicy {
        if self.allow_remote_clients {
            DeploymentPolicy::AcceptRemote
        } else {
            DeploymentPolicy::LocalOnly
        }
    }

    pub fn cache_config(&self) -> MemoryCacheConfig {
        MemoryCacheConfig {
            cache_id: self.cache_id.clone(),
            cache_type: self.cache_type.clone(),
            persistence_enabled: self.persistence_enabled,
            persistence_interval: self.persistence_interval,
        }
    }
}

/// Command line of the `flashgate` binary.
#[derive(Debug, Parser)]
#[command(name = "flashgate", version, about = "Client command gate for an in-memory cache")]
pub struct Cli {
    /// Host to bind to
    #[arg(short = 'H', long, default_value = DEFAULT_HOST)]
    pub host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Ask connecting clients to keep request logs
    #[arg(long)]
    pub request_logging: bool,

    /// Reject clients that do not connect from this host
    #[arg(long)]
    pub local_only: bool,

    /// Persistence interval in seconds; 0 disables persistence
    #[arg(long, default_value_t = 0)]
    pub persistence_interval: u64,

    #[arg(long, default_value = "Local")]
    pub cache_type: String,

    #[arg(long, default_value = "default")]
    pub cache_id: String,

    /// Do not forward cache events to clients
    #[arg(long)]
    pub no_event_push: bool,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl From<&Cli> for ServerConfig {
    fn from(cli: &Cli) -> Self {
        Self {
            host: cli.host.clone(),
            port: cli.port,
            request_logging_enabled: cli.request_logging,
            allow_remote_clients: !cli.local_only,
            event_push_enabled: !cli.no_event_push,
            persistence_enabled: cli.persistence_interval > 0,
            persistence_interval: Duration::from_secs(cli.persistence_interval),
            cache_type: cli.cache_type.clone(),
            cache_id: cli.cache_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_cli_defaults() {
        let cli = Cli::parse_from(["flashgate"]);
        assert_eq!(ServerConfig::from(&cli), ServerConfig::default());
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_cli_flags() {
        let cli = Cli::parse_from([
            "flashgate",
            "-H",
            "0.0.0.0",
            "-p",
            "9900",
            "--request-logging",
            "--local-only",
            "--persistence-interval",
            "30",
            "--cache-type",
            "Partitioned",
            "--cache-id",
            "orders",
            "--no-event-push",
        ]);
        let config = ServerConfig::from(&cli);

        assert_eq!(config.bind_address(), "0.0.0.0:9900");
        assert!(config.request_logging_enabled);
        assert_eq!(config.deployment_policy(), DeploymentPolicy::LocalOnly);
        assert!(!config.event_push_enabled);
        assert!(config.persistence_enabled);
        assert_eq!(config.persistence_interval, Duration::from_secs(30));

        let cache = config.cache_config();
        assert_eq!(cache.cache_id, "orders");
        assert_eq!(cache.cache_type, "Partitioned");
    }

    #[test]
    fn test_remote_clients_allowed_by_default() {
        assert_eq!(
            ServerConfig::default().deployment_policy(),
            DeploymentPolicy::AcceptRemote
        );
    }
}
