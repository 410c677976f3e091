//! Command-line configuration.
//!
//! Every option falls back to a `LODESTAR__`-prefixed environment variable;
//! command-line arguments win.

use std::time::Duration;

use clap::{Parser, ValueEnum};
use lodestar_sdk::{RegistryConfig, Result};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// JSON when stdout is not a terminal, text otherwise.
    Auto,
    /// Human-readable text.
    Text,
    /// One JSON object per event.
    Json,
}

/// Runs a discovery, balancing and retry walkthrough against an in-process
/// ensemble.
#[derive(Debug, Parser)]
#[command(name = "lodestar-demo", version, about)]
pub struct Cli {
    /// Coordination ensemble, `host:port[,host:port...][/chroot]`.
    #[arg(long, env = "LODESTAR__CONNECT", default_value = "localhost:2181")]
    pub connect: String,

    /// Root of the service namespace.
    #[arg(long, env = "LODESTAR__ROOT_PATH", default_value = lodestar_sdk::DEFAULT_ROOT_PATH)]
    pub root_path: String,

    /// Service to register and resolve.
    #[arg(long, env = "LODESTAR__SERVICE", default_value = "echo")]
    pub service: String,

    /// Zone the client prefers.
    #[arg(long, env = "LODESTAR__ZONE", default_value = "zone-a")]
    pub zone: String,

    /// Number of server instances to start.
    #[arg(long, env = "LODESTAR__INSTANCES", default_value_t = 3)]
    pub instances: u8,

    /// Retries permitted per call; negative retries forever.
    #[arg(long, env = "LODESTAR__MAX_RETRIES", default_value_t = 3, allow_negative_numbers = true)]
    pub max_retries: i32,

    /// Number of `UNAVAILABLE` failures the echo server returns before
    /// answering.
    #[arg(long, env = "LODESTAR__FAILURES", default_value_t = 2)]
    pub failures: usize,

    /// Session timeout in milliseconds.
    #[arg(long, env = "LODESTAR__SESSION_TIMEOUT_MS", default_value_t = 10_000)]
    pub session_timeout_ms: u64,

    /// Log output format.
    #[arg(long, env = "LODESTAR__LOG_FORMAT", value_enum, default_value_t = LogFormat::Auto)]
    pub log_format: LogFormat,
}

impl Cli {
    /// Builds the registry configuration from the options.
    pub fn registry_config(&self) -> Result<RegistryConfig> {
        RegistryConfig::builder()
            .with_connect_string(self.connect.as_str())
            .with_root_path(self.root_path.as_str())
            .with_session_timeout(Duration::from_millis(self.session_timeout_ms))
            .build()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["lodestar-demo"]).unwrap();
        assert_eq!(cli.service, "echo");
        assert_eq!(cli.instances, 3);
        assert_eq!(cli.log_format, LogFormat::Auto);

        let config = cli.registry_config().unwrap();
        assert_eq!(config.root_path(), "/lodestar/services");
        assert_eq!(config.session_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_arguments() {
        let cli = Cli::try_parse_from([
            "lodestar-demo",
            "--connect",
            "zk1:2181,zk2:2181/apps",
            "--max-retries",
            "-1",
            "--log-format",
            "json",
        ])
        .unwrap();

        assert_eq!(cli.max_retries, -1);
        assert_eq!(cli.log_format, LogFormat::Json);
        assert_eq!(cli.registry_config().unwrap().root_path(), "/apps/lodestar/services");
    }

    #[test]
    fn test_invalid_connect_string_rejected() {
        let cli = Cli::try_parse_from(["lodestar-demo", "--connect", "no-port"]).unwrap();
        assert!(cli.registry_config().is_err());
    }
}
