use std::{net::SocketAddr, time::Duration};

use clap::Args;
use thiserror::Error;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_BODY_BYTES: usize = 50 * 1024 * 1024;

#[derive(Debug, Clone, Args)]
pub struct ServerArgs {
    /// Address the relay listens on for hosts and external clients alike.
    #[arg(long, env = "IPARTY_RELAY_LISTEN_ADDR", default_value = "0.0.0.0:5001")]
    pub listen_addr: String,

    /// How long an external HTTP request waits for the host's answer.
    #[arg(long, env = "IPARTY_RELAY_REQUEST_TIMEOUT_MS", default_value_t = 10_000)]
    pub request_timeout_ms: u64,

    /// Largest external request body accepted for bridging.
    #[arg(long, env = "IPARTY_RELAY_MAX_BODY_BYTES", default_value_t = DEFAULT_MAX_BODY_BYTES)]
    pub max_body_bytes: usize,

    /// Grace period applied during shutdown.
    #[arg(long, env = "IPARTY_RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid listen address {value:?}: {source}")]
    ListenAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error("request timeout must be greater than zero")]
    ZeroTimeout,
    #[error("max body size must be greater than zero")]
    ZeroBodyLimit,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub request_timeout: Duration,
    pub max_body_bytes: usize,
    pub shutdown_grace: Duration,
}

impl RelayConfig {
    /// Defaults bound to `listen_addr`; used by tests and embedders.
    pub fn with_listen_addr(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            shutdown_grace: Duration::ZERO,
        }
    }
}

impl TryFrom<ServerArgs> for RelayConfig {
    type Error = ConfigError;

    fn try_from(args: ServerArgs) -> Result<Self, Self::Error> {
        let listen_addr = args
            .listen_addr
            .parse()
            .map_err(|source| ConfigError::ListenAddr {
                value: args.listen_addr.clone(),
                source,
            })?;
        if args.request_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        if args.max_body_bytes == 0 {
            return Err(ConfigError::ZeroBodyLimit);
        }
        Ok(RelayConfig {
            listen_addr,
            request_timeout: Duration::from_millis(args.request_timeout_ms),
            max_body_bytes: args.max_body_bytes,
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        })
    }
}
