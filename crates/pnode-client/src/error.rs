//! Tunnel client errors

use thiserror::Error;

/// Errors surfaced by the tunnel client
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Gateway discovery failed for {host}: {reason}")]
    Discovery { host: String, reason: String },

    #[error("No reachable gateway found for {0}")]
    NoReachableGateway(String),

    #[error("Failed to connect to gateway {host}: {source}")]
    Connect {
        host: String,
        source: std::io::Error,
    },

    #[error("Invalid TLS server name '{0}'")]
    InvalidServerName(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Control connection lost after {retries} reconnection attempts")]
    RetriesExhausted { retries: u32 },

    #[error("Tunnel already running")]
    AlreadyRunning,

    #[error("Tunnel task failed: {0}")]
    Task(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
