//! Error types for Burrow.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Missing credentials, team, or project. Never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Provisioning error: {0}")]
    Provisioning(String),

    #[error("Channel error: {0}")]
    Channel(String),

    /// Local service unreachable while replaying a request.
    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
