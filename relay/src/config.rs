//! Relay configuration, read from the environment of the remote context.

use burrow_shared::protocol::{CHANNEL_PATH, RELAY_PORT, REQUEST_TIMEOUT};
use burrow_shared::{Error, Result};
use std::time::Duration;

/// Default per-request deadline before a pending request is failed
pub const DEFAULT_REQUEST_TIMEOUT: Duration = REQUEST_TIMEOUT;

/// Accepted range for `REQUEST_TIMEOUT_SECS`
pub const REQUEST_TIMEOUT_SECS_RANGE: std::ops::RangeInclusive<u64> = 1..=3600;

/// Default cap on buffered public request bodies (10 MB)
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    /// Upgrade path for the bridge channel
    pub channel_path: String,
    pub request_timeout: Duration,
    pub max_body_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: RELAY_PORT,
            channel_path: CHANNEL_PATH.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl RelayConfig {
    /// `RELAY_PORT` and `CHANNEL_PATH` are required, the rest optional
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let port = get("RELAY_PORT")
            .ok_or_else(|| Error::Configuration("RELAY_PORT environment variable is not set".into()))?;
        let port: u16 = port
            .trim()
            .parse()
            .map_err(|_| Error::Configuration(format!("RELAY_PORT is not a valid port: {}", port)))?;

        let channel_path = get("CHANNEL_PATH")
            .ok_or_else(|| Error::Configuration("CHANNEL_PATH environment variable is not set".into()))?;
        if !channel_path.starts_with('/') {
            return Err(Error::Configuration(format!(
                "CHANNEL_PATH must start with '/': {}",
                channel_path
            )));
        }

        let request_timeout = match get("REQUEST_TIMEOUT_SECS") {
            Some(v) => {
                let secs: u64 = v.trim().parse().map_err(|_| {
                    Error::Configuration(format!("REQUEST_TIMEOUT_SECS is not a number: {}", v))
                })?;
                if !REQUEST_TIMEOUT_SECS_RANGE.contains(&secs) {
                    return Err(Error::Configuration(format!(
                        "REQUEST_TIMEOUT_SECS must be between {} and {}: {}",
                        REQUEST_TIMEOUT_SECS_RANGE.start(),
                        REQUEST_TIMEOUT_SECS_RANGE.end(),
                        secs
                    )));
                }
                Duration::from_secs(secs)
            }
            None => DEFAULT_REQUEST_TIMEOUT,
        };

        let max_body_bytes = match get("MAX_BODY_BYTES") {
            Some(v) => v.trim().parse().map_err(|_| {
                Error::Configuration(format!("MAX_BODY_BYTES is not a number: {}", v))
            })?,
            None => DEFAULT_MAX_BODY_BYTES,
        };

        Ok(Self {
            port,
            channel_path,
            request_timeout,
            max_body_bytes,
        })
    }
}
