//! Configuration file parser for Burrow
//!
//! Supports an optional burrow.yml with sandbox sizing, the relay binary
//! location, and the channel connect retry policy. Every field has a
//! default, so running without a file is the normal case.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Context, Result};

use burrow_shared::protocol::{RELAY_PORT, SESSION_EXPIRY};

use crate::bridge::RetryPolicy;
use crate::provision::ContextSpec;

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BurrowConfig {
    /// Provisioning API base URL
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Runtime image for the remote context
    #[serde(default = "default_runtime")]
    pub runtime: String,

    /// vCPUs for the remote context
    #[serde(default = "default_vcpus")]
    pub vcpus: u32,

    /// Path to the relay binary uploaded into the context.
    /// Defaults to `burrow-relay` next to the running executable.
    pub relay_binary: Option<PathBuf>,

    /// Where the port to session mapping is persisted
    pub session_file: Option<PathBuf>,

    #[serde(default)]
    pub connect: ConnectConfig,
}

/// Channel establishment retry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectConfig {
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl Default for BurrowConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            runtime: default_runtime(),
            vcpus: default_vcpus(),
            relay_binary: None,
            session_file: None,
            connect: ConnectConfig::default(),
        }
    }
}

fn default_api_url() -> String {
    "https://api.vercel.com".to_string()
}

fn default_runtime() -> String {
    "node22".to_string()
}

fn default_vcpus() -> u32 {
    2
}

fn default_attempts() -> u32 {
    8
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    5_000
}

impl BurrowConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: BurrowConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit path, a discovered file, or defaults
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => match Self::find_config() {
                Some(path) => Self::load(&path),
                None => Ok(Self::default()),
            },
        }
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        if self.vcpus == 0 {
            anyhow::bail!("vcpus must be at least 1");
        }
        if self.connect.attempts == 0 {
            anyhow::bail!("connect.attempts must be at least 1");
        }
        if !self.api_url.starts_with("http://") && !self.api_url.starts_with("https://") {
            anyhow::bail!("api_url must be an http(s) URL: {}", self.api_url);
        }
        Ok(())
    }

    /// Sizing for newly created contexts; their lifetime is the expiry window
    pub fn context_spec(&self) -> ContextSpec {
        ContextSpec {
            runtime: self.runtime.clone(),
            vcpus: self.vcpus,
            ports: vec![RELAY_PORT],
            timeout: SESSION_EXPIRY,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.connect.attempts,
            initial_backoff: Duration::from_millis(self.connect.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.connect.max_backoff_ms),
        }
    }

    /// Search for config file in standard locations
    pub fn find_config() -> Option<PathBuf> {
        let candidates = [
            "burrow.yml",
            "burrow.yaml",
            ".burrow.yml",
            ".burrow.yaml",
        ];

        // Check current directory
        for name in &candidates {
            let path = PathBuf::from(name);
            if path.exists() {
                return Some(path);
            }
        }

        // Check home directory
        if let Some(home) = dirs::home_dir() {
            for name in &candidates {
                let path = home.join(name);
                if path.exists() {
                    return Some(path);
                }
            }
        }

        None
    }
}
