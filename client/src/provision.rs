//! Remote execution context provisioning interface.
//!
//! The session manager only talks to contexts through this trait; the
//! concrete REST binding lives in `sandbox`.

use async_trait::async_trait;
use burrow_shared::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Sizing for a new context
#[derive(Debug, Clone, PartialEq)]
pub struct ContextSpec {
    pub runtime: String,
    pub vcpus: u32,
    /// Ports exposed publicly
    pub ports: Vec<u16>,
    /// Lifetime after which the provider stops the context
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextStatus {
    Pending,
    Running,
    Stopping,
    Stopped,
    Failed,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextInfo {
    pub id: String,
    pub status: ContextStatus,
}

/// A file to place inside the context, relative to its working directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: String,
    pub content: Vec<u8>,
    pub mode: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub cmd: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Return as soon as the command starts instead of waiting for exit
    pub detached: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandHandle {
    pub id: String,
    /// Set once the command finished; always `None` for detached commands
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub stream: LogStream,
    pub data: String,
}

#[async_trait]
pub trait ProvisioningService: Send + Sync {
    async fn create(&self, spec: &ContextSpec) -> Result<ContextInfo>;

    async fn get(&self, context_id: &str) -> Result<ContextInfo>;

    async fn stop(&self, context_id: &str) -> Result<()>;

    async fn write_files(&self, context_id: &str, files: &[FileEntry]) -> Result<()>;

    async fn run_command(&self, context_id: &str, spec: &CommandSpec) -> Result<CommandHandle>;

    async fn command_logs(&self, context_id: &str, command: &CommandHandle) -> Result<Vec<LogLine>>;

    /// Public base URL for an exposed port
    async fn exposed_address(&self, context_id: &str, port: u16) -> Result<String>;
}
