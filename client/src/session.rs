//! Session manager: reuse or create the remote context for a local port
//! and start the relay inside it.

use burrow_shared::protocol::{CHANNEL_PATH, RELAY_PORT, SESSION_EXPIRY};
use burrow_shared::{Error, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::provision::{
    CommandSpec, ContextSpec, ContextStatus, FileEntry, LogStream, ProvisioningService,
};
use crate::store::{SessionRecord, SessionStore};

const RELAY_FILE: &str = "burrow-relay";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Start,
    Lookup,
    Reused,
    Created,
    Provisioned,
    RelayStarted,
    BridgeAttached,
    Ready,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The relay executable as it is deployed into a context
#[derive(Debug, Clone)]
pub struct RelayBundle {
    binary: Vec<u8>,
    log_filter: String,
}

impl RelayBundle {
    pub fn new(binary: Vec<u8>) -> Self {
        Self {
            binary,
            log_filter: "burrow_relay=info".to_string(),
        }
    }

    /// The configured path, or `burrow-relay` next to the running executable
    pub fn locate(configured: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = configured {
            return Ok(path.to_path_buf());
        }
        let exe = std::env::current_exe()?;
        let dir = exe
            .parent()
            .ok_or_else(|| Error::Configuration("Cannot locate the burrow install directory".into()))?;
        Ok(dir.join(RELAY_FILE))
    }

    pub fn load(configured: Option<&Path>) -> Result<Self> {
        let path = Self::locate(configured)?;
        let binary = std::fs::read(&path).map_err(|e| {
            Error::Configuration(format!(
                "Failed to read relay binary {}: {}\nBuild it with `cargo build --release -p burrow-relay` or set relay_binary in burrow.yml.",
                path.display(),
                e
            ))
        })?;
        debug!("Loaded relay binary from {} ({} bytes)", path.display(), binary.len());
        Ok(Self::new(binary))
    }

    pub fn with_log_filter(mut self, filter: &str) -> Self {
        self.log_filter = filter.to_string();
        self
    }

    pub fn files(&self) -> Vec<FileEntry> {
        vec![FileEntry {
            path: RELAY_FILE.to_string(),
            content: self.binary.clone(),
            mode: 0o755,
        }]
    }

    pub fn install_command(&self) -> CommandSpec {
        CommandSpec {
            cmd: "chmod".to_string(),
            args: vec!["+x".to_string(), RELAY_FILE.to_string()],
            ..Default::default()
        }
    }

    pub fn start_command(&self) -> CommandSpec {
        let mut env = BTreeMap::new();
        env.insert("RELAY_PORT".to_string(), RELAY_PORT.to_string());
        env.insert("CHANNEL_PATH".to_string(), CHANNEL_PATH.to_string());
        env.insert("RUST_LOG".to_string(), self.log_filter.clone());
        CommandSpec {
            cmd: format!("./{}", RELAY_FILE),
            args: Vec::new(),
            env,
            detached: true,
        }
    }
}

/// The context bound to this invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSession {
    pub local_port: u16,
    pub context_id: String,
    pub created_at: DateTime<Utc>,
    pub public_url: String,
    pub reused: bool,
}

pub struct SessionManager {
    provisioner: Arc<dyn ProvisioningService>,
    store: Arc<dyn SessionStore>,
    spec: ContextSpec,
    phase: SessionPhase,
    active: Option<ActiveSession>,
}

impl SessionManager {
    pub fn new(
        provisioner: Arc<dyn ProvisioningService>,
        store: Arc<dyn SessionStore>,
        spec: ContextSpec,
    ) -> Self {
        Self {
            provisioner,
            store,
            spec,
            phase: SessionPhase::Start,
            active: None,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn active(&self) -> Option<&ActiveSession> {
        self.active.as_ref()
    }

    fn transition(&mut self, next: SessionPhase) {
        debug!("Session phase {} -> {}", self.phase, next);
        self.phase = next;
    }

    /// Reuse the persisted context for `local_port` if it is still running
    /// and inside the expiry window, otherwise create and persist a new one.
    pub async fn provision(&mut self, local_port: u16) -> Result<ActiveSession> {
        self.transition(SessionPhase::Lookup);

        let (context_id, created_at, reused) = match self.reusable(local_port).await {
            Some(record) => {
                info!("Reusing sandbox {} for port {}", record.id, local_port);
                self.transition(SessionPhase::Reused);
                (record.id, record.created_at, true)
            }
            None => {
                let created = self.provisioner.create(&self.spec).await?;
                let created_at = Utc::now();
                info!("Created sandbox {} for port {}", created.id, local_port);
                self.transition(SessionPhase::Created);

                let record = SessionRecord {
                    id: created.id.clone(),
                    created_at,
                };
                if let Err(e) = self.store.update(&mut |sessions| {
                    sessions.insert(local_port, record.clone());
                }) {
                    warn!("Failed to persist session for port {}: {}", local_port, e);
                }
                (created.id, created_at, false)
            }
        };

        let public_url = self.provisioner.exposed_address(&context_id, RELAY_PORT).await?;
        let session = ActiveSession {
            local_port,
            context_id,
            created_at,
            public_url,
            reused,
        };
        self.active = Some(session.clone());
        self.transition(SessionPhase::Provisioned);
        Ok(session)
    }

    async fn reusable(&self, local_port: u16) -> Option<SessionRecord> {
        let record = match self.store.load() {
            Ok(mut sessions) => sessions.remove(&local_port)?,
            Err(e) => {
                warn!("Failed to read session store: {}", e);
                return None;
            }
        };

        let age = Utc::now().signed_duration_since(record.created_at);
        if age.to_std().map(|a| a > SESSION_EXPIRY).unwrap_or(false) {
            info!("Sandbox {} expired ({} min old)", record.id, age.num_minutes());
            return None;
        }

        match self.provisioner.get(&record.id).await {
            Ok(info) if info.status == ContextStatus::Running => Some(record),
            Ok(info) => {
                info!("Sandbox {} is {:?}, not reusable", record.id, info.status);
                None
            }
            Err(e) => {
                debug!("Lookup of sandbox {} failed: {}", record.id, e);
                None
            }
        }
    }

    /// Upload the relay, make it executable, and start it in the background.
    /// Does not wait for the relay to accept connections.
    pub async fn start_relay(&mut self, bundle: &RelayBundle) -> Result<()> {
        let context_id = self
            .active
            .as_ref()
            .map(|s| s.context_id.clone())
            .ok_or_else(|| Error::Provisioning("No provisioned session to start the relay in".into()))?;

        self.provisioner.write_files(&context_id, &bundle.files()).await?;

        let install = self
            .provisioner
            .run_command(&context_id, &bundle.install_command())
            .await?;
        match self.provisioner.command_logs(&context_id, &install).await {
            Ok(lines) => {
                for line in lines {
                    let data = line.data.trim_end();
                    if data.is_empty() {
                        continue;
                    }
                    match line.stream {
                        LogStream::Stdout => info!("[install] {}", data),
                        LogStream::Stderr => warn!("[install] {}", data),
                    }
                }
            }
            Err(e) => debug!("Install logs unavailable: {}", e),
        }
        match install.exit_code {
            Some(0) | None => {}
            Some(code) => {
                return Err(Error::Provisioning(format!(
                    "Relay install failed with exit code {}",
                    code
                )))
            }
        }

        let started = self
            .provisioner
            .run_command(&context_id, &bundle.start_command())
            .await?;
        info!("Relay started in sandbox {} (command {})", context_id, started.id);
        self.transition(SessionPhase::RelayStarted);
        Ok(())
    }

    /// Record that a relay from an earlier invocation is already serving
    /// the reused context
    pub fn adopt_relay(&mut self) -> Result<()> {
        match &self.active {
            Some(session) if session.reused => {
                info!("Relay already running in sandbox {}", session.context_id);
                self.transition(SessionPhase::RelayStarted);
                Ok(())
            }
            _ => Err(Error::Provisioning("Only a reused session can adopt a running relay".into())),
        }
    }

    pub fn mark_attached(&mut self) {
        self.transition(SessionPhase::BridgeAttached);
    }

    pub fn mark_ready(&mut self) {
        self.transition(SessionPhase::Ready);
    }

    /// Stop the active context. A no-op when there is none or it was
    /// already stopped.
    pub async fn shutdown(&mut self) -> Result<()> {
        let Some(session) = self.active.take() else {
            return Ok(());
        };
        self.transition(SessionPhase::ShuttingDown);
        info!("Stopping sandbox {}", session.context_id);
        let result = self.provisioner.stop(&session.context_id).await;
        self.transition(SessionPhase::Stopped);
        result
    }

    /// Stop whatever context is persisted for `local_port` and forget it.
    /// Returns the stopped context id.
    pub async fn stop_port(&mut self, local_port: u16) -> Result<Option<String>> {
        let record = self.store.load()?.remove(&local_port);
        let Some(record) = record else {
            return Ok(None);
        };

        self.transition(SessionPhase::ShuttingDown);
        info!("Stopping sandbox {} for port {}", record.id, local_port);
        self.provisioner.stop(&record.id).await?;
        self.store.update(&mut |sessions| {
            if sessions.get(&local_port).map(|r| r.id == record.id).unwrap_or(false) {
                sessions.remove(&local_port);
            }
        })?;
        if self
            .active
            .as_ref()
            .map(|s| s.context_id == record.id)
            .unwrap_or(false)
        {
            self.active = None;
        }
        self.transition(SessionPhase::Stopped);
        Ok(Some(record.id))
    }
}
