//! Test doubles for the provisioning and persistence seams.

#![allow(dead_code)]

use async_trait::async_trait;
use burrow::provision::{
    CommandHandle, CommandSpec, ContextInfo, ContextSpec, ContextStatus, FileEntry, LogLine,
    LogStream, ProvisioningService,
};
use burrow::store::{SessionMap, SessionStore};
use burrow_shared::{Error, Result};
use std::collections::HashMap;
use std::sync::Mutex;

/// In-memory provisioner that records every call
pub struct FakeProvisioner {
    pub calls: Mutex<Vec<String>>,
    pub statuses: Mutex<HashMap<String, ContextStatus>>,
    pub fail_get: bool,
    pub install_exit_code: i32,
    pub public_url: String,
    next_id: Mutex<u32>,
}

impl FakeProvisioner {
    pub fn new(public_url: &str) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            statuses: Mutex::new(HashMap::new()),
            fail_get: false,
            install_exit_code: 0,
            public_url: public_url.to_string(),
            next_id: Mutex::new(0),
        }
    }

    pub fn with_context(self, id: &str, status: ContextStatus) -> Self {
        self.statuses.lock().unwrap().insert(id.to_string(), status);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ProvisioningService for FakeProvisioner {
    async fn create(&self, spec: &ContextSpec) -> Result<ContextInfo> {
        let id = {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            format!("sbx_new{}", next)
        };
        self.record(format!("create {:?}", spec.ports));
        self.statuses
            .lock()
            .unwrap()
            .insert(id.clone(), ContextStatus::Running);
        Ok(ContextInfo {
            id,
            status: ContextStatus::Running,
        })
    }

    async fn get(&self, context_id: &str) -> Result<ContextInfo> {
        self.record(format!("get {}", context_id));
        if self.fail_get {
            return Err(Error::Provisioning("lookup failed".into()));
        }
        let status = self
            .statuses
            .lock()
            .unwrap()
            .get(context_id)
            .cloned()
            .ok_or_else(|| Error::Provisioning(format!("no sandbox {}", context_id)))?;
        Ok(ContextInfo {
            id: context_id.to_string(),
            status,
        })
    }

    async fn stop(&self, context_id: &str) -> Result<()> {
        self.record(format!("stop {}", context_id));
        self.statuses
            .lock()
            .unwrap()
            .insert(context_id.to_string(), ContextStatus::Stopped);
        Ok(())
    }

    async fn write_files(&self, context_id: &str, files: &[FileEntry]) -> Result<()> {
        let names: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
        self.record(format!("write {} {}", context_id, names.join(",")));
        Ok(())
    }

    async fn run_command(&self, context_id: &str, spec: &CommandSpec) -> Result<CommandHandle> {
        self.record(format!(
            "run {} {} {} detached={}",
            context_id,
            spec.cmd,
            spec.args.join(" "),
            spec.detached
        ));
        Ok(CommandHandle {
            id: format!("cmd_{}", spec.cmd),
            exit_code: if spec.detached {
                None
            } else {
                Some(self.install_exit_code)
            },
        })
    }

    async fn command_logs(&self, _context_id: &str, command: &CommandHandle) -> Result<Vec<LogLine>> {
        Ok(vec![LogLine {
            stream: LogStream::Stderr,
            data: format!("{} done\n", command.id),
        }])
    }

    async fn exposed_address(&self, context_id: &str, port: u16) -> Result<String> {
        self.record(format!("address {} {}", context_id, port));
        Ok(self.public_url.clone())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    sessions: Mutex<SessionMap>,
}

impl MemoryStore {
    pub fn with(sessions: SessionMap) -> Self {
        Self {
            sessions: Mutex::new(sessions),
        }
    }

    pub fn snapshot(&self) -> SessionMap {
        self.sessions.lock().unwrap().clone()
    }
}

impl SessionStore for MemoryStore {
    fn load(&self) -> Result<SessionMap> {
        Ok(self.sessions.lock().unwrap().clone())
    }

    fn save(&self, sessions: &SessionMap) -> Result<()> {
        *self.sessions.lock().unwrap() = sessions.clone();
        Ok(())
    }
}
