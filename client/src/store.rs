//! Persistent local port to session mapping.
//!
//! Stored as one JSON document in the temp directory:
//! `{"localPortToSession": {"3000": {"id": "sbx_..", "createdAt": 1700000000000}}}`.
//! Read-modify-write cycles hold an advisory lock on a sibling `.lock`
//! file so concurrent invocations for the same port serialize.

use burrow_shared::Result;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// Remote context id
    pub id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

pub type SessionMap = BTreeMap<u16, SessionRecord>;

pub trait SessionStore: Send + Sync {
    fn load(&self) -> Result<SessionMap>;

    fn save(&self, sessions: &SessionMap) -> Result<()>;

    /// Read, modify, and write back as one step
    fn update(&self, f: &mut dyn FnMut(&mut SessionMap)) -> Result<()> {
        let mut sessions = self.load()?;
        f(&mut sessions);
        self.save(&sessions)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionFile {
    #[serde(default)]
    local_port_to_session: SessionMap,
}

pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn default_path() -> PathBuf {
        std::env::temp_dir().join("burrow-sessions.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".lock");
        self.path.with_file_name(name)
    }

    fn lock(&self) -> Result<std::fs::File> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.lock_path())?;
        FileExt::lock_exclusive(&file)?;
        Ok(file)
    }
}

impl Default for FileSessionStore {
    fn default() -> Self {
        Self::new(Self::default_path())
    }
}

impl SessionStore for FileSessionStore {
    /// A missing or corrupt file is an empty mapping
    fn load(&self) -> Result<SessionMap> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(SessionMap::new()),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str::<SessionFile>(&content) {
            Ok(file) => Ok(file.local_port_to_session),
            Err(e) => {
                warn!("Ignoring unreadable session file {}: {}", self.path.display(), e);
                Ok(SessionMap::new())
            }
        }
    }

    fn save(&self, sessions: &SessionMap) -> Result<()> {
        let file = SessionFile {
            local_port_to_session: sessions.clone(),
        };
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&file)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn update(&self, f: &mut dyn FnMut(&mut SessionMap)) -> Result<()> {
        let lock = self.lock()?;
        let mut sessions = self.load()?;
        f(&mut sessions);
        let saved = self.save(&sessions);
        FileExt::unlock(&lock)?;
        saved
    }
}
