//! Durable session storage
//!
//! One JSON file per base session key:
//! ```text
//! ~/.a3s-remote/sessions/
//! ├── slack_C024BE91L_1700000000.000100.json
//! └── telegram_42.json
//! ```

use super::Session;
use crate::error::{RemoteError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Trait for persisting the sessions of one base key
pub trait SessionStore: Send + Sync {
    /// Replace all sessions stored for `base_key`
    fn save(&self, base_key: &str, sessions: &[Session]) -> Result<()>;

    /// Sessions stored for `base_key` (empty when none)
    fn load(&self, base_key: &str) -> Result<Vec<Session>>;

    fn remove(&self, base_key: &str) -> Result<()>;

    /// Every stored session
    fn load_all(&self) -> Result<Vec<Session>>;
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionFile {
    base_key: String,
    sessions: Vec<Session>,
}

/// JSON-file store, written atomically via temp file + rename
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_path(&self, base_key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", encode_key(base_key)))
    }

    fn read_file(path: &Path) -> Result<Option<SessionFile>> {
        if !path.exists() {
            return Ok(None);
        }
        let json = std::fs::read_to_string(path).map_err(|e| {
            RemoteError::Store(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let file = serde_json::from_str(&json).map_err(|e| {
            RemoteError::Store(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        Ok(Some(file))
    }
}

impl SessionStore for FileSessionStore {
    fn save(&self, base_key: &str, sessions: &[Session]) -> Result<()> {
        let path = self.file_path(base_key);
        let file = SessionFile {
            base_key: base_key.to_string(),
            sessions: sessions.to_vec(),
        };
        let json = serde_json::to_string_pretty(&file)?;

        std::fs::create_dir_all(&self.dir).map_err(|e| {
            RemoteError::Store(format!(
                "Failed to create session directory {}: {}",
                self.dir.display(),
                e
            ))
        })?;

        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, json).map_err(|e| {
            RemoteError::Store(format!("Failed to write {}: {}", tmp_path.display(), e))
        })?;
        std::fs::rename(&tmp_path, &path).map_err(|e| {
            RemoteError::Store(format!(
                "Failed to rename {} → {}: {}",
                tmp_path.display(),
                path.display(),
                e
            ))
        })?;

        tracing::debug!(base_key, count = sessions.len(), "Sessions saved");
        Ok(())
    }

    fn load(&self, base_key: &str) -> Result<Vec<Session>> {
        let path = self.file_path(base_key);
        match Self::read_file(&path)? {
            Some(file) if file.base_key == base_key => Ok(file
                .sessions
                .into_iter()
                .filter(|s| s.base_key == base_key)
                .collect()),
            Some(file) => {
                tracing::warn!(
                    base_key,
                    stored = %file.base_key,
                    path = %path.display(),
                    "Session file belongs to another key, ignoring"
                );
                Ok(Vec::new())
            }
            None => Ok(Vec::new()),
        }
    }

    fn remove(&self, base_key: &str) -> Result<()> {
        let path = self.file_path(base_key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RemoteError::Store(format!(
                "Failed to remove {}: {}",
                path.display(),
                e
            ))),
        }
    }

    fn load_all(&self) -> Result<Vec<Session>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(RemoteError::Store(format!(
                    "Failed to read session directory {}: {}",
                    self.dir.display(),
                    e
                )))
            }
        };

        let mut sessions = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_file(&path) {
                Ok(Some(file)) => sessions.extend(file.sessions),
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "Skipping unreadable session file"),
            }
        }
        Ok(sessions)
    }
}

/// In-memory store for tests and ephemeral deployments
#[derive(Default)]
pub struct MemorySessionStore {
    state: std::sync::RwLock<HashMap<String, Vec<Session>>>,
}

impl SessionStore for MemorySessionStore {
    fn save(&self, base_key: &str, sessions: &[Session]) -> Result<()> {
        let mut state = self
            .state
            .write()
            .map_err(|e| RemoteError::Store(format!("Failed to acquire store lock: {}", e)))?;
        state.insert(base_key.to_string(), sessions.to_vec());
        Ok(())
    }

    fn load(&self, base_key: &str) -> Result<Vec<Session>> {
        let state = self
            .state
            .read()
            .map_err(|e| RemoteError::Store(format!("Failed to acquire store lock: {}", e)))?;
        Ok(state.get(base_key).cloned().unwrap_or_default())
    }

    fn remove(&self, base_key: &str) -> Result<()> {
        let mut state = self
            .state
            .write()
            .map_err(|e| RemoteError::Store(format!("Failed to acquire store lock: {}", e)))?;
        state.remove(base_key);
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<Session>> {
        let state = self
            .state
            .read()
            .map_err(|e| RemoteError::Store(format!("Failed to acquire store lock: {}", e)))?;
        Ok(state.values().flatten().cloned().collect())
    }
}

/// Base keys come from chat platforms. Filename-safe characters pass
/// through and every other byte becomes `%XX`, so distinct keys never
/// share a file.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'_' | b'-' | b'.') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}
