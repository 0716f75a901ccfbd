//! Session registry
//!
//! Maps a conversation (base session key + working directory) to the
//! backend session it is bound to, and persists that mapping so a restart
//! resumes the same backend sessions.

pub mod registry;
pub mod store;

pub use registry::SessionRegistry;
pub use store::{FileSessionStore, MemorySessionStore, SessionStore};

use crate::backend::BackendKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// One (base session key, working directory) binding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub base_key: String,
    pub working_dir: PathBuf,
    /// Backend the last prompt was routed to
    pub backend: BackendKind,
    /// Backend-native session ids, keyed by backend name
    #[serde(default)]
    pub backend_sessions: BTreeMap<String, String>,
    /// Creation time (Unix millis)
    pub created_at: i64,
    /// Last successful prompt (Unix millis)
    pub last_activity: i64,
}

impl Session {
    pub fn new(base_key: impl Into<String>, working_dir: impl Into<PathBuf>, backend: BackendKind) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            base_key: base_key.into(),
            working_dir: working_dir.into(),
            backend,
            backend_sessions: BTreeMap::new(),
            created_at: now,
            last_activity: now,
        }
    }

    /// Session id for the backend this session is currently routed to
    pub fn backend_session_id(&self) -> Option<&str> {
        self.backend_session_for(self.backend)
    }

    pub fn backend_session_for(&self, kind: BackendKind) -> Option<&str> {
        self.backend_sessions.get(kind.as_str()).map(String::as_str)
    }

    pub fn set_backend_session(&mut self, kind: BackendKind, id: impl Into<String>) {
        self.backend_sessions.insert(kind.as_str().to_string(), id.into());
    }

    pub fn touch(&mut self) {
        self.last_activity = chrono::Utc::now().timestamp_millis();
    }
}
