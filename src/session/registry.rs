//! Per-key serialized session resolution

use super::store::{MemorySessionStore, SessionStore};
use super::Session;
use crate::backend::BackendKind;
use crate::error::Result;
use crate::identity::ConversationIdentity;
use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
struct KeySlot {
    loaded: bool,
    sessions: Vec<Session>,
}

/// Session registry.
///
/// Each base key owns an async mutex; resolution, updates, and resets for
/// one key are serialized while different keys proceed independently.
pub struct SessionRegistry {
    store: Arc<dyn SessionStore>,
    /// Per-key slots; DashMap for per-key locking
    slots: DashMap<String, Arc<Mutex<KeySlot>>>,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            store,
            slots: DashMap::new(),
        }
    }

    /// Registry that forgets everything on drop
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemorySessionStore::default()))
    }

    async fn lock(&self, base_key: &str) -> Result<OwnedMutexGuard<KeySlot>> {
        let slot = self
            .slots
            .entry(base_key.to_string())
            .or_default()
            .clone();
        let mut guard = slot.lock_owned().await;
        if !guard.loaded {
            guard.sessions = self.store.load(base_key)?;
            guard.loaded = true;
        }
        Ok(guard)
    }

    /// Create-or-fetch the session for (base key, working dir).
    ///
    /// Idempotent. When the conversation has been re-routed to another
    /// backend the existing session is kept and its backend updated.
    pub async fn resolve(
        &self,
        identity: &ConversationIdentity,
        working_dir: &Path,
        backend: BackendKind,
    ) -> Result<Session> {
        let base_key = identity.base_session_key();
        let mut slot = self.lock(&base_key).await?;

        if let Some(existing) = slot
            .sessions
            .iter_mut()
            .find(|s| s.working_dir == working_dir)
        {
            if existing.backend == backend {
                return Ok(existing.clone());
            }
            tracing::info!(
                session_key = %base_key,
                from = %existing.backend,
                to = %backend,
                "Session re-routed to another backend"
            );
            existing.backend = backend;
            let session = existing.clone();
            self.store.save(&base_key, &slot.sessions)?;
            return Ok(session);
        }

        let session = Session::new(base_key.clone(), working_dir, backend);
        slot.sessions.push(session.clone());
        self.store.save(&base_key, &slot.sessions)?;
        tracing::info!(
            session_key = %base_key,
            working_dir = %working_dir.display(),
            backend = %backend,
            "Session created"
        );
        Ok(session)
    }

    /// Bind a backend-native session id and bump activity.
    pub async fn record_backend_session_id(
        &self,
        session: &Session,
        backend_session_id: &str,
    ) -> Result<Session> {
        self.update(session, |s| {
            s.set_backend_session(session.backend, backend_session_id);
            s.touch();
        })
        .await
    }

    pub async fn touch(&self, session: &Session) -> Result<Session> {
        self.update(session, Session::touch).await
    }

    async fn update(&self, session: &Session, apply: impl FnOnce(&mut Session)) -> Result<Session> {
        let mut slot = self.lock(&session.base_key).await?;
        let index = match slot
            .sessions
            .iter()
            .position(|s| s.working_dir == session.working_dir)
        {
            Some(index) => index,
            None => {
                // Reset while a turn was in flight; re-create from the caller's copy.
                slot.sessions.push(session.clone());
                slot.sessions.len() - 1
            }
        };
        apply(&mut slot.sessions[index]);
        let updated = slot.sessions[index].clone();
        self.store.save(&session.base_key, &slot.sessions)?;
        Ok(updated)
    }

    pub async fn get(&self, base_key: &str, working_dir: &Path) -> Result<Option<Session>> {
        let slot = self.lock(base_key).await?;
        Ok(slot
            .sessions
            .iter()
            .find(|s| s.working_dir == working_dir)
            .cloned())
    }

    pub async fn list(&self, base_key: &str) -> Result<Vec<Session>> {
        Ok(self.lock(base_key).await?.sessions.clone())
    }

    /// Forget every session of a base key. Returns how many were removed.
    pub async fn reset(&self, base_key: &str) -> Result<usize> {
        let mut slot = self.lock(base_key).await?;
        let removed = slot.sessions.len();
        slot.sessions.clear();
        self.store.remove(base_key)?;
        tracing::info!(session_key = %base_key, removed, "Sessions reset");
        Ok(removed)
    }

    /// Warm the in-memory view from storage. Returns the number of sessions found.
    pub async fn preload(&self) -> Result<usize> {
        let sessions = self.store.load_all()?;
        let count = sessions.len();
        let mut by_key: std::collections::HashMap<String, Vec<Session>> =
            std::collections::HashMap::new();
        for session in sessions {
            by_key.entry(session.base_key.clone()).or_default().push(session);
        }
        for (key, sessions) in by_key {
            let slot = self.slots.entry(key).or_default().clone();
            let mut guard = slot.lock().await;
            if !guard.loaded {
                guard.sessions = sessions;
                guard.loaded = true;
            }
        }
        tracing::info!(count, "Sessions restored");
        Ok(count)
    }
}
