//! Session Persistence
//!
//! The session manager persists every session after each applied command
//! and reloads sessions it has not seen since startup. Storage is a
//! collaborator behind [`SessionStore`]; the encoding is the store's
//! business.

pub mod file;

use std::collections::BTreeMap;
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::game::session::{Session, SessionKey};

pub use file::FileStore;

/// Store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No session under this key.
    #[error("Session {0} not found")]
    NotFound(SessionKey),

    /// Underlying I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored data could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Durable session storage.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load a session.
    async fn load(&self, key: &SessionKey) -> Result<Session, StoreError>;

    /// Save a session, replacing any previous version.
    async fn save(&self, session: &Session) -> Result<(), StoreError>;

    /// Keys of every stored session.
    async fn list_keys(&self) -> Result<Vec<SessionKey>, StoreError>;

    /// Delete a session. Deleting a missing session is not an error.
    async fn remove(&self, key: &SessionKey) -> Result<(), StoreError>;
}

/// In-memory store for tests and throwaway servers.
#[derive(Default)]
pub struct MemoryStore {
    sessions: RwLock<BTreeMap<SessionKey, Session>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Is the store empty?
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn load(&self, key: &SessionKey) -> Result<Session, StoreError> {
        self.sessions
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    async fn save(&self, session: &Session) -> Result<(), StoreError> {
        self.sessions
            .write()
            .await
            .insert(session.key.clone(), session.clone());
        Ok(())
    }

    async fn list_keys(&self) -> Result<Vec<SessionKey>, StoreError> {
        Ok(self.sessions.read().await.keys().cloned().collect())
    }

    async fn remove(&self, key: &SessionKey) -> Result<(), StoreError> {
        self.sessions.write().await.remove(key);
        Ok(())
    }
}
