//! In-memory credential storage.

use std::{collections::HashMap, sync::RwLock};

use async_trait::async_trait;
use chat_relay_core::{
    CredentialStore, Credentials, SessionId,
    traits::StorageError,
};

/// In-memory storage implementation.
///
/// Useful for development and tests.
/// Data is lost on restart, so every session must pair again.
pub struct MemoryCredentialStore {
    credentials: RwLock<HashMap<SessionId, Credentials>>,
}

impl MemoryCredentialStore {
    /// Create a new in-memory storage.
    #[must_use]
    pub fn new() -> Self {
        Self {
            credentials: RwLock::new(HashMap::new()),
        }
    }

    /// Credentials currently held for a session, without creating any.
    ///
    /// # Errors
    /// Returns error if the lock is poisoned.
    pub fn get(&self, id: &SessionId) -> Result<Option<Credentials>, StorageError> {
        Ok(self
            .credentials
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .get(id)
            .cloned())
    }
}

impl Default for MemoryCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load_or_create(&self, id: &SessionId) -> Result<Credentials, StorageError> {
        let mut credentials = self
            .credentials
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        Ok(credentials
            .entry(id.clone())
            .or_insert_with(Credentials::fresh)
            .clone())
    }

    async fn save(&self, id: &SessionId, credentials: &Credentials) -> Result<(), StorageError> {
        self.credentials
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .insert(id.clone(), credentials.clone());

        Ok(())
    }

    async fn purge(&self, id: &SessionId) -> Result<(), StorageError> {
        self.credentials
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .remove(id);

        Ok(())
    }

    async fn list(&self) -> Result<Vec<SessionId>, StorageError> {
        let credentials = self
            .credentials
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        let mut ids: Vec<SessionId> = credentials.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
