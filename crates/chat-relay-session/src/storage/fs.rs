//! Filesystem credential storage.
//!
//! Layout: `<root>/<session id>/creds.json`. One directory per session so
//! that purging a session is a single recursive delete.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use chat_relay_core::{
    CredentialStore, Credentials, SessionId,
    traits::StorageError,
};
use tokio::fs;

const CREDS_FILE: &str = "creds.json";
const CREDS_TMP_FILE: &str = "creds.json.tmp";

/// Directory-per-session credential store.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    root: PathBuf,
}

impl FileCredentialStore {
    /// Create a store rooted at `root`. The directory is created lazily.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding a session's credentials.
    #[must_use]
    pub fn session_dir(&self, id: &SessionId) -> PathBuf {
        self.root.join(id.as_str())
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load_or_create(&self, id: &SessionId) -> Result<Credentials, StorageError> {
        let path = self.session_dir(id).join(CREDS_FILE);
        match fs::read(&path).await {
            Ok(bytes) => {
                serde_json::from_slice(&bytes).map_err(|e| StorageError::Malformed(id.clone(), e))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let credentials = Credentials::fresh();
                self.save(id, &credentials).await?;
                tracing::debug!(session_id = %id, path = %path.display(), "Created credentials");
                Ok(credentials)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, id: &SessionId, credentials: &Credentials) -> Result<(), StorageError> {
        let dir = self.session_dir(id);
        fs::create_dir_all(&dir).await?;

        let json = serde_json::to_vec_pretty(credentials)
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        // Rename is atomic: readers see the old file or the new one, never a partial write.
        let tmp = dir.join(CREDS_TMP_FILE);
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, dir.join(CREDS_FILE)).await?;
        Ok(())
    }

    async fn purge(&self, id: &SessionId) -> Result<(), StorageError> {
        match fs::remove_dir_all(self.session_dir(id)).await {
            Ok(()) => {
                tracing::info!(session_id = %id, "Purged credentials");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<SessionId>, StorageError> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|name| SessionId::new(name).ok())
            else {
                continue;
            };
            if fs::try_exists(entry.path().join(CREDS_FILE)).await? {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(s: &str) -> SessionId {
        SessionId::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_load_or_create_persists_fresh_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path());

        let created = store.load_or_create(&sid("bot-1")).await.unwrap();
        assert!(store.session_dir(&sid("bot-1")).join(CREDS_FILE).is_file());

        let loaded = store.load_or_create(&sid("bot-1")).await.unwrap();
        assert_eq!(created, loaded);
    }

    #[tokio::test]
    async fn test_save_roundtrips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path());

        let mut credentials = store.load_or_create(&sid("bot-1")).await.unwrap();
        credentials.register("15550001111:2@s.whatsapp.net");
        credentials
            .keys
            .insert("noiseKey".into(), serde_json::json!({ "public": "abc" }));
        store.save(&sid("bot-1"), &credentials).await.unwrap();

        let reopened = FileCredentialStore::new(dir.path());
        assert_eq!(reopened.load_or_create(&sid("bot-1")).await.unwrap(), credentials);
        assert!(!store.session_dir(&sid("bot-1")).join(CREDS_TMP_FILE).exists());
    }

    #[tokio::test]
    async fn test_purge_removes_directory_and_tolerates_absence() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path());

        store.load_or_create(&sid("bot-1")).await.unwrap();
        std::fs::write(store.session_dir(&sid("bot-1")).join("pre-key-1.json"), b"{}").unwrap();

        tokio_test::assert_ok!(store.purge(&sid("bot-1")).await);
        assert!(!store.session_dir(&sid("bot-1")).exists());
        tokio_test::assert_ok!(store.purge(&sid("bot-1")).await);
        tokio_test::assert_ok!(store.purge(&sid("never-seen")).await);
    }

    #[tokio::test]
    async fn test_malformed_credentials_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path());
        let session_dir = store.session_dir(&sid("bot-1"));
        std::fs::create_dir_all(&session_dir).unwrap();
        std::fs::write(session_dir.join(CREDS_FILE), b"not json").unwrap();

        let err = store.load_or_create(&sid("bot-1")).await.unwrap_err();
        assert!(matches!(err, StorageError::Malformed(..)));
    }

    #[tokio::test]
    async fn test_list_skips_foreign_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path());
        assert!(store.list().await.unwrap().is_empty());

        store.load_or_create(&sid("b")).await.unwrap();
        store.load_or_create(&sid("a")).await.unwrap();
        std::fs::create_dir_all(dir.path().join("empty-dir")).unwrap();
        std::fs::write(dir.path().join("stray.txt"), b"x").unwrap();

        assert_eq!(store.list().await.unwrap(), vec![sid("a"), sid("b")]);
    }

    #[tokio::test]
    async fn test_list_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().join("not-created"));
        assert!(store.list().await.unwrap().is_empty());
    }
}
