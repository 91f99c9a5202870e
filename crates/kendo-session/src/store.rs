//! Credential persistence.
//!
//! The credential is kept as two string entries of a [`KeyValueStore`]: the
//! token and its expiry as decimal text. Any other session-scoped value
//! (artifacts such as the selected UI language) lives in the same backend and
//! is wiped together with the credential on [`CredentialStore::clear`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::credential::Credential;
use crate::error::StoreError;

/// Key of the persisted token.
pub const TOKEN_KEY: &str = "jwt";

/// Key of the persisted expiry (epoch milliseconds as text).
pub const EXPIRY_KEY: &str = "jwt_expires";

/// Durable string key/value backend.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.set_many(&[(key, value)]).await
    }

    /// Write every entry or none of them.
    async fn set_many(&self, entries: &[(&str, &str)]) -> Result<(), StoreError>;

    async fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Remove every entry.
    async fn clear(&self) -> Result<(), StoreError>;
}

/// In-process backend.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set_many(&self, entries: &[(&str, &str)]) -> Result<(), StoreError> {
        let mut map = self.entries.lock();
        for (key, value) in entries {
            map.insert(key.to_string(), value.to_string());
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.entries.lock().clear();
        Ok(())
    }
}

/// Backend persisting all entries as one JSON object on disk.
///
/// Writes go to a sibling temporary file that is then renamed over the
/// target, so a crash never leaves a half-written document behind.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    // Serialises read-modify-write cycles.
    write_lock: tokio::sync::Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<HashMap<String, String>, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(HashMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, entries: &HashMap<String, String>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let bytes = serde_json::to_vec_pretty(entries)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let _guard = self.write_lock.lock().await;
        Ok(self.load().await?.remove(key))
    }

    async fn set_many(&self, entries: &[(&str, &str)]) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut stored = self.load().await?;
        for (key, value) in entries {
            stored.insert(key.to_string(), value.to_string());
        }
        self.save(&stored).await
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.load().await?;
        if entries.remove(key).is_some() {
            self.save(&entries).await?;
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Holder of the current credential and the session-scoped artifacts.
///
/// Cheap to clone; clones share the same backend.
#[derive(Clone)]
pub struct CredentialStore {
    backend: Arc<dyn KeyValueStore>,
}

impl CredentialStore {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self { backend }
    }

    /// Store backed by a fresh [`MemoryStore`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Persist `credential`, replacing any previous one.
    pub async fn set(&self, credential: &Credential) -> Result<(), StoreError> {
        if credential.token.is_empty() {
            return Err(StoreError::EmptyToken);
        }
        let expires_at = credential.expires_at.to_string();
        self.backend
            .set_many(&[
                (TOKEN_KEY, credential.token.as_str()),
                (EXPIRY_KEY, expires_at.as_str()),
            ])
            .await?;
        debug!(expires_at = credential.expires_at, "Credential persisted");
        Ok(())
    }

    /// The last persisted credential, if any.
    pub async fn get(&self) -> Result<Option<Credential>, StoreError> {
        let token = match self.backend.get(TOKEN_KEY).await? {
            Some(token) if !token.is_empty() => token,
            _ => return Ok(None),
        };

        let Some(raw_expiry) = self.backend.get(EXPIRY_KEY).await? else {
            warn!("Persisted token has no expiry; ignoring it");
            return Ok(None);
        };

        match raw_expiry.trim().parse::<i64>() {
            Ok(expires_at) => Ok(Some(Credential { token, expires_at })),
            Err(e) => {
                warn!(expiry = %raw_expiry, error = %e, "Persisted expiry is not a timestamp; ignoring it");
                Ok(None)
            }
        }
    }

    /// Remove the credential and every other session-scoped value.
    pub async fn clear(&self) -> Result<(), StoreError> {
        self.backend.clear().await?;
        debug!("Session store cleared");
        Ok(())
    }

    /// Store a session-scoped value that must not outlive the session.
    pub async fn set_artifact(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.backend.set(key, value).await
    }

    pub async fn artifact(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.backend.get(key).await
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore").finish_non_exhaustive()
    }
}
