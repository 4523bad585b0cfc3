//! Durable key/value storage for small pieces of client state.
//!
//! Values are plain strings (usually JSON). The file store keeps one file per
//! key inside a state directory and replaces it atomically on write.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Errors raised by a key/value store
#[derive(Error, Debug)]
pub enum KvError {
    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// String key/value store
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a value, `None` when the key was never written
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Write a value, replacing any previous one
    async fn set(&self, key: &str, value: &str) -> Result<(), KvError>;

    /// Remove a value; removing a missing key is not an error
    async fn remove(&self, key: &str) -> Result<(), KvError>;
}

/// File-backed store, one file per key
pub struct FileKvStore {
    dir: PathBuf,
}

impl FileKvStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, KvError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !key.starts_with('.');
        if !valid {
            return Err(KvError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

#[async_trait]
impl KvStore for FileKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let path = self.path_for(key)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        let path = self.path_for(key)?;
        tokio::fs::create_dir_all(&self.dir).await?;

        // Write beside the target, then rename over it
        let tmp = self.dir.join(format!(".{key}.{}.tmp", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, value).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        debug!(key = %key, bytes = value.len(), "Stored value");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), KvError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process store for tests and platforms without a writable disk
#[derive(Default)]
pub struct MemoryKvStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        Ok(self.values.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), KvError> {
        self.values.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = FileKvStore::new(dir.path().join("state"));

        assert_eq!(store.get("rows-v1").await.unwrap(), None);

        store.set("rows-v1", "[1,2,3]").await.unwrap();
        assert_eq!(store.get("rows-v1").await.unwrap().as_deref(), Some("[1,2,3]"));

        store.set("rows-v1", "[]").await.unwrap();
        assert_eq!(store.get("rows-v1").await.unwrap().as_deref(), Some("[]"));

        store.remove("rows-v1").await.unwrap();
        assert_eq!(store.get("rows-v1").await.unwrap(), None);

        // Removing twice is fine
        store.remove("rows-v1").await.unwrap();
    }

    #[tokio::test]
    async fn test_file_store_rejects_path_keys() {
        let dir = TempDir::new().unwrap();
        let store = FileKvStore::new(dir.path());

        assert!(matches!(
            store.set("../escape", "x").await,
            Err(KvError::InvalidKey(_))
        ));
        assert!(matches!(store.get("").await, Err(KvError::InvalidKey(_))));
        assert!(matches!(store.get(".hidden").await, Err(KvError::InvalidKey(_))));
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryKvStore::new();
        store.set("clientId", "abc").await.unwrap();
        assert_eq!(store.get("clientId").await.unwrap().as_deref(), Some("abc"));
        store.remove("clientId").await.unwrap();
        assert_eq!(store.get("clientId").await.unwrap(), None);
    }
}
