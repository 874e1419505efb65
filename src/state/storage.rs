//! Storage backends for persisted state.
//!
//! The state layer only needs `get_item` / `set_item` over opaque string
//! blobs, so anything from an in-memory map to a userscript-manager API can
//! back it.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::trace;

/// Errors raised by storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Filesystem failure.
    #[error("Storage I/O error for {key}: {source}")]
    Io {
        /// Key being read or written.
        key: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The backend refused the operation.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Key-value blob storage.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Reads the blob stored under `key`, `None` if absent.
    async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Stores `value` under `key`, replacing any previous blob.
    async fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;
}

/// In-memory storage. Contents are lost when dropped.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: RwLock<HashMap<String, String>>,
    failing: AtomicBool,
}

impl MemoryStorage {
    /// Creates empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent operation fail with [`StorageError::Unavailable`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Raw blob, bypassing the async interface.
    pub fn raw(&self, key: &str) -> Option<String> {
        self.items.read().get(key).cloned()
    }

    /// Writes a raw blob, bypassing the async interface.
    pub fn insert_raw(&self, key: &str, value: &str) {
        self.items
            .write()
            .insert(key.to_string(), value.to_string());
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("memory storage is failing".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.check()?;
        Ok(self.items.read().get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.check()?;
        self.items
            .write()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Directory-backed storage: one `<key>.json` file per key.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Storage rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Root directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File backing `key`.
    pub fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.json", name))
    }
}

#[async_trait]
impl StorageBackend for FileStorage {
    async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        let path = self.path_for(key);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                trace!("Read {} from {}", key, path.display());
                Ok(Some(contents))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StorageError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let io_error = |source| StorageError::Io {
            key: key.to_string(),
            source,
        };
        tokio::fs::create_dir_all(&self.dir).await.map_err(io_error)?;
        let path = self.path_for(key);
        tokio::fs::write(&path, value).await.map_err(io_error)?;
        trace!("Wrote {} to {}", key, path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_memory_storage() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.get_item("a").await.unwrap(), None);
        storage.set_item("a", "1").await.unwrap();
        assert_eq!(storage.get_item("a").await.unwrap().as_deref(), Some("1"));

        storage.set_failing(true);
        assert!(matches!(
            storage.set_item("a", "2").await,
            Err(StorageError::Unavailable(_))
        ));
        assert_eq!(storage.raw("a").as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_file_storage_round_trip() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path().join("nested"));

        assert_eq!(storage.get_item("mk-feature-global").await.unwrap(), None);
        storage
            .set_item("mk-feature-global", r#"{"enabled":true}"#)
            .await
            .unwrap();
        assert_eq!(
            storage.get_item("mk-feature-global").await.unwrap().as_deref(),
            Some(r#"{"enabled":true}"#)
        );
        assert!(storage.path_for("mk-feature-global").exists());
    }

    #[test]
    fn test_file_names_are_sanitised() {
        let storage = FileStorage::new("/tmp/x");
        assert_eq!(
            storage.path_for("a/b:c"),
            PathBuf::from("/tmp/x/a_b_c.json")
        );
    }
}
