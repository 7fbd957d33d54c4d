//! Storage providers hand out one [`Storage`] per (partition, key).
//!
//! The engine keeps each session's state in its own storage, partitioned by
//! chart so a host can drop everything belonging to one chart at once.

use crate::error::StorageError;
use crate::storage::{FileStorage, MemoryStorage, NullStorage, Storage};
use chartd_log::{FsyncPolicy, LOG_EXTENSION};
use dashmap::DashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub trait StorageProvider: Send + Sync {
    /// Opens (or creates) the storage for `key` within `partition`.
    fn open(&self, partition: &str, key: &str) -> Result<Arc<dyn Storage>, StorageError>;

    /// Deletes one storage. Missing storages are not an error.
    fn remove(&self, partition: &str, key: &str) -> Result<(), StorageError>;

    /// Deletes every storage in `partition`.
    fn remove_all(&self, partition: &str) -> Result<(), StorageError>;
}

/// Provider for hosts without persistence.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStorageProvider;

impl StorageProvider for NullStorageProvider {
    fn open(&self, _partition: &str, _key: &str) -> Result<Arc<dyn Storage>, StorageError> {
        Ok(Arc::new(NullStorage))
    }

    fn remove(&self, _partition: &str, _key: &str) -> Result<(), StorageError> {
        Ok(())
    }

    fn remove_all(&self, _partition: &str) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Process-local provider. Reopening a key returns the same storage, which
/// lets a session be resumed within one process.
#[derive(Default)]
pub struct MemoryStorageProvider {
    storages: DashMap<(String, String), Arc<MemoryStorage>>,
}

impl MemoryStorageProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of open storages across all partitions.
    pub fn len(&self) -> usize {
        self.storages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storages.is_empty()
    }

    pub fn contains(&self, partition: &str, key: &str) -> bool {
        self.storages
            .contains_key(&(partition.to_string(), key.to_string()))
    }
}

impl StorageProvider for MemoryStorageProvider {
    fn open(&self, partition: &str, key: &str) -> Result<Arc<dyn Storage>, StorageError> {
        let storage = self
            .storages
            .entry((partition.to_string(), key.to_string()))
            .or_insert_with(|| Arc::new(MemoryStorage::new()))
            .clone();
        Ok(storage)
    }

    fn remove(&self, partition: &str, key: &str) -> Result<(), StorageError> {
        self.storages
            .remove(&(partition.to_string(), key.to_string()));
        Ok(())
    }

    fn remove_all(&self, partition: &str) -> Result<(), StorageError> {
        self.storages.retain(|(p, _), _| p != partition);
        Ok(())
    }
}

/// Provider writing one log file per key under `<dir>/<partition>/`.
pub struct FileStorageProvider {
    dir: PathBuf,
    fsync_policy: FsyncPolicy,
}

impl FileStorageProvider {
    /// Creates the provider, creating `dir` if needed.
    pub fn new(dir: impl Into<PathBuf>, fsync_policy: FsyncPolicy) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, fsync_policy })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn partition_dir(&self, partition: &str) -> PathBuf {
        self.dir.join(sanitize(partition))
    }

    fn file_path(&self, partition: &str, key: &str) -> PathBuf {
        self.partition_dir(partition)
            .join(format!("{}.{}", sanitize(key), LOG_EXTENSION))
    }
}

impl StorageProvider for FileStorageProvider {
    fn open(&self, partition: &str, key: &str) -> Result<Arc<dyn Storage>, StorageError> {
        fs::create_dir_all(self.partition_dir(partition))?;
        let storage = FileStorage::open(self.file_path(partition, key), self.fsync_policy)?;
        Ok(Arc::new(storage))
    }

    fn remove(&self, partition: &str, key: &str) -> Result<(), StorageError> {
        let path = self.file_path(partition, key);
        match fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "removed storage file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn remove_all(&self, partition: &str) -> Result<(), StorageError> {
        match fs::remove_dir_all(self.partition_dir(partition)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Maps an arbitrary name to a single safe path component.
fn sanitize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for b in name.bytes() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' => out.push(b as char),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    if out.is_empty() {
        out.push('_');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chartd_log::{KeyPart, StoredValue};
    use tempfile::TempDir;

    fn key(name: &str) -> Vec<KeyPart> {
        vec![KeyPart::from(name)]
    }

    #[test]
    fn test_memory_provider_returns_same_storage() {
        let provider = MemoryStorageProvider::new();
        let a = provider.open("chart", "s1").unwrap();
        a.put(key("x"), StoredValue::Int(1));

        let again = provider.open("chart", "s1").unwrap();
        assert_eq!(again.get(&key("x")), Some(StoredValue::Int(1)));

        let other = provider.open("chart", "s2").unwrap();
        assert_eq!(other.get(&key("x")), None);
        assert_eq!(provider.len(), 2);
    }

    #[test]
    fn test_memory_provider_remove_all() {
        let provider = MemoryStorageProvider::new();
        provider.open("a", "1").unwrap();
        provider.open("a", "2").unwrap();
        provider.open("b", "1").unwrap();

        provider.remove_all("a").unwrap();
        assert!(!provider.contains("a", "1"));
        assert!(provider.contains("b", "1"));

        provider.remove("b", "1").unwrap();
        assert!(provider.is_empty());
    }

    #[test]
    fn test_file_provider_persists_checkpointed_data() {
        let dir = TempDir::new().unwrap();
        let provider = FileStorageProvider::new(dir.path(), FsyncPolicy::Never).unwrap();
        {
            let storage = provider.open("orders", "session/1").unwrap();
            storage.put(key("state"), StoredValue::Str("open".into()));
            storage.checkpoint().unwrap();
        }

        let storage = provider.open("orders", "session/1").unwrap();
        assert_eq!(
            storage.get(&key("state")),
            Some(StoredValue::Str("open".into()))
        );
        assert!(dir.path().join("orders").join("session%2F1.clog").exists());
    }

    #[test]
    fn test_file_provider_remove() {
        let dir = TempDir::new().unwrap();
        let provider = FileStorageProvider::new(dir.path(), FsyncPolicy::Never).unwrap();
        provider.open("p", "k").unwrap();
        assert!(provider.file_path("p", "k").exists());

        provider.remove("p", "k").unwrap();
        assert!(!provider.file_path("p", "k").exists());
        provider.remove("p", "k").unwrap();

        provider.open("p", "k").unwrap();
        provider.remove_all("p").unwrap();
        assert!(!dir.path().join("p").exists());
        provider.remove_all("p").unwrap();
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("abc-1_2"), "abc-1_2");
        assert_eq!(sanitize("a.b"), "a%2Eb");
        assert_eq!(sanitize(""), "_");
    }
}
