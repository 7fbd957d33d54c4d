//! Hierarchical key/value buckets.

use crate::storage::{MemoryStorage, Storage};
use chartd_log::{KeyPart, StoredValue};
use std::fmt;
use std::sync::Arc;

/// A view of a [`Storage`] scoped under a key prefix.
///
/// The bucket's own prefix is its root key: [`Bucket::set_root`] stores a
/// value there and [`Bucket::remove_all`] drops it together with everything
/// nested beneath.
#[derive(Clone)]
pub struct Bucket {
    storage: Arc<dyn Storage>,
    prefix: Vec<KeyPart>,
}

impl Bucket {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            prefix: Vec::new(),
        }
    }

    /// A bucket over fresh in-memory storage.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStorage::new()))
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn prefix(&self) -> &[KeyPart] {
        &self.prefix
    }

    fn key(&self, key: KeyPart) -> Vec<KeyPart> {
        let mut full = Vec::with_capacity(self.prefix.len() + 1);
        full.extend_from_slice(&self.prefix);
        full.push(key);
        full
    }

    /// Child bucket scoped under `key`.
    pub fn nested(&self, key: impl Into<KeyPart>) -> Bucket {
        Bucket {
            storage: self.storage.clone(),
            prefix: self.key(key.into()),
        }
    }

    pub fn add(&self, key: impl Into<KeyPart>, value: impl Into<StoredValue>) {
        self.storage.put(self.key(key.into()), value.into());
    }

    pub fn try_get(&self, key: impl Into<KeyPart>) -> Option<StoredValue> {
        self.storage.get(&self.key(key.into()))
    }

    pub fn get_i64(&self, key: impl Into<KeyPart>) -> Option<i64> {
        self.try_get(key).and_then(|v| v.as_i64())
    }

    pub fn get_bool(&self, key: impl Into<KeyPart>) -> Option<bool> {
        self.try_get(key).and_then(|v| v.as_bool())
    }

    pub fn get_f64(&self, key: impl Into<KeyPart>) -> Option<f64> {
        self.try_get(key).and_then(|v| v.as_f64())
    }

    pub fn get_string(&self, key: impl Into<KeyPart>) -> Option<String> {
        match self.try_get(key) {
            Some(StoredValue::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn set_root(&self, value: impl Into<StoredValue>) {
        self.storage.put(self.prefix.clone(), value.into());
    }

    pub fn get_root(&self) -> Option<StoredValue> {
        self.storage.get(&self.prefix)
    }

    /// Removes `key` and everything nested beneath it.
    pub fn remove_subtree(&self, key: impl Into<KeyPart>) {
        self.storage.remove_subtree(&self.key(key.into()));
    }

    /// Removes the root key and everything in this bucket.
    pub fn remove_all(&self) {
        self.storage.remove_subtree(&self.prefix);
    }

    /// Whether anything is stored at or beneath the root key.
    pub fn is_empty(&self) -> bool {
        !self
            .storage
            .entries()
            .iter()
            .any(|(k, _)| k.starts_with(&self.prefix))
    }
}

impl fmt::Debug for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path: Vec<String> = self.prefix.iter().map(|p| p.to_string()).collect();
        f.debug_struct("Bucket").field("prefix", &path.join("/")).finish()
    }
}
