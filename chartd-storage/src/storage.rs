//! Transactional key/value storage behind buckets.
//!
//! Keys are sequences of [`KeyPart`]s ordered lexicographically, so a key and
//! everything nested beneath it form one contiguous range.

use crate::error::StorageError;
use chartd_log::{FsyncPolicy, KeyPart, Log, LogConfig, LogEntry, StoredValue};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Ordered key/value store with subtree removal.
///
/// Writes are visible immediately. [`Storage::checkpoint`] makes everything
/// written so far durable as one unit; [`Storage::shrink`] compacts the
/// durable representation.
pub trait Storage: Send + Sync {
    fn get(&self, key: &[KeyPart]) -> Option<StoredValue>;

    fn put(&self, key: Vec<KeyPart>, value: StoredValue);

    /// Removes `key` and every key it prefixes.
    fn remove_subtree(&self, key: &[KeyPart]);

    fn checkpoint(&self) -> Result<(), StorageError>;

    fn shrink(&self) -> Result<(), StorageError>;

    /// All entries in key order.
    fn entries(&self) -> Vec<(Vec<KeyPart>, StoredValue)>;
}

type KeyMap = BTreeMap<Vec<KeyPart>, StoredValue>;

fn remove_prefixed(map: &mut KeyMap, prefix: &[KeyPart]) -> usize {
    let doomed: Vec<Vec<KeyPart>> = map
        .range(prefix.to_vec()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, _)| k.clone())
        .collect();
    for key in &doomed {
        map.remove(key);
    }
    doomed.len()
}

/// Storage kept entirely in memory.
#[derive(Default)]
pub struct MemoryStorage {
    map: RwLock<KeyMap>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &[KeyPart]) -> Option<StoredValue> {
        self.map.read().get(key).cloned()
    }

    fn put(&self, key: Vec<KeyPart>, value: StoredValue) {
        self.map.write().insert(key, value);
    }

    fn remove_subtree(&self, key: &[KeyPart]) {
        remove_prefixed(&mut self.map.write(), key);
    }

    fn checkpoint(&self) -> Result<(), StorageError> {
        Ok(())
    }

    fn shrink(&self) -> Result<(), StorageError> {
        Ok(())
    }

    fn entries(&self) -> Vec<(Vec<KeyPart>, StoredValue)> {
        self.map
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Storage that keeps nothing. Used when persistence is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStorage;

impl Storage for NullStorage {
    fn get(&self, _key: &[KeyPart]) -> Option<StoredValue> {
        None
    }

    fn put(&self, _key: Vec<KeyPart>, _value: StoredValue) {}

    fn remove_subtree(&self, _key: &[KeyPart]) {}

    fn checkpoint(&self) -> Result<(), StorageError> {
        Ok(())
    }

    fn shrink(&self) -> Result<(), StorageError> {
        Ok(())
    }

    fn entries(&self) -> Vec<(Vec<KeyPart>, StoredValue)> {
        Vec::new()
    }
}

/// Storage backed by a [`Log`] file.
///
/// The current state lives in memory; mutations are buffered and appended
/// to the log as one batch at each checkpoint.
pub struct FileStorage {
    map: RwLock<KeyMap>,
    pending: Mutex<Vec<LogEntry>>,
    log: Log,
}

impl FileStorage {
    /// Opens the log at `path` and replays its committed entries.
    pub fn open(path: impl Into<PathBuf>, fsync_policy: FsyncPolicy) -> Result<Self, StorageError> {
        let log = Log::open(LogConfig::new(path).with_fsync_policy(fsync_policy))?;

        let mut map = KeyMap::new();
        for entry in log.read_entries()? {
            match entry {
                LogEntry::Put { key, value } => {
                    map.insert(key, value);
                }
                LogEntry::RemoveSubtree { key } => {
                    remove_prefixed(&mut map, &key);
                }
                LogEntry::Checkpoint => {}
            }
        }

        tracing::debug!(
            path = %log.path().display(),
            keys = map.len(),
            "file storage opened"
        );

        Ok(Self {
            map: RwLock::new(map),
            pending: Mutex::new(Vec::new()),
            log,
        })
    }

    pub fn log(&self) -> &Log {
        &self.log
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &[KeyPart]) -> Option<StoredValue> {
        self.map.read().get(key).cloned()
    }

    fn put(&self, key: Vec<KeyPart>, value: StoredValue) {
        let mut pending = self.pending.lock();
        self.map.write().insert(key.clone(), value.clone());
        pending.push(LogEntry::Put { key, value });
    }

    fn remove_subtree(&self, key: &[KeyPart]) {
        let mut pending = self.pending.lock();
        if remove_prefixed(&mut self.map.write(), key) > 0 {
            pending.push(LogEntry::RemoveSubtree { key: key.to_vec() });
        }
    }

    fn checkpoint(&self) -> Result<(), StorageError> {
        let mut pending = self.pending.lock();
        if pending.is_empty() {
            return Ok(());
        }
        self.log.append_batch(&pending)?;
        pending.clear();
        Ok(())
    }

    fn shrink(&self) -> Result<(), StorageError> {
        let mut pending = self.pending.lock();
        let entries: Vec<LogEntry> = self
            .map
            .read()
            .iter()
            .map(|(key, value)| LogEntry::Put {
                key: key.clone(),
                value: value.clone(),
            })
            .collect();
        self.log.rewrite(&entries)?;
        pending.clear();
        Ok(())
    }

    fn entries(&self) -> Vec<(Vec<KeyPart>, StoredValue)> {
        self.map
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
