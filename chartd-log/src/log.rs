//! Main log implementation.

use crate::entry::{LogEntry, LogEntryType, LogRecord};
use crate::error::LogError;
use crate::file::LogFile;
use crate::recovery::recover;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Fsync policy for log writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsyncPolicy {
    /// Fsync after every record (safest, slowest).
    EveryWrite,
    /// Fsync when a checkpoint record is written.
    #[default]
    OnCheckpoint,
    /// Never fsync automatically (caller must call sync).
    Never,
}

impl std::str::FromStr for FsyncPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "every_write" | "always" => Ok(FsyncPolicy::EveryWrite),
            "on_checkpoint" | "checkpoint" => Ok(FsyncPolicy::OnCheckpoint),
            "never" => Ok(FsyncPolicy::Never),
            other => Err(format!("unknown fsync policy '{}'", other)),
        }
    }
}

/// Log configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Path of the log file.
    pub path: PathBuf,
    /// Fsync policy.
    pub fsync_policy: FsyncPolicy,
}

impl LogConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            fsync_policy: FsyncPolicy::default(),
        }
    }

    pub fn with_fsync_policy(mut self, policy: FsyncPolicy) -> Self {
        self.fsync_policy = policy;
        self
    }
}

/// I/O statistics for a log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogStats {
    pub bytes_written: u64,
    pub writes: u64,
    pub checkpoints: u64,
    pub fsyncs: u64,
    pub rewrites: u64,
}

/// Append-only log of bucket mutations.
///
/// Entries become visible to [`Log::read_entries`] only once a checkpoint
/// follows them. Recovery drops anything written after the last checkpoint.
pub struct Log {
    config: LogConfig,
    file: Mutex<LogFile>,
    next_sequence: AtomicU64,
    closed: AtomicBool,
    stats_bytes_written: AtomicU64,
    stats_writes: AtomicU64,
    stats_checkpoints: AtomicU64,
    stats_fsyncs: AtomicU64,
    stats_rewrites: AtomicU64,
}

impl Log {
    /// Opens or creates the log, recovering from torn or uncommitted writes.
    pub fn open(config: LogConfig) -> Result<Self, LogError> {
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let recovered = recover(&config.path, true)?;
        let mut file = LogFile::open_or_create(&config.path)?;

        let committed = recovered.committed_offset.unwrap_or(0);
        if file.size() > committed {
            tracing::warn!(
                "Discarding {} uncommitted bytes from log {}",
                file.size() - committed,
                config.path.display()
            );
            file.truncate_at(committed)?;
        }

        tracing::debug!(
            "Log opened: {} ({} records, next_sequence={})",
            config.path.display(),
            recovered.valid_records,
            recovered.max_sequence + 1
        );

        Ok(Self {
            file: Mutex::new(file),
            next_sequence: AtomicU64::new(recovered.max_sequence + 1),
            closed: AtomicBool::new(false),
            stats_bytes_written: AtomicU64::new(0),
            stats_writes: AtomicU64::new(0),
            stats_checkpoints: AtomicU64::new(0),
            stats_fsyncs: AtomicU64::new(0),
            stats_rewrites: AtomicU64::new(0),
            config,
        })
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Appends one entry, returning its sequence number.
    pub fn append(&self, entry: &LogEntry) -> Result<u64, LogError> {
        let mut file = self.file.lock();
        self.append_locked(&mut file, entry)
    }

    /// Appends the entries followed by a checkpoint, atomically with respect
    /// to recovery. Returns the checkpoint's sequence number.
    pub fn append_batch(&self, entries: &[LogEntry]) -> Result<u64, LogError> {
        let mut file = self.file.lock();
        for entry in entries {
            self.append_locked(&mut file, entry)?;
        }
        self.append_locked(&mut file, &LogEntry::Checkpoint)
    }

    /// Writes a checkpoint record, committing everything before it.
    pub fn checkpoint(&self) -> Result<u64, LogError> {
        self.append(&LogEntry::Checkpoint)
    }

    fn append_locked(&self, file: &mut LogFile, entry: &LogEntry) -> Result<u64, LogError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LogError::Closed);
        }

        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let record = LogRecord::from_entry(entry, sequence)?;
        file.append(&record)?;

        self.stats_bytes_written
            .fetch_add(record.disk_size() as u64, Ordering::Relaxed);
        self.stats_writes.fetch_add(1, Ordering::Relaxed);

        let is_checkpoint = record.header.entry_type == LogEntryType::Checkpoint;
        if is_checkpoint {
            self.stats_checkpoints.fetch_add(1, Ordering::Relaxed);
        }

        let should_sync = match self.config.fsync_policy {
            FsyncPolicy::EveryWrite => true,
            FsyncPolicy::OnCheckpoint => is_checkpoint,
            FsyncPolicy::Never => false,
        };
        if should_sync && file.sync()? {
            self.stats_fsyncs.fetch_add(1, Ordering::Relaxed);
        }

        Ok(sequence)
    }

    /// Forces a sync to disk.
    pub fn sync(&self) -> Result<(), LogError> {
        if self.file.lock().sync()? {
            self.stats_fsyncs.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Reads all committed entries in write order, checkpoints excluded.
    pub fn read_entries(&self) -> Result<Vec<LogEntry>, LogError> {
        let records = self.file.lock().read_all()?;

        let mut committed = Vec::new();
        let mut pending = Vec::new();
        for (_, record) in records {
            match record.entry()? {
                LogEntry::Checkpoint => committed.append(&mut pending),
                entry => pending.push(entry),
            }
        }
        Ok(committed)
    }

    /// Replaces the log's contents with `entries` plus a checkpoint.
    ///
    /// The new contents are written to a sibling file and renamed over the
    /// log, so a crash leaves either the old or the new file intact.
    pub fn rewrite(&self, entries: &[LogEntry]) -> Result<(), LogError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LogError::Closed);
        }

        let mut file = self.file.lock();
        let tmp_path = self.config.path.with_extension("clog.tmp");
        if tmp_path.exists() {
            std::fs::remove_file(&tmp_path)?;
        }

        let mut tmp = LogFile::create(&tmp_path)?;
        for entry in entries.iter().chain(std::iter::once(&LogEntry::Checkpoint)) {
            let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
            tmp.append(&LogRecord::from_entry(entry, sequence)?)?;
        }
        tmp.sync()?;
        drop(tmp);

        std::fs::rename(&tmp_path, &self.config.path)?;
        *file = LogFile::open(&self.config.path)?;

        self.stats_rewrites.fetch_add(1, Ordering::Relaxed);
        self.stats_fsyncs.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            "Rewrote log {} with {} entries",
            self.config.path.display(),
            entries.len()
        );
        Ok(())
    }

    /// Returns the current size of the log file in bytes.
    pub fn size(&self) -> u64 {
        self.file.lock().size()
    }

    /// Returns the next sequence number that will be assigned.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> LogStats {
        LogStats {
            bytes_written: self.stats_bytes_written.load(Ordering::Relaxed),
            writes: self.stats_writes.load(Ordering::Relaxed),
            checkpoints: self.stats_checkpoints.load(Ordering::Relaxed),
            fsyncs: self.stats_fsyncs.load(Ordering::Relaxed),
            rewrites: self.stats_rewrites.load(Ordering::Relaxed),
        }
    }

    /// Closes the log. Further appends fail with [`LogError::Closed`].
    pub fn close(&self) -> Result<(), LogError> {
        self.closed.store(true, Ordering::Release);
        self.sync()
    }
}
