//! # chartd-log
//!
//! Append-only record log for chartd's durable bucket storage.
//!
//! Each log file holds the mutations of one storage key:
//! - Per-record CRC32C checksums for corruption detection
//! - Monotonic sequence numbers
//! - Configurable fsync policies
//! - Recovery that truncates torn writes at the tail
//! - Whole-file rewrite for compaction

pub mod entry;
pub mod error;
pub mod file;
pub mod log;
pub mod recovery;

pub use entry::{KeyPart, LogEntry, LogEntryType, LogRecord, StoredValue};
pub use error::LogError;
pub use file::LogFile;
pub use log::{FsyncPolicy, Log, LogConfig, LogStats};
pub use recovery::{recover, RecoveryResult};

/// Log record header size in bytes.
pub const RECORD_HEADER_SIZE: usize = 24;

/// File extension of log files.
pub const LOG_EXTENSION: &str = "clog";
