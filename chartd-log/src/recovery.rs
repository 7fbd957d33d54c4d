//! Log recovery.
//!
//! A crash can leave a partially written record at the end of a file.
//! Recovery scans forward, stops at the first record that does not decode
//! and optionally truncates everything after the last good record.

use crate::entry::{LogEntryType, LogRecord};
use crate::error::LogError;
use crate::file::LogFile;
use bytes::BytesMut;
use std::io::Read;
use std::path::Path;

/// Result of a recovery scan.
#[derive(Debug, Clone, Default)]
pub struct RecoveryResult {
    /// Number of valid records found.
    pub valid_records: u64,
    /// Whether an undecodable record stopped the scan.
    pub corrupted: bool,
    /// Bytes after the last valid record.
    pub bytes_truncated: u64,
    /// Maximum sequence number found.
    pub max_sequence: u64,
    /// End offset of the last checkpoint record, if any.
    pub committed_offset: Option<u64>,
}

/// Scans the log at `path`, truncating the torn tail when `repair` is set.
pub fn recover(path: impl AsRef<Path>, repair: bool) -> Result<RecoveryResult, LogError> {
    let path = path.as_ref();
    let mut result = RecoveryResult::default();
    if !path.exists() {
        return Ok(result);
    }

    let mut bytes = Vec::new();
    std::fs::File::open(path)?.read_to_end(&mut bytes)?;
    let file_size = bytes.len() as u64;
    let mut buf = BytesMut::from(&bytes[..]);

    let mut offset = 0u64;
    loop {
        match LogRecord::decode(&mut buf, offset) {
            Ok(Some(record)) => {
                result.valid_records += 1;
                result.max_sequence = result.max_sequence.max(record.header.sequence);
                offset += record.disk_size() as u64;
                if record.header.entry_type == LogEntryType::Checkpoint {
                    result.committed_offset = Some(offset);
                }
            }
            Ok(None) => break,
            Err(e) if e.is_corruption() => {
                tracing::warn!(path = %path.display(), offset, error = %e, "undecodable log record");
                result.corrupted = true;
                break;
            }
            Err(e) => return Err(e),
        }
    }

    result.bytes_truncated = file_size - offset;

    if repair && result.bytes_truncated > 0 {
        LogFile::open(path)?.truncate_at(offset)?;
        tracing::warn!(
            "Truncated log {} at offset {} (removed {} bytes)",
            path.display(),
            offset,
            result.bytes_truncated
        );
    }

    Ok(result)
}
