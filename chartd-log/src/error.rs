//! Log error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Checksum mismatch. Recovery truncates the log here.
    #[error("corrupt record at offset {offset}: crc32c {actual:#x}, stored {expected:#x}")]
    CorruptedRecord {
        offset: u64,
        expected: u32,
        actual: u32,
    },

    #[error("bad record header at offset {offset}: {reason}")]
    InvalidHeader { offset: u64, reason: String },

    #[error("record payload of {size} bytes exceeds the {max} byte limit")]
    RecordTooLarge { size: usize, max: usize },

    #[error("log is closed")]
    Closed,

    #[error("record payload encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

impl LogError {
    /// Whether the error describes damaged log contents rather than a
    /// failing device or a misuse of the log.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            LogError::CorruptedRecord { .. }
                | LogError::InvalidHeader { .. }
                | LogError::RecordTooLarge { .. }
        )
    }
}
