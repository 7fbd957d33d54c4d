//! Storage error types.

use chartd_core::CoreError;
use thiserror::Error;

/// Errors from the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("log error: {0}")]
    Log(#[from] chartd_log::LogError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("invalid state: {reason}")]
    InvalidState { reason: String },

    #[error("data corruption: {reason}")]
    Corruption { reason: String },
}

impl StorageError {
    pub(crate) fn invalid_state(reason: impl Into<String>) -> Self {
        StorageError::InvalidState {
            reason: reason.into(),
        }
    }

    pub(crate) fn corruption(reason: impl Into<String>) -> Self {
        StorageError::Corruption {
            reason: reason.into(),
        }
    }

    /// Returns an error code suitable for logs.
    pub fn error_code(&self) -> &'static str {
        match self {
            StorageError::Io(_) => "IO_ERROR",
            StorageError::Json(_) => "BAD_REQUEST",
            StorageError::Log(_) => "LOG_ERROR",
            StorageError::Core(e) => e.error_code(),
            StorageError::InvalidState { .. } => "INVALID_STATE",
            StorageError::Corruption { .. } => "DATA_CORRUPTION",
        }
    }
}

/// Converts a storage failure raised inside a change observer.
impl From<StorageError> for CoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Core(e) => e,
            StorageError::InvalidState { reason } => CoreError::InvalidState { reason },
            other => CoreError::Observer {
                reason: other.to_string(),
            },
        }
    }
}
