//! Core error types.

use thiserror::Error;

/// Errors from the value model, event naming and chart definitions.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("modification denied: {reason}")]
    ModificationDenied { reason: String },

    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error("invalid state: {reason}")]
    InvalidState { reason: String },

    #[error("invalid chart definition: {reason}")]
    InvalidDefinition { reason: String },

    #[error("invalid expression: {reason}")]
    InvalidExpression { reason: String },

    #[error("expression not supported by this data model: {expression}")]
    UnsupportedExpression { expression: String },

    #[error("evaluation failed: {reason}")]
    Evaluation { reason: String },

    #[error("change observer failed: {reason}")]
    Observer { reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    pub(crate) fn denied(reason: impl Into<String>) -> Self {
        CoreError::ModificationDenied {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_argument(reason: impl Into<String>) -> Self {
        CoreError::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Returns an error code suitable for logs and error events.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::ModificationDenied { .. } => "MODIFICATION_DENIED",
            CoreError::InvalidArgument { .. } => "INVALID_ARGUMENT",
            CoreError::InvalidState { .. } => "INVALID_STATE",
            CoreError::InvalidDefinition { .. } => "INVALID_DEFINITION",
            CoreError::InvalidExpression { .. } => "INVALID_EXPRESSION",
            CoreError::UnsupportedExpression { .. } => "UNSUPPORTED_EXPRESSION",
            CoreError::Evaluation { .. } => "EVALUATION_FAILED",
            CoreError::Observer { .. } => "OBSERVER_FAILED",
            CoreError::Json(_) => "BAD_REQUEST",
        }
    }

    /// Returns whether a running chart can turn this error into an
    /// `error.execution` event instead of failing.
    pub fn is_execution_error(&self) -> bool {
        matches!(
            self,
            CoreError::ModificationDenied { .. }
                | CoreError::InvalidArgument { .. }
                | CoreError::InvalidExpression { .. }
                | CoreError::UnsupportedExpression { .. }
                | CoreError::Evaluation { .. }
                | CoreError::Json(_)
        )
    }
}
