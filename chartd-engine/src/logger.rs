//! Session log sink for `log` actions and recoverable errors.

use crate::error::EngineError;
use chartd_core::{SessionId, Value};

pub trait Logger: Send + Sync {
    /// Output of a `log` action.
    fn log(&self, session_id: &SessionId, label: Option<&str>, value: &Value);

    /// A failure that was turned into an `error.*` event.
    fn execution_error(&self, session_id: &SessionId, error: &EngineError);

    /// A transition was taken. Off by default.
    fn transition(&self, _session_id: &SessionId, _source: &str, _event: Option<&str>) {}
}

/// Routes session output to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, session_id: &SessionId, label: Option<&str>, value: &Value) {
        tracing::info!(
            session_id = %session_id,
            label = label.unwrap_or(""),
            "{}",
            value
        );
    }

    fn execution_error(&self, session_id: &SessionId, error: &EngineError) {
        tracing::warn!(
            session_id = %session_id,
            code = error.error_code(),
            "{}",
            error
        );
    }

    fn transition(&self, session_id: &SessionId, source: &str, event: Option<&str>) {
        tracing::trace!(
            session_id = %session_id,
            source,
            event = event.unwrap_or(""),
            "transition"
        );
    }
}
