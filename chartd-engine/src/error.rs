//! Engine error types.

use chartd_core::{CoreError, Map, Value};
use chartd_storage::StorageError;
use thiserror::Error;

/// Errors from the interpreter, session controllers and the host.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("session not found: {session_id}")]
    UnknownSession { session_id: String },

    #[error("session already exists: {session_id}")]
    DuplicateSession { session_id: String },

    #[error("unknown target: {target}")]
    UnknownTarget { target: String },

    #[error("unknown invoke type: {invoke_type}")]
    UnknownInvokeType { invoke_type: String },

    #[error("unknown event processor: {processor}")]
    UnknownEventProcessor { processor: String },

    #[error("unknown data model: {datamodel}")]
    UnknownDataModel { datamodel: String },

    #[error("unknown custom action: {namespace}:{name}")]
    UnknownCustomAction { namespace: String, name: String },

    #[error("session limit reached ({limit})")]
    TooManySessions { limit: usize },

    #[error("failed to load resource '{uri}': {reason}")]
    Resource { uri: String, reason: String },

    #[error("session cancelled")]
    Cancelled,

    #[error("session halted")]
    Halted,

    #[error("session suspended")]
    Suspended,

    #[error("event queue closed")]
    QueueClosed,

    #[error("{code}: {reason}")]
    Faulted { code: &'static str, reason: String },

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl EngineError {
    pub(crate) fn unknown_target(target: impl Into<String>) -> Self {
        EngineError::UnknownTarget {
            target: target.into(),
        }
    }

    pub(crate) fn invalid_argument(reason: impl Into<String>) -> Self {
        EngineError::Core(CoreError::InvalidArgument {
            reason: reason.into(),
        })
    }

    pub(crate) fn invalid_state(reason: impl Into<String>) -> Self {
        EngineError::Core(CoreError::InvalidState {
            reason: reason.into(),
        })
    }

    /// Returns an error code suitable for logs and error event payloads.
    pub fn error_code(&self) -> &'static str {
        match self {
            EngineError::UnknownSession { .. } => "UNKNOWN_SESSION",
            EngineError::DuplicateSession { .. } => "DUPLICATE_SESSION",
            EngineError::UnknownTarget { .. } => "UNKNOWN_TARGET",
            EngineError::UnknownInvokeType { .. } => "UNKNOWN_INVOKE_TYPE",
            EngineError::UnknownEventProcessor { .. } => "UNKNOWN_EVENT_PROCESSOR",
            EngineError::UnknownDataModel { .. } => "UNKNOWN_DATA_MODEL",
            EngineError::UnknownCustomAction { .. } => "UNKNOWN_CUSTOM_ACTION",
            EngineError::TooManySessions { .. } => "TOO_MANY_SESSIONS",
            EngineError::Resource { .. } => "RESOURCE_ERROR",
            EngineError::Cancelled => "CANCELLED",
            EngineError::Halted => "HALTED",
            EngineError::Suspended => "SUSPENDED",
            EngineError::QueueClosed => "QUEUE_CLOSED",
            EngineError::Faulted { code, .. } => *code,
            EngineError::Core(e) => e.error_code(),
            EngineError::Storage(e) => e.error_code(),
        }
    }

    /// Returns whether a running chart turns this error into an `error.*`
    /// event instead of failing the session.
    pub fn is_recoverable(&self) -> bool {
        match self {
            EngineError::UnknownSession { .. }
            | EngineError::UnknownTarget { .. }
            | EngineError::UnknownInvokeType { .. }
            | EngineError::UnknownEventProcessor { .. }
            | EngineError::UnknownCustomAction { .. }
            | EngineError::Resource { .. }
            | EngineError::Faulted { .. } => true,
            EngineError::Core(e) => e.is_execution_error(),
            _ => false,
        }
    }

    /// Whether the failure is a delivery problem (`error.communication`)
    /// rather than an execution problem (`error.execution`).
    pub fn is_communication(&self) -> bool {
        matches!(
            self,
            EngineError::UnknownSession { .. } | EngineError::UnknownTarget { .. }
        )
    }

    /// Whether the session ended because of a stop, suspend or destroy
    /// signal rather than a fault.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            EngineError::Cancelled | EngineError::Halted | EngineError::Suspended
        )
    }

    /// Copies an error that has to be reported to several waiters.
    /// Errors carrying non-cloneable sources are flattened to `Faulted`.
    pub fn duplicate(&self) -> EngineError {
        match self {
            EngineError::UnknownSession { session_id } => EngineError::UnknownSession {
                session_id: session_id.clone(),
            },
            EngineError::DuplicateSession { session_id } => EngineError::DuplicateSession {
                session_id: session_id.clone(),
            },
            EngineError::UnknownTarget { target } => EngineError::unknown_target(target.clone()),
            EngineError::UnknownInvokeType { invoke_type } => EngineError::UnknownInvokeType {
                invoke_type: invoke_type.clone(),
            },
            EngineError::UnknownEventProcessor { processor } => {
                EngineError::UnknownEventProcessor {
                    processor: processor.clone(),
                }
            }
            EngineError::UnknownDataModel { datamodel } => EngineError::UnknownDataModel {
                datamodel: datamodel.clone(),
            },
            EngineError::UnknownCustomAction { namespace, name } => {
                EngineError::UnknownCustomAction {
                    namespace: namespace.clone(),
                    name: name.clone(),
                }
            }
            EngineError::TooManySessions { limit } => EngineError::TooManySessions { limit: *limit },
            EngineError::Resource { uri, reason } => EngineError::Resource {
                uri: uri.clone(),
                reason: reason.clone(),
            },
            EngineError::Cancelled => EngineError::Cancelled,
            EngineError::Halted => EngineError::Halted,
            EngineError::Suspended => EngineError::Suspended,
            EngineError::QueueClosed => EngineError::QueueClosed,
            EngineError::Faulted { code, reason } => EngineError::Faulted {
                code: *code,
                reason: reason.clone(),
            },
            EngineError::Core(_) | EngineError::Storage(_) => EngineError::Faulted {
                code: self.error_code(),
                reason: self.to_string(),
            },
        }
    }

    /// Read-only payload used for `error.*` events.
    pub fn to_value(&self) -> Value {
        let map = Map::from_pairs([
            ("code".to_string(), Value::from(self.error_code())),
            ("message".to_string(), Value::from(self.to_string())),
        ]);
        Value::Map(map).as_constant()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(EngineError::QueueClosed.error_code(), "QUEUE_CLOSED");
        assert_eq!(
            EngineError::unknown_target("#_nowhere").error_code(),
            "UNKNOWN_TARGET"
        );
        assert_eq!(
            EngineError::invalid_argument("bad").error_code(),
            "INVALID_ARGUMENT"
        );
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(EngineError::unknown_target("x").is_recoverable());
        assert!(EngineError::unknown_target("x").is_communication());
        assert!(EngineError::invalid_argument("x").is_recoverable());
        assert!(!EngineError::invalid_argument("x").is_communication());
        assert!(!EngineError::invalid_state("x").is_recoverable());
        assert!(!EngineError::Cancelled.is_recoverable());
        assert!(EngineError::Halted.is_cancellation());
        assert!(!EngineError::QueueClosed.is_cancellation());
    }

    #[test]
    fn test_duplicate_flattens_sources() {
        let err = EngineError::invalid_state("refcount underflow");
        let copy = err.duplicate();
        assert_eq!(copy.error_code(), "INVALID_STATE");
        assert!(copy.to_string().contains("refcount underflow"));
        assert!(matches!(
            EngineError::Suspended.duplicate(),
            EngineError::Suspended
        ));
    }

    #[test]
    fn test_to_value_is_read_only() {
        let value = EngineError::QueueClosed.to_value();
        assert!(value.is_read_only());
        let map = value.as_map().unwrap();
        assert_eq!(map.get("code"), Value::from("QUEUE_CLOSED"));
    }
}
