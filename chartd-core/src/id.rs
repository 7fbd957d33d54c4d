//! Opaque identifiers for sessions, invokes and sends.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Creates a fresh random identifier.
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().simple().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Identifies one running chart instance.
    SessionId
);

string_id!(
    /// Identifies an invoked service within its parent session.
    InvokeId
);

string_id!(
    /// Distinguishes successive invocations that reuse an invoke id.
    InvokeUniqueId
);

string_id!(
    /// Identifies an outgoing event, used for cancellation and correlation.
    SendId
);

impl InvokeId {
    /// Builds the platform-generated id `<state>.<random>`.
    pub fn for_state(state_id: &str) -> Self {
        Self(format!("{}.{}", state_id, uuid::Uuid::new_v4().simple()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
    }

    #[test]
    fn test_invoke_id_for_state() {
        let id = InvokeId::for_state("loading");
        assert!(id.as_str().starts_with("loading."));
    }

    #[test]
    fn test_serde_transparent() {
        let id = SendId::new("s-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"s-1\"");
    }
}
