//! Invoked services as seen by the host.

use crate::error::EngineError;
use async_trait::async_trait;
use chartd_core::{Event, SessionId, Value};

/// Something a session can invoke: another chart session or any external
/// service plugged in through a [`ServiceFactory`](crate::host::ServiceFactory).
#[async_trait]
pub trait Service: Send + Sync {
    /// Delivers an event to the service.
    async fn send(&self, event: Event) -> Result<(), EngineError>;

    /// Stops the service. Its result then resolves with a cancellation.
    async fn destroy(&self) -> Result<(), EngineError>;

    /// Waits for the service to finish.
    async fn result(&self) -> Result<Value, EngineError>;

    /// Releases whatever the service holds once the host no longer needs
    /// it. Called exactly once.
    async fn dispose(&self) {}

    /// The session behind the service, for services that are chart sessions.
    fn session_id(&self) -> Option<&SessionId> {
        None
    }
}
