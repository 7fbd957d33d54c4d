//! Outgoing events, invoke requests and the interface a session uses to
//! reach the outside world.

use crate::error::EngineError;
use crate::queue::EventQueue;
use async_trait::async_trait;
use chartd_core::{CoreError, Event, EventName, EventType, InvokeId, InvokeUniqueId, SendId, SessionId, Value};
use std::time::Duration;

/// Event processor type of chart sessions.
pub const SCXML_EVENT_PROCESSOR: &str = "http://www.w3.org/TR/scxml/#SCXMLEventProcessor";
/// Invoke type of chart sessions.
pub const SCXML_INVOKE_TYPE: &str = "http://www.w3.org/TR/scxml/";
/// Short name accepted for both of the above.
pub const SCXML_ALIAS: &str = "scxml";

pub const INTERNAL_TARGET: &str = "#_internal";
pub const PARENT_TARGET: &str = "#_parent";
const SESSION_TARGET_PREFIX: &str = "#_scxml_";
const INVOKE_TARGET_PREFIX: &str = "#_";

/// Address of a top-level session.
pub fn session_target(session_id: &SessionId) -> String {
    format!("{}{}", SESSION_TARGET_PREFIX, session_id)
}

/// Address of an invoked service, relative to its parent session.
pub fn invoke_target(invoke_id: &InvokeId) -> String {
    format!("{}{}", INVOKE_TARGET_PREFIX, invoke_id)
}

/// A parsed send target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target<'a> {
    Internal,
    Parent,
    Session(SessionId),
    Invoke(InvokeId),
    Other(&'a str),
}

impl<'a> Target<'a> {
    pub fn parse(target: &'a str) -> Self {
        if target == INTERNAL_TARGET {
            Target::Internal
        } else if target == PARENT_TARGET {
            Target::Parent
        } else if let Some(session) = target.strip_prefix(SESSION_TARGET_PREFIX) {
            Target::Session(SessionId::from(session))
        } else if let Some(invoke) = target.strip_prefix(INVOKE_TARGET_PREFIX) {
            Target::Invoke(InvokeId::from(invoke))
        } else {
            Target::Other(target)
        }
    }
}

/// An event produced by a `send` action.
#[derive(Debug, Clone)]
pub struct OutgoingEvent {
    pub name: EventName,
    /// `None` addresses the sending session itself.
    pub target: Option<String>,
    /// Event processor type; `None` means the chart processor.
    pub processor: Option<String>,
    pub send_id: Option<SendId>,
    pub delay: Duration,
    pub data: Value,
}

impl OutgoingEvent {
    pub fn new(name: EventName) -> Self {
        Self {
            name,
            target: None,
            processor: None,
            send_id: None,
            delay: Duration::ZERO,
            data: Value::Undefined,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_send_id(mut self, send_id: SendId) -> Self {
        self.send_id = Some(send_id);
        self
    }

    pub fn is_internal(&self) -> bool {
        self.target.as_deref() == Some(INTERNAL_TARGET)
    }

    /// Builds the event delivered to the target, stamped with its origin.
    pub fn to_event(&self, origin: &SessionId) -> Event {
        let kind = if self.is_internal() {
            EventType::Internal
        } else {
            EventType::External
        };
        let mut event = Event::new(self.name.clone(), kind)
            .with_data(self.data.clone())
            .with_origin(session_target(origin), SCXML_EVENT_PROCESSOR);
        event.send_id = self.send_id.clone();
        event
    }
}

/// How a send was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Delivered to the target.
    Sent,
    /// The sender must put the event on its own internal queue.
    ToInternalQueue,
    /// Delayed; the sender must schedule it and dispatch it later.
    ToSchedule,
}

/// Applies the routing rules that do not depend on the registry.
/// `Ok(None)` means the event must be delivered to its target now.
pub(crate) fn classify(event: &OutgoingEvent) -> Result<Option<SendStatus>, EngineError> {
    match event.processor.as_deref() {
        None | Some(SCXML_EVENT_PROCESSOR) | Some(SCXML_ALIAS) => {}
        Some(other) => {
            return Err(EngineError::UnknownEventProcessor {
                processor: other.to_string(),
            })
        }
    }
    if !event.delay.is_zero() {
        if event.is_internal() {
            return Err(EngineError::invalid_argument(
                "internal events cannot be delayed",
            ));
        }
        return Ok(Some(SendStatus::ToSchedule));
    }
    if event.is_internal() {
        return Ok(Some(SendStatus::ToInternalQueue));
    }
    Ok(None)
}

/// Everything needed to start an invoked service.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub invoke_id: InvokeId,
    pub unique_id: InvokeUniqueId,
    pub invoke_type: String,
    /// Location of the service definition.
    pub source: Option<String>,
    /// Inline service definition.
    pub content: Option<Value>,
    /// Named parameters, read-only.
    pub params: Value,
}

/// The session's view of the host.
#[async_trait]
pub trait ExternalCommunication: Send + Sync {
    async fn send_event(&self, event: OutgoingEvent) -> Result<SendStatus, EngineError>;

    async fn start_invoke(&self, request: InvokeRequest) -> Result<(), EngineError>;

    /// Stops an invoked service, or releases one that already completed.
    async fn cancel_invoke(&self, invoke_id: &InvokeId) -> Result<(), EngineError>;

    async fn forward_event(&self, invoke_id: &InvokeId, event: Event) -> Result<(), EngineError>;
}

/// Communication for sessions running without a host: only the session
/// itself is reachable.
pub struct DetachedCommunication {
    session_id: SessionId,
    queue: EventQueue,
}

impl DetachedCommunication {
    pub fn new(session_id: SessionId, queue: EventQueue) -> Self {
        Self { session_id, queue }
    }
}

#[async_trait]
impl ExternalCommunication for DetachedCommunication {
    async fn send_event(&self, event: OutgoingEvent) -> Result<SendStatus, EngineError> {
        if let Some(status) = classify(&event)? {
            return Ok(status);
        }
        match event.target.as_deref().map(Target::parse) {
            None => {}
            Some(Target::Session(id)) if id == self.session_id => {}
            Some(_) => {
                return Err(EngineError::unknown_target(
                    event.target.clone().unwrap_or_default(),
                ))
            }
        }
        self.queue.send(event.to_event(&self.session_id))?;
        Ok(SendStatus::Sent)
    }

    async fn start_invoke(&self, request: InvokeRequest) -> Result<(), EngineError> {
        Err(EngineError::UnknownInvokeType {
            invoke_type: request.invoke_type,
        })
    }

    async fn cancel_invoke(&self, _invoke_id: &InvokeId) -> Result<(), EngineError> {
        Ok(())
    }

    async fn forward_event(&self, invoke_id: &InvokeId, _event: Event) -> Result<(), EngineError> {
        Err(EngineError::unknown_target(invoke_target(invoke_id)))
    }
}

/// Parses a delay such as `500ms`, `2s` or `1.5s`. A bare number is read as
/// milliseconds.
pub fn parse_delay(text: &str) -> Result<Duration, CoreError> {
    let text = text.trim();
    let invalid = || CoreError::InvalidArgument {
        reason: format!("invalid delay '{}'", text),
    };
    let (number, scale) = if let Some(ms) = text.strip_suffix("ms") {
        (ms, 0.001)
    } else if let Some(s) = text.strip_suffix('s') {
        (s, 1.0)
    } else {
        (text, 0.001)
    };
    let amount: f64 = number.trim().parse().map_err(|_| invalid())?;
    if !amount.is_finite() || amount < 0.0 {
        return Err(invalid());
    }
    Duration::try_from_secs_f64(amount * scale).map_err(|_| invalid())
}
