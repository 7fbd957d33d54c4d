//! Events and hierarchical event names.
//!
//! An event name is a dot-separated sequence of identifiers such as
//! `done.invoke.worker`. Transitions select events through
//! [`EventDescriptor`]s: a descriptor matches a name with exactly the same
//! segments, and a trailing `*` segment matches any remaining suffix.

use crate::error::CoreError;
use crate::id::{InvokeId, InvokeUniqueId, SendId};
use crate::map::Map;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One segment of an event name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier(String);

impl Identifier {
    pub fn new(segment: impl Into<String>) -> Result<Self, CoreError> {
        let segment = segment.into();
        if segment.is_empty() {
            return Err(CoreError::invalid_argument("empty name segment"));
        }
        if segment.contains('.') || segment.chars().any(char::is_whitespace) {
            return Err(CoreError::invalid_argument(format!(
                "invalid name segment '{}'",
                segment
            )));
        }
        Ok(Self(segment))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A non-empty, dot-separated event name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventName {
    parts: Vec<Identifier>,
}

impl EventName {
    pub const DONE_STATE: &'static str = "done.state";
    pub const DONE_INVOKE: &'static str = "done.invoke";
    pub const ERROR_INVOKE: &'static str = "error.invoke";
    pub const ERROR_EXECUTION: &'static str = "error.execution";
    pub const ERROR_COMMUNICATION: &'static str = "error.communication";
    pub const ERROR_PLATFORM: &'static str = "error.platform";
    pub const CANCEL_INVOKE: &'static str = "cancel.invoke";

    /// Splits `name` on `.`. Empty names and empty segments are rejected.
    pub fn to_parts(name: &str) -> Result<Vec<Identifier>, CoreError> {
        if name.is_empty() {
            return Err(CoreError::invalid_argument("event name is empty"));
        }
        name.split('.').map(Identifier::new).collect()
    }

    /// Joins segments with `.`; the inverse of [`EventName::to_parts`].
    pub fn to_name(parts: &[Identifier]) -> String {
        let mut name = String::new();
        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                name.push('.');
            }
            name.push_str(part.as_str());
        }
        name
    }

    pub fn parse(name: &str) -> Result<Self, CoreError> {
        Ok(Self {
            parts: Self::to_parts(name)?,
        })
    }

    pub fn from_parts(parts: Vec<Identifier>) -> Result<Self, CoreError> {
        if parts.is_empty() {
            return Err(CoreError::invalid_argument("event name has no segments"));
        }
        Ok(Self { parts })
    }

    pub fn parts(&self) -> &[Identifier] {
        &self.parts
    }

    // Reserved families: the prefix is a constant, the suffix comes from a
    // validated state or invoke id. Empty suffix segments are dropped.
    fn reserved(prefix: &str, suffix: &str) -> Self {
        let parts = prefix
            .split('.')
            .chain(suffix.split('.'))
            .filter(|s| !s.is_empty())
            .map(|s| Identifier(s.split_whitespace().collect::<Vec<_>>().join("_")))
            .collect();
        Self { parts }
    }

    pub fn done_state(state_id: &str) -> Self {
        Self::reserved(Self::DONE_STATE, state_id)
    }

    pub fn done_invoke(invoke_id: &InvokeId) -> Self {
        Self::reserved(Self::DONE_INVOKE, invoke_id.as_str())
    }

    pub fn error_invoke(invoke_id: &InvokeId) -> Self {
        Self::reserved(Self::ERROR_INVOKE, invoke_id.as_str())
    }

    pub fn cancel_invoke(invoke_id: &InvokeId) -> Self {
        Self::reserved(Self::CANCEL_INVOKE, invoke_id.as_str())
    }

    pub fn error_execution() -> Self {
        Self::reserved(Self::ERROR_EXECUTION, "")
    }

    pub fn error_communication() -> Self {
        Self::reserved(Self::ERROR_COMMUNICATION, "")
    }

    pub fn error_platform() -> Self {
        Self::reserved(Self::ERROR_PLATFORM, "")
    }

    /// Whether the name begins with the dotted `prefix`.
    pub fn starts_with(&self, prefix: &str) -> bool {
        let prefix: Vec<&str> = prefix.split('.').collect();
        prefix.len() <= self.parts.len()
            && prefix
                .iter()
                .zip(self.parts.iter())
                .all(|(p, part)| *p == part.as_str())
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&Self::to_name(&self.parts))
    }
}

impl TryFrom<String> for EventName {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<EventName> for String {
    fn from(name: EventName) -> Self {
        name.to_string()
    }
}

/// Event selector used by transitions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventDescriptor {
    parts: Vec<String>,
    wildcard: bool,
}

impl EventDescriptor {
    /// Parses `a.b`, `a.b.*` or `*`.
    pub fn parse(text: &str) -> Result<Self, CoreError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(CoreError::invalid_argument("event descriptor is empty"));
        }
        let mut parts: Vec<String> = text.split('.').map(str::to_string).collect();
        let wildcard = parts.last().map(|p| p == "*").unwrap_or(false);
        if wildcard {
            parts.pop();
        }
        for part in &parts {
            Identifier::new(part.as_str())?;
            if part == "*" {
                return Err(CoreError::invalid_argument(format!(
                    "wildcard must be the last segment in '{}'",
                    text
                )));
            }
        }
        Ok(Self { parts, wildcard })
    }

    /// Parses a space-separated descriptor list, as found on transitions.
    pub fn parse_list(text: &str) -> Result<Vec<Self>, CoreError> {
        text.split_whitespace().map(Self::parse).collect()
    }

    pub fn matches(&self, name: &EventName) -> bool {
        let event = name.parts();
        if self.wildcard {
            self.parts.len() <= event.len()
                && self
                    .parts
                    .iter()
                    .zip(event.iter())
                    .all(|(d, e)| d == e.as_str())
        } else {
            self.parts.len() == event.len()
                && self
                    .parts
                    .iter()
                    .zip(event.iter())
                    .all(|(d, e)| d == e.as_str())
        }
    }
}

impl fmt::Display for EventDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut text = self.parts.join(".");
        if self.wildcard {
            if !text.is_empty() {
                text.push('.');
            }
            text.push('*');
        }
        f.write_str(&text)
    }
}

/// Where an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Raised by the chart itself (`raise`, `send` to `#_internal`).
    Internal,
    /// Delivered through the session queue.
    External,
    /// Generated by the platform (errors, done events).
    Platform,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Internal => "internal",
            EventType::External => "external",
            EventType::Platform => "platform",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "internal" => Some(EventType::Internal),
            "external" => Some(EventType::External),
            "platform" => Some(EventType::Platform),
            _ => None,
        }
    }
}

/// An immutable event. The payload is frozen on construction.
#[derive(Debug, Clone)]
pub struct Event {
    pub name: EventName,
    pub kind: EventType,
    pub data: Value,
    pub send_id: Option<SendId>,
    pub invoke_id: Option<InvokeId>,
    pub invoke_unique_id: Option<InvokeUniqueId>,
    pub origin: Option<String>,
    pub origin_type: Option<String>,
}

impl Event {
    pub fn new(name: EventName, kind: EventType) -> Self {
        Self {
            name,
            kind,
            data: Value::Undefined,
            send_id: None,
            invoke_id: None,
            invoke_unique_id: None,
            origin: None,
            origin_type: None,
        }
    }

    pub fn internal(name: EventName) -> Self {
        Self::new(name, EventType::Internal)
    }

    pub fn external(name: EventName) -> Self {
        Self::new(name, EventType::External)
    }

    pub fn platform(name: EventName) -> Self {
        Self::new(name, EventType::Platform)
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data.as_constant();
        self
    }

    pub fn with_send_id(mut self, send_id: SendId) -> Self {
        self.send_id = Some(send_id);
        self
    }

    pub fn with_invoke(mut self, invoke_id: InvokeId, unique_id: Option<InvokeUniqueId>) -> Self {
        self.invoke_id = Some(invoke_id);
        self.invoke_unique_id = unique_id;
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>, origin_type: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self.origin_type = Some(origin_type.into());
        self
    }

    /// Builds the read-only `_event` object exposed to the data model.
    pub fn to_value(&self) -> Value {
        fn opt(s: Option<&str>) -> Value {
            s.map(Value::from).unwrap_or(Value::Undefined)
        }

        let map = Map::from_pairs([
            ("name".to_string(), Value::from(self.name.to_string())),
            ("type".to_string(), Value::from(self.kind.as_str())),
            ("sendid".to_string(), opt(self.send_id.as_ref().map(SendId::as_str))),
            ("origin".to_string(), opt(self.origin.as_deref())),
            ("origintype".to_string(), opt(self.origin_type.as_deref())),
            (
                "invokeid".to_string(),
                opt(self.invoke_id.as_ref().map(InvokeId::as_str)),
            ),
            ("data".to_string(), self.data.clone()),
        ]);
        Value::Map(map.deep_clone(true))
    }
}
