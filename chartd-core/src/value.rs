//! Dynamic values.
//!
//! [`Value`] is a tagged union over scalars and two container kinds. Scalars
//! are copied; [`List`] and [`Map`] are reference types whose clones alias
//! the same storage. Equality on containers is identity, use
//! [`Value::deep_eq`] for structural comparison.

use crate::list::List;
use crate::map::Map;
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Process-unique identity of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerId(u64);

impl ContainerId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ContainerId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Observer registry shared by the container types.
pub(crate) struct Observers<O: ?Sized> {
    next: u64,
    entries: Vec<(SubscriptionId, Arc<O>)>,
}

impl<O: ?Sized> Observers<O> {
    pub(crate) fn new() -> Self {
        Self {
            next: 0,
            entries: Vec::new(),
        }
    }

    pub(crate) fn add(&mut self, observer: Arc<O>) -> SubscriptionId {
        self.next += 1;
        let id = SubscriptionId(self.next);
        self.entries.push((id, observer));
        id
    }

    pub(crate) fn remove(&mut self, id: SubscriptionId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        self.entries.len() != before
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<O>> {
        self.entries.iter().map(|(_, o)| o.clone()).collect()
    }
}

/// Type tag of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Undefined,
    Null,
    Boolean,
    Number,
    String,
    DateTime,
    List,
    Map,
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Undefined => "undefined",
            ValueKind::Null => "null",
            ValueKind::Boolean => "boolean",
            ValueKind::Number => "number",
            ValueKind::String => "string",
            ValueKind::DateTime => "datetime",
            ValueKind::List => "list",
            ValueKind::Map => "map",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "undefined" => ValueKind::Undefined,
            "null" => ValueKind::Null,
            "boolean" => ValueKind::Boolean,
            "number" => ValueKind::Number,
            "string" => ValueKind::String,
            "datetime" => ValueKind::DateTime,
            "list" => ValueKind::List,
            "map" => ValueKind::Map,
            _ => return None,
        })
    }

    pub fn is_container(&self) -> bool {
        matches!(self, ValueKind::List | ValueKind::Map)
    }
}

/// A dynamic value.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Boolean(bool),
    Number(f64),
    String(String),
    DateTime(DateTime<FixedOffset>),
    List(List),
    Map(Map),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Undefined => ValueKind::Undefined,
            Value::Null => ValueKind::Null,
            Value::Boolean(_) => ValueKind::Boolean,
            Value::Number(_) => ValueKind::Number,
            Value::String(_) => ValueKind::String,
            Value::DateTime(_) => ValueKind::DateTime,
            Value::List(_) => ValueKind::List,
            Value::Map(_) => ValueKind::Map,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&List> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Map> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Identity of the underlying container, `None` for scalars.
    pub fn container_id(&self) -> Option<ContainerId> {
        match self {
            Value::List(l) => Some(l.id()),
            Value::Map(m) => Some(m.id()),
            _ => None,
        }
    }

    /// Condition semantics: empty, zero, null and undefined are false.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Boolean(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
            Value::DateTime(_) => true,
            Value::List(l) => !l.is_empty(),
            Value::Map(m) => !m.is_empty(),
        }
    }

    /// Whether the container is frozen. Scalars are never read-only.
    pub fn is_read_only(&self) -> bool {
        match self {
            Value::List(l) => l.is_read_only(),
            Value::Map(m) => m.is_read_only(),
            _ => false,
        }
    }

    /// Freezes a container and everything reachable from it. No-op for scalars.
    pub fn freeze(&self) -> Result<(), crate::CoreError> {
        match self {
            Value::List(l) => l.freeze(),
            Value::Map(m) => m.freeze(),
            _ => Ok(()),
        }
    }

    /// Structurally independent copy; frozen throughout when `read_only`.
    /// Aliased and cyclic containers stay aliased and cyclic in the copy.
    pub fn deep_clone(&self, read_only: bool) -> Value {
        self.deep_clone_with(read_only, &mut HashMap::new())
    }

    pub(crate) fn deep_clone_with(
        &self,
        read_only: bool,
        copies: &mut HashMap<ContainerId, Value>,
    ) -> Value {
        match self {
            Value::List(l) => Value::List(l.deep_clone_with(read_only, copies)),
            Value::Map(m) => Value::Map(m.deep_clone_with(read_only, copies)),
            other => other.clone(),
        }
    }

    /// Frozen copy, or the value itself if it is already read-only.
    pub fn as_constant(&self) -> Value {
        if self.kind().is_container() && !self.is_read_only() {
            self.deep_clone(true)
        } else {
            self.clone()
        }
    }

    /// Identity comparison for containers, value comparison for scalars.
    pub fn same(&self, other: &Value) -> bool {
        self == other
    }

    /// Structural equality, including read-only flags of slots.
    pub fn deep_eq(&self, other: &Value) -> bool {
        self.deep_eq_with(other, &mut HashSet::new())
    }

    // A pair already under comparison is assumed equal, so cycles terminate.
    fn deep_eq_with(&self, other: &Value, seen: &mut HashSet<(ContainerId, ContainerId)>) -> bool {
        match (self, other) {
            (Value::List(a), Value::List(b)) => {
                if a.ptr_eq(b) || !seen.insert((a.id(), b.id())) {
                    return true;
                }
                let (a, b) = (a.entries(), b.entries());
                a.len() == b.len()
                    && a.iter().zip(b.iter()).all(|(x, y)| {
                        x.read_only == y.read_only && x.value.deep_eq_with(&y.value, seen)
                    })
            }
            (Value::Map(a), Value::Map(b)) => {
                if a.ptr_eq(b) || !seen.insert((a.id(), b.id())) {
                    return true;
                }
                let (a, b) = (a.entries(), b.entries());
                a.len() == b.len()
                    && a.iter().zip(b.iter()).all(|((ka, x), (kb, y))| {
                        ka == kb
                            && x.read_only == y.read_only
                            && x.value.deep_eq_with(&y.value, seen)
                    })
            }
            _ => self == other,
        }
    }

    /// Converts to JSON. Undefined, non-finite numbers and references back
    /// to an enclosing container become null.
    pub fn to_json(&self) -> serde_json::Value {
        self.to_json_with(&mut Vec::new())
    }

    fn to_json_with(&self, enclosing: &mut Vec<ContainerId>) -> serde_json::Value {
        use serde_json::Value as Json;
        if let Some(id) = self.container_id() {
            if enclosing.contains(&id) {
                return Json::Null;
            }
            enclosing.push(id);
        }
        let json = match self {
            Value::Undefined | Value::Null => Json::Null,
            Value::Boolean(b) => Json::Bool(*b),
            Value::Number(n) => number_to_json(*n),
            Value::String(s) => Json::String(s.clone()),
            Value::DateTime(dt) => Json::String(dt.to_rfc3339()),
            Value::List(l) => Json::Array(
                l.values()
                    .iter()
                    .map(|v| v.to_json_with(enclosing))
                    .collect(),
            ),
            Value::Map(m) => Json::Object(
                m.entries()
                    .into_iter()
                    .map(|(k, e)| (k, e.value.to_json_with(enclosing)))
                    .collect(),
            ),
        };
        if self.container_id().is_some() {
            enclosing.pop();
        }
        json
    }

    /// Builds a writable value tree from JSON.
    pub fn from_json(json: &serde_json::Value) -> Value {
        use serde_json::Value as Json;
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Boolean(*b),
            Json::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            Json::String(s) => Value::String(s.clone()),
            Json::Array(items) => Value::List(List::from_values(items.iter().map(Value::from_json))),
            Json::Object(fields) => Value::Map(Map::from_pairs(
                fields.iter().map(|(k, v)| (k.clone(), Value::from_json(v))),
            )),
        }
    }
}

fn number_to_json(n: f64) -> serde_json::Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        serde_json::Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) => true,
            (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::DateTime(a), Value::DateTime(b)) => a == b,
            (Value::List(a), Value::List(b)) => a.ptr_eq(b),
            (Value::Map(a), Value::Map(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => f.write_str("undefined"),
            Value::String(s) => f.write_str(s),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<DateTime<FixedOffset>> for Value {
    fn from(dt: DateTime<FixedOffset>) -> Self {
        Value::DateTime(dt)
    }
}

impl From<List> for Value {
    fn from(l: List) -> Self {
        Value::List(l)
    }
}

impl From<Map> for Value {
    fn from(m: Map) -> Self {
        Value::Map(m)
    }
}

impl From<&serde_json::Value> for Value {
    fn from(json: &serde_json::Value) -> Self {
        Value::from_json(json)
    }
}
