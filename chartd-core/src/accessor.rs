//! Uniform get/set/length access over values, for expression evaluators.

use crate::error::CoreError;
use crate::value::Value;
use std::fmt;

/// Addresses one slot of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selector<'a> {
    Index(usize),
    Key(&'a str),
}

/// Capability view over a [`Value`].
///
/// Lists accept numeric keys, maps accept indices as their decimal key.
#[derive(Debug, Clone, Copy)]
pub struct Accessor<'a> {
    value: &'a Value,
}

impl<'a> Accessor<'a> {
    pub fn new(value: &'a Value) -> Self {
        Self { value }
    }

    pub fn get(&self, selector: Selector<'_>) -> Value {
        match (self.value, selector) {
            (Value::List(list), Selector::Index(i)) => list.get(i),
            (Value::List(list), Selector::Key("length")) => Value::from(list.len() as f64),
            (Value::List(list), Selector::Key(key)) => match key.parse::<usize>() {
                Ok(i) => list.get(i),
                Err(_) => Value::Undefined,
            },
            (Value::Map(map), Selector::Key(key)) => map.get(key),
            (Value::Map(map), Selector::Index(i)) => map.get(&i.to_string()),
            (Value::String(s), Selector::Key("length")) => Value::from(s.chars().count() as f64),
            _ => Value::Undefined,
        }
    }

    pub fn set(&self, selector: Selector<'_>, value: Value) -> Result<(), CoreError> {
        match (self.value, selector) {
            (Value::List(list), Selector::Index(i)) => list.set(i, value),
            (Value::List(list), Selector::Key(key)) => match key.parse::<usize>() {
                Ok(i) => list.set(i, value),
                Err(_) => Err(CoreError::invalid_argument(format!(
                    "'{}' is not a list index",
                    key
                ))),
            },
            (Value::Map(map), Selector::Key(key)) => map.set(key, value),
            (Value::Map(map), Selector::Index(i)) => map.set(&i.to_string(), value),
            (other, _) => Err(CoreError::invalid_argument(format!(
                "cannot assign into a {} value",
                other.kind().as_str()
            ))),
        }
    }

    pub fn length(&self) -> usize {
        match self.value {
            Value::List(list) => list.len(),
            Value::Map(map) => map.len(),
            Value::String(s) => s.chars().count(),
            _ => 0,
        }
    }
}

impl Value {
    pub fn accessor(&self) -> Accessor<'_> {
        Accessor::new(self)
    }
}

/// One step of a location path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

impl PathSegment {
    fn selector(&self) -> Selector<'_> {
        match self {
            PathSegment::Key(k) => Selector::Key(k),
            PathSegment::Index(i) => Selector::Index(*i),
        }
    }
}

/// A location such as `order.items[2].price`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    segments: Vec<PathSegment>,
}

impl Path {
    pub fn parse(text: &str) -> Result<Self, CoreError> {
        let invalid = |reason: &str| CoreError::InvalidExpression {
            reason: format!("location '{}': {}", text, reason),
        };

        let mut segments = Vec::new();
        for part in text.split('.') {
            let (name, mut rest) = match part.find('[') {
                Some(i) => (&part[..i], &part[i..]),
                None => (part, ""),
            };
            if name.is_empty() {
                if segments.is_empty() || rest.is_empty() {
                    return Err(invalid("empty segment"));
                }
            } else {
                if !name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '$') {
                    return Err(invalid("invalid identifier"));
                }
                segments.push(PathSegment::Key(name.to_string()));
            }
            while !rest.is_empty() {
                let close = rest.find(']').ok_or_else(|| invalid("expected ']'"))?;
                let index = rest[1..close]
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| invalid("index must be a non-negative integer"))?;
                segments.push(PathSegment::Index(index));
                rest = &rest[close + 1..];
                if !rest.is_empty() && !rest.starts_with('[') {
                    return Err(invalid("unexpected characters after ']'"));
                }
            }
        }
        if segments.is_empty() {
            return Err(invalid("empty location"));
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    /// First key of the path, i.e. the top-level variable name.
    pub fn root(&self) -> Option<&str> {
        match self.segments.first() {
            Some(PathSegment::Key(k)) => Some(k),
            _ => None,
        }
    }

    /// Reads the location. Missing intermediate values yield `Undefined`.
    pub fn resolve(&self, root: &Value) -> Value {
        let mut current = root.clone();
        for segment in &self.segments {
            current = current.accessor().get(segment.selector());
            if current.is_undefined() {
                break;
            }
        }
        current
    }

    /// Writes `value` at the location. The parent must already exist.
    pub fn assign(&self, root: &Value, value: Value) -> Result<(), CoreError> {
        let (last, parents) = self
            .segments
            .split_last()
            .ok_or_else(|| CoreError::invalid_argument("empty location"))?;
        let mut parent = root.clone();
        for segment in parents {
            parent = parent.accessor().get(segment.selector());
        }
        if !parent.kind().is_container() {
            return Err(CoreError::Evaluation {
                reason: format!("location '{}' has no container parent", self),
            });
        }
        parent.accessor().set(last.selector(), value)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                PathSegment::Key(k) if i == 0 => write!(f, "{}", k)?,
                PathSegment::Key(k) => write!(f, ".{}", k)?,
                PathSegment::Index(n) => write!(f, "[{}]", n)?,
            }
        }
        Ok(())
    }
}
