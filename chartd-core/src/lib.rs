//! # chartd-core
//!
//! Core data model for chartd.
//!
//! This crate provides:
//! - Dynamic values with shared, observable List and Map containers
//! - Insertion-ordered sets used for chart configurations
//! - Hierarchical event names, descriptors and immutable events
//! - Chart definitions (JSON DSL) compiled into document order
//! - A small built-in expression language

pub mod accessor;
pub mod chart;
pub mod error;
pub mod event;
pub mod expr;
pub mod id;
pub mod list;
pub mod map;
pub mod ordered_set;
pub mod value;

pub use accessor::{Accessor, Path, PathSegment, Selector};
pub use chart::{Action, Chart, ChartDefinition, StateKind, StateNode, Transition};
pub use error::CoreError;
pub use event::{Event, EventDescriptor, EventName, EventType, Identifier};
pub use expr::{EvalContext, Expr};
pub use id::{InvokeId, InvokeUniqueId, SendId, SessionId};
pub use list::{Entry, List, ListChange, ListObserver};
pub use map::{Map, MapChange, MapObserver};
pub use ordered_set::{OrderedSet, SetChange, SetObserver};
pub use value::{ContainerId, SubscriptionId, Value, ValueKind};
