//! # chartd-engine
//!
//! Execution engine for chartd.
//!
//! This crate provides:
//! - The run-to-completion interpreter with early or late data binding,
//!   history, parallel states, invokes and delayed sends
//! - Session controllers that persist state at stable points and can be
//!   suspended, resumed and destroyed
//! - The [`Host`]: a session registry and event router for `#_parent`,
//!   `#_scxml_<session>` and `#_<invoke>` targets
//! - Pluggable data-model handlers, custom actions and invoke types
//! - Configuration loading

pub mod config;
pub mod controller;
pub mod custom_action;
pub mod datamodel;
pub mod error;
pub mod host;
mod interpreter;
pub mod io;
pub mod logger;
pub mod options;
pub mod queue;
pub mod scheduler;
pub mod service;
mod store;

pub use config::{Config, ConfigError, PersistenceLevel};
pub use controller::{SessionStatus, StateMachineController};
pub use custom_action::{CustomActionContext, CustomActionExecutor, CustomActionFactory};
pub use datamodel::{DataModelHandler, DataModelHandlerFactory, Scope};
pub use error::EngineError;
pub use host::{ChartSource, Host, HostOptions, ScxmlServiceFactory, ServiceFactory, SessionLink};
pub use io::{ExternalCommunication, InvokeRequest, OutgoingEvent, SendStatus};
pub use logger::{Logger, TracingLogger};
pub use options::{FileResourceLoader, InterpreterOptions, ResourceLoader};
pub use queue::EventQueue;
pub use service::Service;
