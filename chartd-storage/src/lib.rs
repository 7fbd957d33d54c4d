//! # chartd-storage
//!
//! Persistence for chartd sessions.
//!
//! This crate provides:
//! - Key/value storage (in-memory, or durable on top of `chartd-log`)
//! - Buckets, hierarchical views scoped under a key prefix
//! - A reference tracker giving containers stable ids and ref counts
//! - Persisting controllers that journal container changes and compact
//!   them on load
//! - Storage providers that open one storage per session

pub mod bucket;
pub mod codec;
pub mod controller;
pub mod error;
pub mod ordered_set;
pub mod provider;
pub mod storage;
pub mod tracker;

pub use bucket::Bucket;
pub use codec::{load_event, read_value, read_value_into, store_event, write_value};
pub use controller::{ListPersistingController, MapPersistingController, PersistingController};
pub use error::StorageError;
pub use ordered_set::OrderedSetPersistingController;
pub use provider::{FileStorageProvider, MemoryStorageProvider, NullStorageProvider, StorageProvider};
pub use storage::{FileStorage, MemoryStorage, NullStorage, Storage};
pub use tracker::ReferenceTracker;

pub use chartd_log::{FsyncPolicy, KeyPart, StoredValue};
