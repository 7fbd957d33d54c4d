//! Insertion-ordered set of document ids.

use crate::error::CoreError;
use crate::value::{Observers, SubscriptionId};
use parking_lot::Mutex;
use std::sync::Arc;

/// A change applied to an [`OrderedSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetChange {
    Added(u32),
    /// An item was deleted; `remaining` items are left.
    Deleted { item: u32, remaining: usize },
    Clear,
}

pub trait SetObserver: Send + Sync {
    fn set_changed(&self, change: SetChange) -> Result<(), CoreError>;
}

struct SetInner {
    items: Mutex<Vec<u32>>,
    observers: Mutex<Observers<dyn SetObserver>>,
}

/// Shared ordered set, used for the active configuration and history values.
#[derive(Clone)]
pub struct OrderedSet {
    inner: Arc<SetInner>,
}

impl OrderedSet {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SetInner {
                items: Mutex::new(Vec::new()),
                observers: Mutex::new(Observers::new()),
            }),
        }
    }

    /// Adds `item` at the end. Returns `false` if it was already present.
    pub fn add(&self, item: u32) -> Result<bool, CoreError> {
        let mut items = self.inner.items.lock();
        if items.contains(&item) {
            return Ok(false);
        }
        items.push(item);
        self.notify(SetChange::Added(item))?;
        Ok(true)
    }

    pub fn delete(&self, item: u32) -> Result<bool, CoreError> {
        let mut items = self.inner.items.lock();
        let Some(index) = items.iter().position(|i| *i == item) else {
            return Ok(false);
        };
        items.remove(index);
        self.notify(SetChange::Deleted {
            item,
            remaining: items.len(),
        })?;
        Ok(true)
    }

    pub fn clear(&self) -> Result<(), CoreError> {
        let mut items = self.inner.items.lock();
        if items.is_empty() {
            return Ok(());
        }
        items.clear();
        self.notify(SetChange::Clear)
    }

    pub fn contains(&self, item: u32) -> bool {
        self.inner.items.lock().contains(&item)
    }

    pub fn len(&self) -> usize {
        self.inner.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot in insertion order.
    pub fn to_vec(&self) -> Vec<u32> {
        self.inner.items.lock().clone()
    }

    pub fn subscribe(&self, observer: Arc<dyn SetObserver>) -> SubscriptionId {
        self.inner.observers.lock().add(observer)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.observers.lock().remove(id)
    }

    fn notify(&self, change: SetChange) -> Result<(), CoreError> {
        let observers = self.inner.observers.lock().snapshot();
        for observer in observers {
            observer.set_changed(change)?;
        }
        Ok(())
    }
}

impl Default for OrderedSet {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OrderedSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inner.items.try_lock() {
            Some(items) => f.debug_list().entries(items.iter()).finish(),
            None => f.write_str("OrderedSet(<locked>)"),
        }
    }
}
