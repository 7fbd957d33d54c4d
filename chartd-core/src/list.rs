//! Ordered list container.

use crate::error::CoreError;
use crate::value::{ContainerId, Observers, SubscriptionId, Value};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Largest length a list can grow to.
pub const MAX_LIST_LENGTH: usize = 1 << 24;

fn check_length(length: Option<usize>) -> Result<usize, CoreError> {
    match length {
        Some(length) if length <= MAX_LIST_LENGTH => Ok(length),
        _ => Err(CoreError::invalid_argument(format!(
            "list length exceeds {}",
            MAX_LIST_LENGTH
        ))),
    }
}

/// A slot in a container: a value plus its own read-only flag.
#[derive(Debug, Clone, Default)]
pub struct Entry {
    pub value: Value,
    pub read_only: bool,
}

impl Entry {
    pub fn new(value: Value, read_only: bool) -> Self {
        Self { value, read_only }
    }
}

/// A change applied to a [`List`].
///
/// Removed values are carried in the notification so observers never need to
/// read the list back while it is locked.
#[derive(Debug, Clone)]
pub enum ListChange {
    Set {
        index: usize,
        old: Value,
        value: Value,
        read_only: bool,
    },
    Insert {
        index: usize,
        value: Value,
        read_only: bool,
    },
    Remove {
        index: usize,
        old: Value,
        remaining: usize,
    },
    Clear {
        removed: Vec<Value>,
    },
    SetLength {
        length: usize,
        removed: Vec<Value>,
    },
    Freeze,
}

/// Receives list changes synchronously, in mutation order.
pub trait ListObserver: Send + Sync {
    fn list_changed(&self, change: &ListChange) -> Result<(), CoreError>;
}

struct ListState {
    entries: Vec<Entry>,
    read_only: bool,
}

impl ListState {
    fn can_set(&self, index: usize) -> bool {
        !self.read_only && self.entries.get(index).map_or(true, |e| !e.read_only)
    }

    fn can_remove(&self, index: usize) -> bool {
        !self.read_only && self.entries.iter().skip(index).all(|e| !e.read_only)
    }

    fn can_set_length(&self, length: usize) -> bool {
        !self.read_only && self.entries.iter().skip(length).all(|e| !e.read_only)
    }

    fn fill_to(&mut self, length: usize) {
        if self.entries.len() < length {
            self.entries.resize_with(length, Entry::default);
        }
    }
}

struct ListInner {
    id: ContainerId,
    state: Mutex<ListState>,
    observers: Mutex<Observers<dyn ListObserver>>,
}

/// A shared, mutable, ordered sequence of values.
#[derive(Clone)]
pub struct List {
    inner: Arc<ListInner>,
}

impl List {
    pub fn new() -> Self {
        Self::with_entries(Vec::new(), false)
    }

    pub fn from_values(values: impl IntoIterator<Item = Value>) -> Self {
        let entries = values.into_iter().map(|v| Entry::new(v, false)).collect();
        Self::with_entries(entries, false)
    }

    fn with_entries(entries: Vec<Entry>, read_only: bool) -> Self {
        Self {
            inner: Arc::new(ListInner {
                id: ContainerId::next(),
                state: Mutex::new(ListState { entries, read_only }),
                observers: Mutex::new(Observers::new()),
            }),
        }
    }

    pub fn id(&self) -> ContainerId {
        self.inner.id
    }

    pub fn ptr_eq(&self, other: &List) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.state.lock().read_only
    }

    /// Returns the element at `index`, or `Undefined` when out of range.
    pub fn get(&self, index: usize) -> Value {
        self.inner
            .state
            .lock()
            .entries
            .get(index)
            .map(|e| e.value.clone())
            .unwrap_or_default()
    }

    pub fn entry(&self, index: usize) -> Option<Entry> {
        self.inner.state.lock().entries.get(index).cloned()
    }

    pub fn entries(&self) -> Vec<Entry> {
        self.inner.state.lock().entries.clone()
    }

    pub fn values(&self) -> Vec<Value> {
        self.inner
            .state
            .lock()
            .entries
            .iter()
            .map(|e| e.value.clone())
            .collect()
    }

    /// Like [`List::values`], but `None` instead of blocking while a
    /// mutation holds the list.
    pub fn try_values(&self) -> Option<Vec<Value>> {
        let state = self.inner.state.try_lock()?;
        Some(state.entries.iter().map(|e| e.value.clone()).collect())
    }

    pub fn can_set(&self, index: usize) -> bool {
        self.inner.state.lock().can_set(index)
    }

    pub fn can_insert(&self, _index: usize) -> bool {
        !self.inner.state.lock().read_only
    }

    pub fn can_remove(&self, index: usize) -> bool {
        self.inner.state.lock().can_remove(index)
    }

    pub fn can_clear(&self) -> bool {
        self.inner.state.lock().can_remove(0)
    }

    pub fn can_set_length(&self, length: usize) -> bool {
        self.inner.state.lock().can_set_length(length)
    }

    pub fn set(&self, index: usize, value: Value) -> Result<(), CoreError> {
        self.set_entry(index, value, false)
    }

    /// Writes a slot. Writing past the end fills the gap with `Undefined`.
    pub fn set_entry(&self, index: usize, value: Value, read_only: bool) -> Result<(), CoreError> {
        let length = check_length(index.checked_add(1))?;
        let mut state = self.inner.state.lock();
        if !state.can_set(index) {
            return Err(CoreError::denied(format!("list element {} is read-only", index)));
        }
        state.fill_to(length);
        let old = std::mem::replace(&mut state.entries[index], Entry::new(value.clone(), read_only));
        self.notify(&ListChange::Set {
            index,
            old: old.value,
            value,
            read_only,
        })
    }

    pub fn insert(&self, index: usize, value: Value) -> Result<(), CoreError> {
        self.insert_entry(index, value, false)
    }

    /// Inserts before `index`, shifting later elements. Inserting past the end
    /// fills the gap with `Undefined`.
    pub fn insert_entry(
        &self,
        index: usize,
        value: Value,
        read_only: bool,
    ) -> Result<(), CoreError> {
        let mut state = self.inner.state.lock();
        if state.read_only {
            return Err(CoreError::denied("list is read-only"));
        }
        check_length(index.max(state.entries.len()).checked_add(1))?;
        state.fill_to(index);
        state.entries.insert(index, Entry::new(value.clone(), read_only));
        self.notify(&ListChange::Insert {
            index,
            value,
            read_only,
        })
    }

    /// Appends at the end.
    pub fn push(&self, value: Value) -> Result<(), CoreError> {
        let mut state = self.inner.state.lock();
        if state.read_only {
            return Err(CoreError::denied("list is read-only"));
        }
        let index = state.entries.len();
        check_length(index.checked_add(1))?;
        state.entries.push(Entry::new(value.clone(), false));
        self.notify(&ListChange::Insert {
            index,
            value,
            read_only: false,
        })
    }

    /// Removes the element at `index`. Returns `false` when out of range.
    pub fn remove_at(&self, index: usize) -> Result<bool, CoreError> {
        let mut state = self.inner.state.lock();
        if !state.can_remove(index) {
            return Err(CoreError::denied(format!(
                "list elements from {} are read-only",
                index
            )));
        }
        if index >= state.entries.len() {
            return Ok(false);
        }
        let old = state.entries.remove(index);
        let remaining = state.entries.len();
        self.notify(&ListChange::Remove {
            index,
            old: old.value,
            remaining,
        })?;
        Ok(true)
    }

    /// Truncates or extends with `Undefined`.
    pub fn set_length(&self, length: usize) -> Result<(), CoreError> {
        check_length(Some(length))?;
        let mut state = self.inner.state.lock();
        if !state.can_set_length(length) {
            return Err(CoreError::denied(format!(
                "list elements from {} are read-only",
                length
            )));
        }
        if length == state.entries.len() {
            return Ok(());
        }
        let removed = if length < state.entries.len() {
            state.entries.drain(length..).map(|e| e.value).collect()
        } else {
            state.fill_to(length);
            Vec::new()
        };
        self.notify(&ListChange::SetLength { length, removed })
    }

    pub fn clear(&self) -> Result<(), CoreError> {
        let mut state = self.inner.state.lock();
        if !state.can_remove(0) {
            return Err(CoreError::denied("list contains read-only elements"));
        }
        if state.entries.is_empty() {
            return Ok(());
        }
        let removed = state.entries.drain(..).map(|e| e.value).collect();
        self.notify(&ListChange::Clear { removed })
    }

    /// Makes the list and every container reachable from it read-only.
    pub fn freeze(&self) -> Result<(), CoreError> {
        let children: Vec<Value> = {
            let mut state = self.inner.state.lock();
            if state.read_only {
                return Ok(());
            }
            state.read_only = true;
            self.notify(&ListChange::Freeze)?;
            state
                .entries
                .iter()
                .filter(|e| e.value.kind().is_container())
                .map(|e| e.value.clone())
                .collect()
        };
        // The lock is released first: a child may alias this list.
        for child in children {
            child.freeze()?;
        }
        Ok(())
    }

    pub fn deep_clone(&self, read_only: bool) -> List {
        self.deep_clone_with(read_only, &mut HashMap::new())
    }

    pub(crate) fn deep_clone_with(
        &self,
        read_only: bool,
        copies: &mut HashMap<ContainerId, Value>,
    ) -> List {
        if let Some(Value::List(copy)) = copies.get(&self.id()) {
            return copy.clone();
        }
        let copy = Self::with_entries(Vec::new(), read_only);
        copies.insert(self.id(), Value::List(copy.clone()));
        let entries = self
            .entries()
            .into_iter()
            .map(|e| {
                let value = e.value.deep_clone_with(read_only, copies);
                Entry::new(value, read_only || e.read_only)
            })
            .collect();
        copy.inner.state.lock().entries = entries;
        copy
    }

    pub fn subscribe(&self, observer: Arc<dyn ListObserver>) -> SubscriptionId {
        self.inner.observers.lock().add(observer)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.observers.lock().remove(id)
    }

    // Called with the state lock held so notification order matches
    // mutation order.
    fn notify(&self, change: &ListChange) -> Result<(), CoreError> {
        let observers = self.inner.observers.lock().snapshot();
        for observer in observers {
            observer.list_changed(change)?;
        }
        Ok(())
    }
}

impl Default for List {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for List {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("List");
        s.field("id", &self.inner.id.as_u64());
        match self.inner.state.try_lock() {
            Some(state) => s.field("len", &state.entries.len()),
            None => s.field("len", &"<locked>"),
        };
        s.finish()
    }
}
