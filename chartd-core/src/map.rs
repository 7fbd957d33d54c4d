//! Insertion-ordered key/value container.

use crate::error::CoreError;
use crate::list::Entry;
use crate::value::{ContainerId, Observers, SubscriptionId, Value};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A change applied to a [`Map`].
#[derive(Debug, Clone)]
pub enum MapChange {
    Set {
        key: String,
        old: Value,
        value: Value,
        read_only: bool,
    },
    Remove {
        key: String,
        old: Value,
        remaining: usize,
    },
    Clear {
        removed: Vec<Value>,
    },
    Freeze,
}

/// Receives map changes synchronously, in mutation order.
pub trait MapObserver: Send + Sync {
    fn map_changed(&self, change: &MapChange) -> Result<(), CoreError>;
}

struct MapState {
    entries: Vec<(String, Entry)>,
    read_only: bool,
}

impl MapState {
    fn position(&self, key: &str) -> Option<usize> {
        self.entries.iter().position(|(k, _)| k == key)
    }

    fn can_set(&self, key: &str) -> bool {
        !self.read_only
            && self
                .position(key)
                .map_or(true, |i| !self.entries[i].1.read_only)
    }

    fn can_clear(&self) -> bool {
        !self.read_only && self.entries.iter().all(|(_, e)| !e.read_only)
    }

    // Replaces or appends, returning the previous value.
    fn put(&mut self, key: &str, entry: Entry) -> Value {
        match self.position(key) {
            Some(i) => std::mem::replace(&mut self.entries[i].1, entry).value,
            None => {
                self.entries.push((key.to_string(), entry));
                Value::Undefined
            }
        }
    }
}

struct MapInner {
    id: ContainerId,
    state: Mutex<MapState>,
    observers: Mutex<Observers<dyn MapObserver>>,
}

/// A shared, mutable map with unique keys in insertion order.
#[derive(Clone)]
pub struct Map {
    inner: Arc<MapInner>,
}

impl Map {
    pub fn new() -> Self {
        Self::with_entries(Vec::new(), false)
    }

    /// Builds a map; later duplicates overwrite earlier ones in place.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, Value)>) -> Self {
        let mut state = MapState {
            entries: Vec::new(),
            read_only: false,
        };
        for (key, value) in pairs {
            state.put(&key, Entry::new(value, false));
        }
        Self::with_entries(state.entries, false)
    }

    fn with_entries(entries: Vec<(String, Entry)>, read_only: bool) -> Self {
        Self {
            inner: Arc::new(MapInner {
                id: ContainerId::next(),
                state: Mutex::new(MapState { entries, read_only }),
                observers: Mutex::new(Observers::new()),
            }),
        }
    }

    pub fn id(&self) -> ContainerId {
        self.inner.id
    }

    pub fn ptr_eq(&self, other: &Map) -> bool {
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

    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.state.lock().position(key).is_some()
    }

    /// Returns the value under `key`, or `Undefined`.
    pub fn get(&self, key: &str) -> Value {
        self.entry(key).map(|e| e.value).unwrap_or_default()
    }

    pub fn entry(&self, key: &str) -> Option<Entry> {
        let state = self.inner.state.lock();
        state.position(key).map(|i| state.entries[i].1.clone())
    }

    pub fn entries(&self) -> Vec<(String, Entry)> {
        self.inner.state.lock().entries.clone()
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner
            .state
            .lock()
            .entries
            .iter()
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Snapshot of the values, or `None` while a mutation holds the map.
    pub fn try_values(&self) -> Option<Vec<Value>> {
        let state = self.inner.state.try_lock()?;
        Some(state.entries.iter().map(|(_, e)| e.value.clone()).collect())
    }

    pub fn can_set(&self, key: &str) -> bool {
        self.inner.state.lock().can_set(key)
    }

    pub fn can_remove(&self, key: &str) -> bool {
        self.inner.state.lock().can_set(key)
    }

    pub fn can_clear(&self) -> bool {
        self.inner.state.lock().can_clear()
    }

    pub fn set(&self, key: &str, value: Value) -> Result<(), CoreError> {
        self.set_entry(key, value, false)
    }

    pub fn set_entry(&self, key: &str, value: Value, read_only: bool) -> Result<(), CoreError> {
        let mut state = self.inner.state.lock();
        if !state.can_set(key) {
            return Err(CoreError::denied(format!("map key '{}' is read-only", key)));
        }
        let old = state.put(key, Entry::new(value.clone(), read_only));
        self.notify(&MapChange::Set {
            key: key.to_string(),
            old,
            value,
            read_only,
        })
    }

    /// Defines a host-owned slot, replacing it even if the slot is read-only.
    /// The map itself must still be writable.
    pub fn define(&self, key: &str, value: Value, read_only: bool) -> Result<(), CoreError> {
        let mut state = self.inner.state.lock();
        if state.read_only {
            return Err(CoreError::denied("map is read-only"));
        }
        let old = state.put(key, Entry::new(value.clone(), read_only));
        self.notify(&MapChange::Set {
            key: key.to_string(),
            old,
            value,
            read_only,
        })
    }

    /// Removes `key`. Returns `false` when the key is absent.
    pub fn remove(&self, key: &str) -> Result<bool, CoreError> {
        let mut state = self.inner.state.lock();
        if !state.can_set(key) {
            return Err(CoreError::denied(format!("map key '{}' is read-only", key)));
        }
        let Some(index) = state.position(key) else {
            return Ok(false);
        };
        let (key, old) = state.entries.remove(index);
        let remaining = state.entries.len();
        self.notify(&MapChange::Remove {
            key,
            old: old.value,
            remaining,
        })?;
        Ok(true)
    }

    pub fn clear(&self) -> Result<(), CoreError> {
        let mut state = self.inner.state.lock();
        if !state.can_clear() {
            return Err(CoreError::denied("map contains read-only entries"));
        }
        if state.entries.is_empty() {
            return Ok(());
        }
        let removed = state.entries.drain(..).map(|(_, e)| e.value).collect();
        self.notify(&MapChange::Clear { removed })
    }

    /// Makes the map and every container reachable from it read-only.
    pub fn freeze(&self) -> Result<(), CoreError> {
        let children: Vec<Value> = {
            let mut state = self.inner.state.lock();
            if state.read_only {
                return Ok(());
            }
            state.read_only = true;
            self.notify(&MapChange::Freeze)?;
            state
                .entries
                .iter()
                .filter(|(_, e)| e.value.kind().is_container())
                .map(|(_, e)| e.value.clone())
                .collect()
        };
        for child in children {
            child.freeze()?;
        }
        Ok(())
    }

    pub fn deep_clone(&self, read_only: bool) -> Map {
        self.deep_clone_with(read_only, &mut HashMap::new())
    }

    pub(crate) fn deep_clone_with(
        &self,
        read_only: bool,
        copies: &mut HashMap<ContainerId, Value>,
    ) -> Map {
        if let Some(Value::Map(copy)) = copies.get(&self.id()) {
            return copy.clone();
        }
        let copy = Self::with_entries(Vec::new(), read_only);
        copies.insert(self.id(), Value::Map(copy.clone()));
        let entries = self
            .entries()
            .into_iter()
            .map(|(k, e)| {
                let value = e.value.deep_clone_with(read_only, copies);
                (k, Entry::new(value, read_only || e.read_only))
            })
            .collect();
        copy.inner.state.lock().entries = entries;
        copy
    }

    pub fn subscribe(&self, observer: Arc<dyn MapObserver>) -> SubscriptionId {
        self.inner.observers.lock().add(observer)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.observers.lock().remove(id)
    }

    fn notify(&self, change: &MapChange) -> Result<(), CoreError> {
        let observers = self.inner.observers.lock().snapshot();
        for observer in observers {
            observer.map_changed(change)?;
        }
        Ok(())
    }
}

impl Default for Map {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Map {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Map");
        s.field("id", &self.inner.id.as_u64());
        match self.inner.state.try_lock() {
            Some(state) => s.field("len", &state.entries.len()),
            None => s.field("len", &"<locked>"),
        };
        s.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::list::List;

    #[test]
    fn test_insertion_order_preserved() {
        let map = Map::new();
        map.set("b", Value::from(1.0)).unwrap();
        map.set("a", Value::from(2.0)).unwrap();
        map.set("b", Value::from(3.0)).unwrap();
        assert_eq!(map.keys(), vec!["b", "a"]);
        assert_eq!(map.get("b"), Value::from(3.0));
        assert!(map.get("missing").is_undefined());
    }

    #[test]
    fn test_remove_missing_key_is_noop() {
        let map = Map::new();
        assert!(!map.remove("nope").unwrap());
    }

    #[test]
    fn test_read_only_entry() {
        let map = Map::new();
        map.set_entry("fixed", Value::from(1.0), true).unwrap();
        map.set("free", Value::from(2.0)).unwrap();

        assert!(!map.can_set("fixed"));
        assert!(map.can_set("free"));
        assert!(!map.can_clear());
        assert!(map.set("fixed", Value::Null).is_err());
        assert!(map.remove("fixed").is_err());

        map.define("fixed", Value::from(5.0), true).unwrap();
        assert_eq!(map.get("fixed"), Value::from(5.0));
    }

    #[test]
    fn test_deep_clone_read_only_propagates() {
        let inner = Map::new();
        inner.set("k", Value::from("v")).unwrap();
        let outer = List::from_values([Value::Map(inner.clone())]);

        let clone = outer.deep_clone(true);
        assert!(matches!(
            clone.push(Value::Null),
            Err(CoreError::ModificationDenied { .. })
        ));
        let cloned_inner = clone.get(0);
        let cloned_inner = cloned_inner.as_map().unwrap();
        assert!(!cloned_inner.ptr_eq(&inner));
        assert!(matches!(
            cloned_inner.set("k", Value::Null),
            Err(CoreError::ModificationDenied { .. })
        ));
        // the source stays writable
        inner.set("k", Value::Null).unwrap();
        assert_eq!(cloned_inner.get("k"), Value::from("v"));
    }

    #[test]
    fn test_freeze_reaches_nested_containers() {
        let inner = List::new();
        let map = Map::new();
        map.set("items", Value::List(inner.clone())).unwrap();
        map.set("self", Value::Map(map.clone())).unwrap();

        map.freeze().unwrap();
        assert!(map.is_read_only());
        assert!(inner.is_read_only());
        assert!(inner.push(Value::Null).is_err());
    }

    #[test]
    fn test_define_on_frozen_map_fails() {
        let map = Map::new();
        map.freeze().unwrap();
        assert!(map.define("x", Value::Null, false).is_err());
    }
}
