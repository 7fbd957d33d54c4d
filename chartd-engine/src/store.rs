//! Session state in storage.
//!
//! ```text
//! <root>/status          "running" once the session has started
//! <root>/cfg/...         active configuration (ordered set journal)
//! <root>/hist/<doc>/...  recorded history values
//! <root>/refs/...        reference tracker: one bucket per container
//! <root>/dm              data model slot
//! <root>/inv             active invokes slot
//! <root>/queue/<n>/...   events left unprocessed by a host suspend
//! ```
//!
//! Containers are journaled as they change; the storage is committed with
//! [`SessionStore::checkpoint`] whenever the session is stable.

use chartd_core::{Event, Map, OrderedSet, Value};
use chartd_storage::{
    load_event, read_value_into, store_event, write_value, Bucket, OrderedSetPersistingController,
    ReferenceTracker, Storage, StorageError,
};
use std::collections::HashMap;
use std::sync::Arc;

const KEY_STATUS: &str = "status";
const KEY_CONFIGURATION: &str = "cfg";
const KEY_HISTORY: &str = "hist";
const KEY_REFS: &str = "refs";
const KEY_DATA: &str = "dm";
const KEY_INVOKES: &str = "inv";
const KEY_QUEUE: &str = "queue";
const STATUS_RUNNING: &str = "running";

/// Live session state attached to a storage.
pub(crate) struct SessionState<'a> {
    pub data: &'a Map,
    pub invokes: &'a Map,
    pub configuration: &'a OrderedSet,
    pub history: &'a HashMap<u32, OrderedSet>,
}

pub(crate) struct SessionStore {
    storage: Arc<dyn Storage>,
    root: Bucket,
    tracker: ReferenceTracker,
    _configuration: OrderedSetPersistingController,
    _history: Vec<OrderedSetPersistingController>,
}

impl SessionStore {
    /// Attaches the state to `storage`, first restoring whatever a previous
    /// run left there. Returns whether anything was restored.
    pub fn attach(
        storage: Arc<dyn Storage>,
        state: SessionState<'_>,
    ) -> Result<(Self, bool), StorageError> {
        let root = Bucket::new(storage.clone());
        let resumed = root.get_string(KEY_STATUS).as_deref() == Some(STATUS_RUNNING);
        if !resumed {
            root.remove_all();
        }

        let tracker = ReferenceTracker::new(root.nested(KEY_REFS));
        let data = Value::Map(state.data.clone());
        let invokes = Value::Map(state.invokes.clone());

        if resumed {
            read_value_into(&root.nested(KEY_DATA), &tracker, Some(&data))?;
            read_value_into(&root.nested(KEY_INVOKES), &tracker, Some(&invokes))?;
        }
        tracker.add_reference(&data)?;
        tracker.add_reference(&invokes)?;
        if resumed {
            let released = tracker.release_unreferenced()?;
            if released > 0 {
                tracing::debug!(released, "released unreferenced containers");
            }
        } else {
            write_value(&root.nested(KEY_DATA), &tracker, &data, false)?;
            write_value(&root.nested(KEY_INVOKES), &tracker, &invokes, false)?;
            root.add(KEY_STATUS, STATUS_RUNNING);
        }

        let configuration = OrderedSetPersistingController::attach(
            root.nested(KEY_CONFIGURATION),
            state.configuration.clone(),
        )?;
        let history_root = root.nested(KEY_HISTORY);
        let history = state
            .history
            .iter()
            .map(|(doc, set)| {
                OrderedSetPersistingController::attach(history_root.nested(*doc), set.clone())
            })
            .collect::<Result<Vec<_>, _>>()?;

        if resumed {
            storage.shrink()?;
        }

        Ok((
            Self {
                storage,
                root,
                tracker,
                _configuration: configuration,
                _history: history,
            },
            resumed,
        ))
    }

    /// Commits everything written since the last checkpoint.
    pub fn checkpoint(&self) -> Result<(), StorageError> {
        self.storage.checkpoint()
    }

    /// Saves events that must survive a suspend.
    pub fn store_pending_events(&self, events: &[Event]) -> Result<(), StorageError> {
        let queue = self.root.nested(KEY_QUEUE);
        queue.remove_all();
        for (n, event) in events.iter().enumerate() {
            store_event(&queue.nested(n), event)?;
        }
        Ok(())
    }

    /// Loads and forgets the events saved by [`store_pending_events`](Self::store_pending_events).
    pub fn take_pending_events(&self) -> Result<Vec<Event>, StorageError> {
        let queue = self.root.nested(KEY_QUEUE);
        let mut events = Vec::new();
        while let Some(event) = load_event(&queue.nested(events.len()))? {
            events.push(event);
        }
        queue.remove_all();
        Ok(events)
    }

    pub fn tracker(&self) -> &ReferenceTracker {
        &self.tracker
    }
}

impl Drop for SessionStore {
    fn drop(&mut self) {
        self.tracker.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chartd_core::{EventName, List};
    use chartd_storage::MemoryStorage;

    struct Live {
        data: Map,
        invokes: Map,
        configuration: OrderedSet,
        history: HashMap<u32, OrderedSet>,
    }

    impl Live {
        fn new() -> Self {
            let mut history = HashMap::new();
            history.insert(4, OrderedSet::new());
            Self {
                data: Map::new(),
                invokes: Map::new(),
                configuration: OrderedSet::new(),
                history,
            }
        }

        fn state(&self) -> SessionState<'_> {
            SessionState {
                data: &self.data,
                invokes: &self.invokes,
                configuration: &self.configuration,
                history: &self.history,
            }
        }
    }

    #[test]
    fn test_fresh_then_resumed() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());

        let live = Live::new();
        let (store, resumed) = SessionStore::attach(storage.clone(), live.state()).unwrap();
        assert!(!resumed);
        live.configuration.add(1).unwrap();
        live.configuration.add(3).unwrap();
        live.history[&4].add(3).unwrap();
        let items = List::from_values([Value::from(1.0)]);
        live.data.set("items", Value::List(items.clone())).unwrap();
        live.data.set("alias", Value::List(items.clone())).unwrap();
        items.push(Value::from(2.0)).unwrap();
        store.checkpoint().unwrap();
        drop(store);

        let restored = Live::new();
        let (_store, resumed) = SessionStore::attach(storage, restored.state()).unwrap();
        assert!(resumed);
        assert_eq!(restored.configuration.to_vec(), vec![1, 3]);
        assert_eq!(restored.history[&4].to_vec(), vec![3]);
        assert!(Value::Map(restored.data.clone()).deep_eq(&Value::Map(live.data.clone())));
        assert!(restored.data.get("items").same(&restored.data.get("alias")));
    }

    #[test]
    fn test_pending_events() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let live = Live::new();
        let (store, _) = SessionStore::attach(storage, live.state()).unwrap();

        let events = vec![
            Event::external(EventName::parse("a").unwrap()),
            Event::external(EventName::parse("b").unwrap()).with_data(Value::from(2.0)),
        ];
        store.store_pending_events(&events).unwrap();

        let loaded = store.take_pending_events().unwrap();
        let names: Vec<String> = loaded.iter().map(|e| e.name.to_string()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(loaded[1].data, Value::from(2.0));
        assert!(store.take_pending_events().unwrap().is_empty());
    }

    #[test]
    fn test_stale_state_without_status_is_discarded() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let bucket = Bucket::new(storage.clone());
        bucket.nested("junk").add("x", 1i64);

        let live = Live::new();
        let (store, resumed) = SessionStore::attach(storage, live.state()).unwrap();
        assert!(!resumed);
        assert!(bucket.nested("junk").is_empty());
        assert!(store.tracker().len() >= 2);
    }
}
