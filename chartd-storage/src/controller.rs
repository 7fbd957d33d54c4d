//! Persisting controllers for lists and maps.
//!
//! A controller owns one bucket laid out as numbered records:
//!
//! ```text
//! <bucket>/ro              true once the container is frozen
//! <bucket>/<n>/op          set | insert | remove | set_length   (lists)
//!                          set | remove                         (maps)
//! <bucket>/<n>/i           index or length                      (lists)
//! <bucket>/<n>/k           key                                  (maps)
//! <bucket>/<n>/...         stored value, see `codec`
//! ```
//!
//! Attaching replays the records into the container, then compacts them
//! when anything was removed, then records every later change.

use crate::bucket::Bucket;
use crate::codec::{read_value, write_value};
use crate::error::StorageError;
use crate::tracker::{ReferenceTracker, WeakTracker};
use chartd_core::{
    CoreError, List, ListChange, ListObserver, Map, MapChange, MapObserver, SubscriptionId, Value,
};
use parking_lot::Mutex;
use std::sync::Arc;

pub(crate) const KEY_OPERATION: &str = "op";
pub(crate) const KEY_INDEX: &str = "i";
pub(crate) const KEY_KEY: &str = "k";
pub(crate) const KEY_READ_ONLY: &str = "ro";

const OP_SET: &str = "set";
const OP_INSERT: &str = "insert";
const OP_REMOVE: &str = "remove";
const OP_SET_LENGTH: &str = "set_length";

/// Controller attached by the reference tracker to a tracked container.
pub enum PersistingController {
    List(ListPersistingController),
    Map(MapPersistingController),
}

impl PersistingController {
    pub(crate) fn attach(
        bucket: Bucket,
        tracker: &ReferenceTracker,
        value: &Value,
    ) -> Result<Self, StorageError> {
        match value {
            Value::List(list) => Ok(PersistingController::List(
                ListPersistingController::attach(bucket, tracker, list.clone())?,
            )),
            Value::Map(map) => Ok(PersistingController::Map(MapPersistingController::attach(
                bucket,
                tracker,
                map.clone(),
            )?)),
            other => Err(StorageError::invalid_state(format!(
                "cannot persist a {} value as a container",
                other.kind().as_str()
            ))),
        }
    }
}

fn record_index(record: &Bucket, key: &str) -> Result<usize, StorageError> {
    record
        .get_i64(key)
        .and_then(|i| usize::try_from(i).ok())
        .ok_or_else(|| StorageError::corruption(format!("record {:?} has no valid '{}'", record, key)))
}

// A container frozen before it was attached has no `Freeze` change to
// journal, empty or not.
fn mark_read_only(bucket: &Bucket, read_only: bool) {
    if read_only && bucket.get_bool(KEY_READ_ONLY) != Some(true) {
        bucket.add(KEY_READ_ONLY, true);
    }
}

/// Record numbering shared by the controllers' observers.
struct Journal {
    bucket: Bucket,
    tracker: WeakTracker,
    next: Mutex<i64>,
}

impl Journal {
    fn append(&self, op: &str) -> Bucket {
        let mut next = self.next.lock();
        let record = self.bucket.nested(*next);
        *next += 1;
        record.add(KEY_OPERATION, op);
        record
    }

    fn reset(&self) {
        let mut next = self.next.lock();
        *next = 0;
        self.bucket.remove_all();
    }
}

/// Keeps a [`List`] in sync with its bucket.
pub struct ListPersistingController {
    list: List,
    subscription: SubscriptionId,
}

impl ListPersistingController {
    pub fn attach(
        bucket: Bucket,
        tracker: &ReferenceTracker,
        list: List,
    ) -> Result<Self, StorageError> {
        let mut shrink = !list.is_empty();
        let mut record = 0i64;

        loop {
            let rec = bucket.nested(record);
            let Some(op) = rec.get_string(KEY_OPERATION) else {
                break;
            };
            match op.as_str() {
                OP_SET => {
                    let index = record_index(&rec, KEY_INDEX)?;
                    let (value, read_only) = read_value(&rec, tracker)?;
                    list.set_entry(index, value, read_only)?;
                }
                OP_INSERT => {
                    let index = record_index(&rec, KEY_INDEX)?;
                    let (value, read_only) = read_value(&rec, tracker)?;
                    list.insert_entry(index, value, read_only)?;
                }
                OP_REMOVE => {
                    shrink = true;
                    list.remove_at(record_index(&rec, KEY_INDEX)?)?;
                }
                OP_SET_LENGTH => {
                    let length = record_index(&rec, KEY_INDEX)?;
                    if length < list.len() {
                        shrink = true;
                    }
                    list.set_length(length)?;
                }
                other => {
                    return Err(StorageError::invalid_state(format!(
                        "unknown list operation '{}'",
                        other
                    )))
                }
            }
            record += 1;
        }

        if bucket.get_bool(KEY_READ_ONLY) == Some(true) {
            list.freeze()?;
        }

        let entries = list.entries();
        for entry in &entries {
            tracker.add_reference(&entry.value)?;
        }

        if shrink {
            bucket.remove_all();
            record = 0;
            for (index, entry) in entries.iter().enumerate() {
                if entry.value.is_undefined() && !entry.read_only {
                    continue;
                }
                let rec = bucket.nested(record);
                record += 1;
                rec.add(KEY_OPERATION, OP_SET);
                rec.add(KEY_INDEX, index);
                write_value(&rec, tracker, &entry.value, entry.read_only)?;
            }
            if entries
                .last()
                .is_some_and(|e| e.value.is_undefined() && !e.read_only)
            {
                let rec = bucket.nested(record);
                record += 1;
                rec.add(KEY_OPERATION, OP_SET_LENGTH);
                rec.add(KEY_INDEX, entries.len());
            }
        }

        mark_read_only(&bucket, list.is_read_only());

        let journal = Arc::new(ListJournal(Journal {
            bucket,
            tracker: tracker.downgrade(),
            next: Mutex::new(record),
        }));
        let subscription = list.subscribe(journal);

        Ok(Self { list, subscription })
    }
}

impl Drop for ListPersistingController {
    fn drop(&mut self) {
        self.list.unsubscribe(self.subscription);
    }
}

struct ListJournal(Journal);

impl ListJournal {
    fn record(&self, change: &ListChange) -> Result<(), StorageError> {
        let journal = &self.0;
        let tracker = journal.tracker.upgrade()?;
        match change {
            ListChange::Set {
                index,
                old,
                value,
                read_only,
            } => {
                tracker.add_reference(value)?;
                tracker.remove_reference(old)?;
                let rec = journal.append(OP_SET);
                rec.add(KEY_INDEX, *index);
                write_value(&rec, &tracker, value, *read_only)?;
            }
            ListChange::Insert {
                index,
                value,
                read_only,
            } => {
                tracker.add_reference(value)?;
                let rec = journal.append(OP_INSERT);
                rec.add(KEY_INDEX, *index);
                write_value(&rec, &tracker, value, *read_only)?;
            }
            ListChange::Remove {
                index,
                old,
                remaining,
            } => {
                tracker.remove_reference(old)?;
                if *remaining > 0 {
                    journal.append(OP_REMOVE).add(KEY_INDEX, *index);
                } else {
                    journal.reset();
                }
            }
            ListChange::Clear { removed } => {
                for value in removed {
                    tracker.remove_reference(value)?;
                }
                journal.reset();
            }
            ListChange::SetLength { length, removed } => {
                for value in removed {
                    tracker.remove_reference(value)?;
                }
                journal.append(OP_SET_LENGTH).add(KEY_INDEX, *length);
            }
            ListChange::Freeze => journal.bucket.add(KEY_READ_ONLY, true),
        }
        Ok(())
    }
}

impl ListObserver for ListJournal {
    fn list_changed(&self, change: &ListChange) -> Result<(), CoreError> {
        self.record(change).map_err(CoreError::from)
    }
}

/// Keeps a [`Map`] in sync with its bucket.
pub struct MapPersistingController {
    map: Map,
    subscription: SubscriptionId,
}

impl MapPersistingController {
    pub fn attach(bucket: Bucket, tracker: &ReferenceTracker, map: Map) -> Result<Self, StorageError> {
        let mut shrink = !map.is_empty();
        let mut record = 0i64;

        loop {
            let rec = bucket.nested(record);
            let Some(op) = rec.get_string(KEY_OPERATION) else {
                break;
            };
            let key = rec.get_string(KEY_KEY).ok_or_else(|| {
                StorageError::corruption(format!("record {:?} has no key", rec))
            })?;
            match op.as_str() {
                OP_SET => {
                    let (value, read_only) = read_value(&rec, tracker)?;
                    map.define(&key, value, read_only)?;
                }
                OP_REMOVE => {
                    shrink = true;
                    map.remove(&key)?;
                }
                other => {
                    return Err(StorageError::invalid_state(format!(
                        "unknown map operation '{}'",
                        other
                    )))
                }
            }
            record += 1;
        }

        if bucket.get_bool(KEY_READ_ONLY) == Some(true) {
            map.freeze()?;
        }

        let entries = map.entries();
        for (_, entry) in &entries {
            tracker.add_reference(&entry.value)?;
        }

        if shrink {
            bucket.remove_all();
            record = 0;
            for (key, entry) in &entries {
                let rec = bucket.nested(record);
                record += 1;
                rec.add(KEY_OPERATION, OP_SET);
                rec.add(KEY_KEY, key.as_str());
                write_value(&rec, tracker, &entry.value, entry.read_only)?;
            }
        }

        mark_read_only(&bucket, map.is_read_only());

        let journal = Arc::new(MapJournal(Journal {
            bucket,
            tracker: tracker.downgrade(),
            next: Mutex::new(record),
        }));
        let subscription = map.subscribe(journal);

        Ok(Self { map, subscription })
    }
}

impl Drop for MapPersistingController {
    fn drop(&mut self) {
        self.map.unsubscribe(self.subscription);
    }
}

struct MapJournal(Journal);

impl MapJournal {
    fn record(&self, change: &MapChange) -> Result<(), StorageError> {
        let journal = &self.0;
        let tracker = journal.tracker.upgrade()?;
        match change {
            MapChange::Set {
                key,
                old,
                value,
                read_only,
            } => {
                tracker.add_reference(value)?;
                tracker.remove_reference(old)?;
                let rec = journal.append(OP_SET);
                rec.add(KEY_KEY, key.as_str());
                write_value(&rec, &tracker, value, *read_only)?;
            }
            MapChange::Remove {
                key,
                old,
                remaining,
            } => {
                tracker.remove_reference(old)?;
                if *remaining > 0 {
                    journal.append(OP_REMOVE).add(KEY_KEY, key.as_str());
                } else {
                    journal.reset();
                }
            }
            MapChange::Clear { removed } => {
                for value in removed {
                    tracker.remove_reference(value)?;
                }
                journal.reset();
            }
            MapChange::Freeze => journal.bucket.add(KEY_READ_ONLY, true),
        }
        Ok(())
    }
}

impl MapObserver for MapJournal {
    fn map_changed(&self, change: &MapChange) -> Result<(), CoreError> {
        self.record(change).map_err(CoreError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorage, Storage};
    use chartd_core::ValueKind;

    fn reload(bucket: &Bucket, ref_id: i64, kind: ValueKind) -> (ReferenceTracker, Value) {
        let tracker = ReferenceTracker::new(bucket.clone());
        let value = tracker.get_value(ref_id, kind, None).unwrap();
        tracker.add_reference(&value).unwrap();
        (tracker, value)
    }

    fn records(bucket: &Bucket, ref_id: i64) -> usize {
        let mut n = 0;
        while bucket
            .nested(ref_id)
            .nested(n as i64)
            .try_get(KEY_OPERATION)
            .is_some()
        {
            n += 1;
        }
        n
    }

    #[test]
    fn test_list_changes_replay() {
        let bucket = Bucket::in_memory();
        let list = List::new();
        let value = Value::List(list.clone());
        let tracker = ReferenceTracker::new(bucket.clone());
        tracker.add_reference(&value).unwrap();
        let ref_id = tracker.get_ref_id(&value).unwrap();

        list.push(Value::from(1.0)).unwrap();
        list.push(Value::from("two")).unwrap();
        list.insert(0, Value::from(0.0)).unwrap();
        list.set(1, Value::Boolean(true)).unwrap();
        list.set_entry(4, Value::Null, true).unwrap();
        drop(tracker);

        let (_tracker, loaded) = reload(&bucket, ref_id, ValueKind::List);
        assert!(loaded.deep_eq(&value));
        assert_eq!(loaded.as_list().unwrap().get(3), Value::Undefined);
    }

    #[test]
    fn test_list_remove_compacts_on_load() {
        let bucket = Bucket::in_memory();
        let list = List::from_values([Value::from(1.0), Value::from(2.0), Value::from(3.0)]);
        let value = Value::List(list.clone());
        let ref_id = {
            let tracker = ReferenceTracker::new(bucket.clone());
            tracker.add_reference(&value).unwrap();
            list.remove_at(0).unwrap();
            list.push(Value::from(4.0)).unwrap();
            tracker.get_ref_id(&value).unwrap()
        };
        // 3 compacted sets + remove + insert
        assert_eq!(records(&bucket, ref_id), 5);

        let (_tracker, loaded) = reload(&bucket, ref_id, ValueKind::List);
        assert_eq!(
            loaded.to_json(),
            serde_json::json!([2, 3, 4])
        );
        assert_eq!(records(&bucket, ref_id), 3);
    }

    #[test]
    fn test_list_emptied_resets_bucket() {
        let bucket = Bucket::in_memory();
        let list = List::new();
        let value = Value::List(list.clone());
        let tracker = ReferenceTracker::new(bucket.clone());
        tracker.add_reference(&value).unwrap();
        let ref_id = tracker.get_ref_id(&value).unwrap();

        list.push(Value::from(1.0)).unwrap();
        list.push(Value::from(2.0)).unwrap();
        list.remove_at(1).unwrap();
        assert_eq!(records(&bucket, ref_id), 3);
        list.remove_at(0).unwrap();
        assert!(bucket.nested(ref_id).is_empty());

        list.push(Value::from(9.0)).unwrap();
        assert_eq!(records(&bucket, ref_id), 1);
    }

    #[test]
    fn test_set_length_releases_truncated_containers() {
        let bucket = Bucket::in_memory();
        let child = Value::Map(Map::new());
        let list = List::from_values([Value::from(1.0), child.clone()]);
        let value = Value::List(list.clone());
        let tracker = ReferenceTracker::new(bucket.clone());
        tracker.add_reference(&value).unwrap();
        assert_eq!(tracker.ref_count(&child), Some(1));

        list.set_length(1).unwrap();
        assert_eq!(tracker.ref_count(&child), None);

        let ref_id = tracker.get_ref_id(&value).unwrap();
        drop(tracker);
        let (_tracker, loaded) = reload(&bucket, ref_id, ValueKind::List);
        assert_eq!(loaded.as_list().unwrap().len(), 1);
    }

    #[test]
    fn test_trailing_undefined_survives_compaction() {
        let bucket = Bucket::in_memory();
        let list = List::from_values([Value::from(1.0), Value::from(2.0)]);
        let value = Value::List(list.clone());
        let ref_id = {
            let tracker = ReferenceTracker::new(bucket.clone());
            tracker.add_reference(&value).unwrap();
            list.set_length(4).unwrap();
            list.remove_at(0).unwrap();
            tracker.get_ref_id(&value).unwrap()
        };

        let (tracker, loaded) = reload(&bucket, ref_id, ValueKind::List);
        assert_eq!(loaded.as_list().unwrap().len(), 3);
        drop(tracker);
        let (_tracker, loaded) = reload(&bucket, ref_id, ValueKind::List);
        assert_eq!(loaded.as_list().unwrap().len(), 3);
    }

    #[test]
    fn test_frozen_flag_is_persisted() {
        let bucket = Bucket::in_memory();
        let map = Map::from_pairs([("a".to_string(), Value::from(1.0))]);
        let value = Value::Map(map.clone());
        let ref_id = {
            let tracker = ReferenceTracker::new(bucket.clone());
            tracker.add_reference(&value).unwrap();
            map.freeze().unwrap();
            tracker.get_ref_id(&value).unwrap()
        };

        let (_tracker, loaded) = reload(&bucket, ref_id, ValueKind::Map);
        assert!(loaded.is_read_only());
        assert_eq!(loaded.as_map().unwrap().get("a"), Value::from(1.0));
    }

    #[test]
    fn test_frozen_empty_containers_reload_frozen() {
        let bucket = Bucket::in_memory();
        let list = List::new();
        list.freeze().unwrap();
        let map = Map::new();
        map.freeze().unwrap();
        let (list_id, map_id) = {
            let tracker = ReferenceTracker::new(bucket.clone());
            let list = Value::List(list);
            let map = Value::Map(map);
            tracker.add_reference(&list).unwrap();
            tracker.add_reference(&map).unwrap();
            (tracker.get_ref_id(&list).unwrap(), tracker.get_ref_id(&map).unwrap())
        };

        let (_tracker, loaded) = reload(&bucket, list_id, ValueKind::List);
        assert!(loaded.is_read_only());
        assert!(loaded.as_list().unwrap().is_empty());
        let (_tracker, loaded) = reload(&bucket, map_id, ValueKind::Map);
        assert!(loaded.is_read_only());
        assert!(loaded.as_map().unwrap().is_empty());
    }

    #[test]
    fn test_compaction_is_idempotent() {
        let bucket = Bucket::in_memory();
        let list = List::from_values([Value::from(1.0), Value::from(2.0), Value::from(3.0)]);
        let value = Value::List(list.clone());
        let ref_id = {
            let tracker = ReferenceTracker::new(bucket.clone());
            tracker.add_reference(&value).unwrap();
            list.remove_at(1).unwrap();
            list.set_length(4).unwrap();
            tracker.get_ref_id(&value).unwrap()
        };

        let (tracker, first) = reload(&bucket, ref_id, ValueKind::List);
        // 2 sets + trailing set_length
        assert_eq!(records(&bucket, ref_id), 3);
        drop(tracker);
        let (tracker, second) = reload(&bucket, ref_id, ValueKind::List);
        assert_eq!(records(&bucket, ref_id), 3);
        drop(tracker);
        let (_tracker, third) = reload(&bucket, ref_id, ValueKind::List);
        assert_eq!(records(&bucket, ref_id), 3);

        assert!(first.deep_eq(&value));
        assert!(second.deep_eq(&value));
        assert!(third.deep_eq(&value));
    }

    #[test]
    fn test_map_replay_with_nested_aliases() {
        let bucket = Bucket::in_memory();
        let map = Map::new();
        let value = Value::Map(map.clone());
        let tracker = ReferenceTracker::new(bucket.clone());
        tracker.add_reference(&value).unwrap();
        let ref_id = tracker.get_ref_id(&value).unwrap();

        let shared = List::from_values([Value::from("x")]);
        map.set("a", Value::List(shared.clone())).unwrap();
        map.set("b", Value::List(shared.clone())).unwrap();
        map.set("gone", Value::from(1.0)).unwrap();
        map.remove("gone").unwrap();
        shared.push(Value::from("y")).unwrap();
        drop(tracker);

        let (tracker, loaded) = reload(&bucket, ref_id, ValueKind::Map);
        let loaded_map = loaded.as_map().unwrap();
        assert_eq!(loaded_map.keys(), vec!["a", "b"]);
        assert!(loaded_map.get("a").same(&loaded_map.get("b")));
        assert_eq!(loaded_map.get("a").to_json(), serde_json::json!(["x", "y"]));
        assert_eq!(tracker.ref_count(&loaded_map.get("a")), Some(2));
    }

    #[test]
    fn test_map_clear_releases_values() {
        let storage = Arc::new(MemoryStorage::new());
        let bucket = Bucket::new(storage.clone());
        let map = Map::new();
        let value = Value::Map(map.clone());
        let tracker = ReferenceTracker::new(bucket.clone());
        tracker.add_reference(&value).unwrap();

        map.set("l", Value::List(List::from_values([Value::from(1.0)]))).unwrap();
        assert_eq!(tracker.len(), 2);
        map.clear().unwrap();
        assert_eq!(tracker.len(), 1);
        // only the next-ref-id counter remains
        assert_eq!(storage.len(), 1);
    }

    #[test]
    fn test_unknown_operation_is_invalid_state() {
        let bucket = Bucket::in_memory();
        bucket.nested(0i64).nested(0i64).add(KEY_OPERATION, "explode");
        let tracker = ReferenceTracker::new(bucket);
        assert!(matches!(
            tracker.get_value(0, ValueKind::List, None),
            Err(StorageError::InvalidState { .. })
        ));
    }

    #[derive(Debug, Clone)]
    enum ListOp {
        Push(i32),
        Insert(usize, i32),
        Set(usize, i32),
        Remove(usize),
        SetLength(usize),
        Nested(usize),
    }

    fn list_op() -> impl proptest::strategy::Strategy<Value = ListOp> {
        use proptest::prelude::*;
        prop_oneof![
            any::<i32>().prop_map(ListOp::Push),
            (0usize..8, any::<i32>()).prop_map(|(i, v)| ListOp::Insert(i, v)),
            (0usize..8, any::<i32>()).prop_map(|(i, v)| ListOp::Set(i, v)),
            (0usize..8).prop_map(ListOp::Remove),
            (0usize..10).prop_map(ListOp::SetLength),
            (0usize..8).prop_map(ListOp::Nested),
        ]
    }

    #[derive(Debug, Clone)]
    enum MapOp {
        Set(usize, i32),
        Remove(usize),
        Nested(usize),
        Clear,
    }

    const MAP_KEYS: [&str; 5] = ["a", "b", "c", "d", "e"];

    fn map_op() -> impl proptest::strategy::Strategy<Value = MapOp> {
        use proptest::prelude::*;
        prop_oneof![
            4 => (0usize..5, any::<i32>()).prop_map(|(k, v)| MapOp::Set(k, v)),
            2 => (0usize..5).prop_map(MapOp::Remove),
            1 => (0usize..5).prop_map(MapOp::Nested),
            1 => Just(MapOp::Clear),
        ]
    }

    proptest::proptest! {
        #[test]
        fn test_map_history_replays_and_compacts(ops in proptest::collection::vec(map_op(), 0..40)) {
            let bucket = Bucket::in_memory();
            let map = Map::new();
            let value = Value::Map(map.clone());
            let tracker = ReferenceTracker::new(bucket.clone());
            tracker.add_reference(&value).unwrap();
            let ref_id = tracker.get_ref_id(&value).unwrap();

            for op in ops {
                match op {
                    MapOp::Set(k, v) => map.set(MAP_KEYS[k], Value::from(v as f64)).unwrap(),
                    MapOp::Remove(k) => {
                        map.remove(MAP_KEYS[k]).unwrap();
                    }
                    MapOp::Nested(k) => {
                        let child = Map::from_pairs([("n".to_string(), Value::from(k as f64))]);
                        map.set(MAP_KEYS[k], Value::Map(child)).unwrap();
                    }
                    MapOp::Clear => map.clear().unwrap(),
                }
            }
            drop(tracker);

            let (tracker, loaded) = reload(&bucket, ref_id, ValueKind::Map);
            proptest::prop_assert!(loaded.deep_eq(&value));
            let compacted = records(&bucket, ref_id);
            drop(tracker);

            let (_tracker, reloaded) = reload(&bucket, ref_id, ValueKind::Map);
            proptest::prop_assert!(reloaded.deep_eq(&value));
            proptest::prop_assert_eq!(records(&bucket, ref_id), compacted);
        }

        #[test]
        fn test_list_history_replays(ops in proptest::collection::vec(list_op(), 0..40)) {
            let bucket = Bucket::in_memory();
            let list = List::new();
            let value = Value::List(list.clone());
            let tracker = ReferenceTracker::new(bucket.clone());
            tracker.add_reference(&value).unwrap();
            let ref_id = tracker.get_ref_id(&value).unwrap();

            for op in ops {
                let len = list.len();
                match op {
                    ListOp::Push(v) => list.push(Value::from(v as f64)).unwrap(),
                    ListOp::Insert(i, v) => list.insert(i.min(len), Value::from(v as f64)).unwrap(),
                    ListOp::Set(i, v) if i < len => list.set(i, Value::from(v as f64)).unwrap(),
                    ListOp::Remove(i) if i < len => {
                        list.remove_at(i).unwrap();
                    }
                    ListOp::SetLength(n) => list.set_length(n).unwrap(),
                    ListOp::Nested(i) if i < len => {
                        let child = List::from_values([Value::from(i as f64)]);
                        list.set(i, Value::List(child)).unwrap();
                    }
                    _ => {}
                }
            }
            drop(tracker);

            let (_tracker, loaded) = reload(&bucket, ref_id, ValueKind::List);
            proptest::prop_assert!(loaded.deep_eq(&value));
        }
    }
}
