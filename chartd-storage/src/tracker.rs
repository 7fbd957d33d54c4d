//! Reference tracking for persisted containers.
//!
//! Every container reachable from a persisted value gets a stable integer
//! reference id and its own bucket (`tracker_bucket/<ref_id>`), kept up to
//! date by a persisting controller. The tracker counts how many persisted
//! slots hold each container and removes the container's bucket when the
//! count drops to zero.

use crate::bucket::Bucket;
use crate::controller::PersistingController;
use crate::error::StorageError;
use chartd_core::{ContainerId, CoreError, List, Map, Value, ValueKind};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

struct Tracked {
    ref_id: i64,
    ref_count: u64,
    controller: Option<PersistingController>,
}

#[derive(Default)]
struct TrackerState {
    objects: HashMap<ContainerId, Tracked>,
    values: HashMap<i64, Value>,
    // Released while their own mutation held them; elements not yet released.
    busy: Vec<(i64, Value)>,
    next_ref_id: i64,
    disposed: bool,
}

pub(crate) struct TrackerInner {
    bucket: Bucket,
    state: Mutex<TrackerState>,
}

/// Weak handle held by persisting controllers.
#[derive(Clone)]
pub(crate) struct WeakTracker(Weak<TrackerInner>);

impl WeakTracker {
    pub(crate) fn upgrade(&self) -> Result<ReferenceTracker, StorageError> {
        self.0
            .upgrade()
            .map(|inner| ReferenceTracker { inner })
            .ok_or_else(|| StorageError::invalid_state("reference tracker disposed"))
    }
}

/// Assigns reference ids to containers and ref-counts them.
///
/// The tracker lock is never held while a controller replays or compacts,
/// since both call back into the tracker for nested containers.
#[derive(Clone)]
pub struct ReferenceTracker {
    inner: Arc<TrackerInner>,
}

impl ReferenceTracker {
    /// Creates a tracker over `bucket`. The next reference id is stored at
    /// the bucket's root key.
    pub fn new(bucket: Bucket) -> Self {
        let next_ref_id = bucket
            .get_root()
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        Self {
            inner: Arc::new(TrackerInner {
                bucket,
                state: Mutex::new(TrackerState {
                    next_ref_id,
                    ..TrackerState::default()
                }),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakTracker {
        WeakTracker(Arc::downgrade(&self.inner))
    }

    pub fn bucket(&self) -> &Bucket {
        &self.inner.bucket
    }

    /// Number of tracked containers.
    pub fn len(&self) -> usize {
        self.inner.state.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current reference count of a tracked container.
    pub fn ref_count(&self, value: &Value) -> Option<u64> {
        let id = value.container_id()?;
        self.inner.state.lock().objects.get(&id).map(|t| t.ref_count)
    }

    /// Returns the reference id of a container without counting a reference.
    /// An untracked container is registered with a count of zero.
    pub fn get_ref_id(&self, value: &Value) -> Result<i64, StorageError> {
        self.track(value, false)
    }

    /// Counts one more persisted slot holding `value`. No-op for scalars.
    pub fn add_reference(&self, value: &Value) -> Result<(), StorageError> {
        self.release_busy()?;
        if value.kind().is_container() {
            self.track(value, true)?;
        }
        Ok(())
    }

    /// Releases one reference. At zero the container's controller is
    /// disposed, its bucket removed and its own elements released.
    pub fn remove_reference(&self, value: &Value) -> Result<(), StorageError> {
        self.release_busy()?;
        let Some(id) = value.container_id() else {
            return Ok(());
        };

        let released = {
            let mut state = self.inner.state.lock();
            let tracked = state.objects.get_mut(&id).ok_or_else(|| {
                StorageError::invalid_state(format!(
                    "container {} is not tracked",
                    id.as_u64()
                ))
            })?;
            if tracked.ref_count == 0 {
                return Err(StorageError::invalid_state(format!(
                    "reference count underflow for ref {}",
                    tracked.ref_id
                )));
            }
            tracked.ref_count -= 1;
            tracked.ref_count == 0
        };

        if released {
            self.release(id)?;
        }
        Ok(())
    }

    /// Resolves a stored reference.
    ///
    /// A reference already materialized by this tracker resolves to the same
    /// container, so aliasing in the stored graph is preserved. Otherwise the
    /// container is rebuilt from its bucket, into `base` when given.
    pub fn get_value(
        &self,
        ref_id: i64,
        kind: ValueKind,
        base: Option<&Value>,
    ) -> Result<Value, StorageError> {
        {
            let state = self.inner.state.lock();
            if state.disposed {
                return Err(StorageError::invalid_state("reference tracker disposed"));
            }
            if let Some(existing) = state.values.get(&ref_id) {
                if let Some(base) = base {
                    if !base.same(existing) {
                        return Err(StorageError::invalid_state(format!(
                            "object structure mismatch for ref {}",
                            ref_id
                        )));
                    }
                }
                return Ok(existing.clone());
            }
        }

        let value = match (base, kind) {
            (Some(base), kind) if base.kind() == kind => base.clone(),
            (Some(base), kind) => {
                return Err(StorageError::invalid_state(format!(
                    "ref {} holds a {} but the base value is a {}",
                    ref_id,
                    kind.as_str(),
                    base.kind().as_str()
                )))
            }
            (None, ValueKind::List) => Value::List(List::new()),
            (None, ValueKind::Map) => Value::Map(Map::new()),
            (None, other) => {
                return Err(StorageError::corruption(format!(
                    "ref {} has non-container type {}",
                    ref_id,
                    other.as_str()
                )))
            }
        };

        let Some(id) = value.container_id() else {
            return Err(StorageError::invalid_state("base value is not a container"));
        };

        {
            let mut state = self.inner.state.lock();
            if state.objects.contains_key(&id) {
                return Err(StorageError::invalid_state(format!(
                    "base container is already tracked, cannot load ref {} into it",
                    ref_id
                )));
            }
            state.objects.insert(
                id,
                Tracked {
                    ref_id,
                    ref_count: 0,
                    controller: None,
                },
            );
            state.values.insert(ref_id, value.clone());
            if ref_id >= state.next_ref_id {
                state.next_ref_id = ref_id + 1;
            }
        }

        self.attach(id, ref_id, &value)?;
        Ok(value)
    }

    /// Releases every container whose count is zero. Call after loading and
    /// counting the root values.
    pub fn release_unreferenced(&self) -> Result<usize, StorageError> {
        let mut released = 0;
        loop {
            let next = {
                let state = self.inner.state.lock();
                state
                    .objects
                    .iter()
                    .find(|(_, t)| t.ref_count == 0)
                    .map(|(id, _)| *id)
            };
            match next {
                Some(id) => {
                    self.release(id)?;
                    released += 1;
                }
                None => return Ok(released),
            }
        }
    }

    /// Finishes releasing containers that dropped to zero from inside their
    /// own change notification. Returns how many were finished; the rest are
    /// still locked and stay queued.
    pub fn release_busy(&self) -> Result<usize, StorageError> {
        let busy = std::mem::take(&mut self.inner.state.lock().busy);
        if busy.is_empty() {
            return Ok(0);
        }

        let mut finished = 0;
        let mut waiting = Vec::new();
        let mut result = Ok(());
        let mut pending = busy.into_iter();
        for (ref_id, value) in pending.by_ref() {
            let Some(children) = container_values(&value) else {
                waiting.push((ref_id, value));
                continue;
            };
            // The interrupted mutation may have journaled into the bucket.
            self.inner.bucket.remove_subtree(ref_id);
            finished += 1;
            if let Err(e) = self.remove_children(&children) {
                result = Err(e);
                break;
            }
        }
        waiting.extend(pending);
        self.inner.state.lock().busy.extend(waiting);
        result.map(|()| finished)
    }

    /// Detaches every controller. Stored data is left untouched.
    pub fn dispose(&self) {
        let controllers: Vec<PersistingController> = {
            let mut state = self.inner.state.lock();
            state.disposed = true;
            state.values.clear();
            state.busy.clear();
            state
                .objects
                .drain()
                .filter_map(|(_, t)| t.controller)
                .collect()
        };
        drop(controllers);
    }

    fn track(&self, value: &Value, increment: bool) -> Result<i64, StorageError> {
        let Some(id) = value.container_id() else {
            return Err(StorageError::Core(CoreError::InvalidArgument {
                reason: format!("a {} value has no reference id", value.kind().as_str()),
            }));
        };

        let ref_id = {
            let mut state = self.inner.state.lock();
            if state.disposed {
                return Err(StorageError::invalid_state("reference tracker disposed"));
            }
            if let Some(tracked) = state.objects.get_mut(&id) {
                if increment {
                    tracked.ref_count += 1;
                }
                return Ok(tracked.ref_id);
            }

            let ref_id = state.next_ref_id;
            state.next_ref_id += 1;
            self.inner.bucket.set_root(state.next_ref_id);
            state.objects.insert(
                id,
                Tracked {
                    ref_id,
                    ref_count: u64::from(increment),
                    controller: None,
                },
            );
            state.values.insert(ref_id, value.clone());
            ref_id
        };

        self.attach(id, ref_id, value)?;
        Ok(ref_id)
    }

    fn attach(&self, id: ContainerId, ref_id: i64, value: &Value) -> Result<(), StorageError> {
        let controller = PersistingController::attach(self.inner.bucket.nested(ref_id), self, value)?;

        let mut state = self.inner.state.lock();
        match state.objects.get_mut(&id) {
            Some(tracked) if tracked.ref_id == ref_id && tracked.controller.is_none() => {
                tracked.controller = Some(controller);
            }
            _ => {
                drop(state);
                drop(controller);
            }
        }
        Ok(())
    }

    fn release(&self, id: ContainerId) -> Result<(), StorageError> {
        let (tracked, value) = {
            let mut state = self.inner.state.lock();
            let Some(tracked) = state.objects.remove(&id) else {
                return Ok(());
            };
            let value = state.values.remove(&tracked.ref_id);
            (tracked, value)
        };

        drop(tracked.controller);
        self.inner.bucket.remove_subtree(tracked.ref_id);
        tracing::trace!(ref_id = tracked.ref_id, "released persisted container");

        let Some(value) = value else {
            return Ok(());
        };
        match container_values(&value) {
            Some(children) => self.remove_children(&children),
            None => {
                tracing::debug!(
                    ref_id = tracked.ref_id,
                    "container busy during release, deferring its elements"
                );
                self.inner.state.lock().busy.push((tracked.ref_id, value));
                Ok(())
            }
        }
    }

    fn remove_children(&self, children: &[Value]) -> Result<(), StorageError> {
        for child in children.iter().filter(|v| v.kind().is_container()) {
            self.remove_reference(child)?;
        }
        Ok(())
    }
}

// `None` while a mutation of the container holds its lock.
fn container_values(value: &Value) -> Option<Vec<Value>> {
    match value {
        Value::List(list) => list.try_values(),
        Value::Map(map) => map.try_values(),
        _ => Some(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chartd_core::{List, Map};

    fn tracker() -> ReferenceTracker {
        ReferenceTracker::new(Bucket::in_memory())
    }

    #[test]
    fn test_ref_ids_are_stable_and_monotonic() {
        let tracker = tracker();
        let a = Value::List(List::new());
        let b = Value::Map(Map::new());

        let ra = tracker.get_ref_id(&a).unwrap();
        let rb = tracker.get_ref_id(&b).unwrap();
        assert_eq!(ra, 0);
        assert_eq!(rb, 1);
        assert_eq!(tracker.get_ref_id(&a).unwrap(), ra);
        assert_eq!(tracker.ref_count(&a), Some(0));
        assert_eq!(tracker.bucket().get_root().and_then(|v| v.as_i64()), Some(2));
    }

    #[test]
    fn test_next_ref_id_survives_new_tracker() {
        let bucket = Bucket::in_memory();
        {
            let tracker = ReferenceTracker::new(bucket.clone());
            tracker.add_reference(&Value::List(List::new())).unwrap();
            tracker.add_reference(&Value::List(List::new())).unwrap();
        }
        let tracker = ReferenceTracker::new(bucket);
        assert_eq!(tracker.get_ref_id(&Value::List(List::new())).unwrap(), 2);
    }

    #[test]
    fn test_remove_reference_at_zero_removes_bucket() {
        let tracker = tracker();
        let list = List::from_values([Value::from(1.0)]);
        let value = Value::List(list);

        tracker.add_reference(&value).unwrap();
        let ref_id = tracker.get_ref_id(&value).unwrap();
        assert!(!tracker.bucket().nested(ref_id).is_empty());

        tracker.remove_reference(&value).unwrap();
        assert!(tracker.bucket().nested(ref_id).is_empty());
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_remove_unknown_is_invalid_state() {
        let tracker = tracker();
        let err = tracker
            .remove_reference(&Value::Map(Map::new()))
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidState { .. }));
    }

    #[test]
    fn test_underflow_is_invalid_state() {
        let tracker = tracker();
        let value = Value::Map(Map::new());
        tracker.get_ref_id(&value).unwrap();
        assert!(matches!(
            tracker.remove_reference(&value),
            Err(StorageError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_scalars_are_ignored() {
        let tracker = tracker();
        tracker.add_reference(&Value::from(1.0)).unwrap();
        tracker.remove_reference(&Value::Null).unwrap();
        assert!(tracker.get_ref_id(&Value::Null).is_err());
    }

    #[test]
    fn test_release_cascades_to_elements() {
        let tracker = tracker();
        let child = Value::Map(Map::new());
        let parent = Value::List(List::from_values([child.clone()]));

        tracker.add_reference(&parent).unwrap();
        assert_eq!(tracker.ref_count(&child), Some(1));

        tracker.remove_reference(&parent).unwrap();
        assert_eq!(tracker.ref_count(&child), None);
        assert!(tracker.bucket().storage().entries().iter().all(|(k, _)| k.is_empty()));
    }

    #[test]
    fn test_get_value_preserves_aliasing() {
        let bucket = Bucket::in_memory();
        let shared = Value::Map(Map::from_pairs([("k".to_string(), Value::from(1.0))]));
        let root = Value::List(List::from_values([shared.clone(), shared.clone()]));
        let root_ref = {
            let tracker = ReferenceTracker::new(bucket.clone());
            tracker.add_reference(&root).unwrap();
            tracker.get_ref_id(&root).unwrap()
        };

        let tracker = ReferenceTracker::new(bucket);
        let loaded = tracker.get_value(root_ref, ValueKind::List, None).unwrap();
        let list = loaded.as_list().unwrap();
        assert_eq!(list.len(), 2);
        assert!(list.get(0).same(&list.get(1)));
        assert!(!list.get(0).same(&shared));
        assert_eq!(list.get(0).as_map().unwrap().get("k"), Value::from(1.0));
        assert_eq!(tracker.ref_count(&list.get(0)), Some(2));
    }

    #[test]
    fn test_release_inside_own_mutation_is_finished_later() {
        let tracker = tracker();
        let x = List::new();
        let y = List::new();
        let z = Value::List(List::from_values([Value::from(1.0)]));
        x.push(Value::List(y.clone())).unwrap();
        x.push(z.clone()).unwrap();
        y.push(Value::List(x.clone())).unwrap();
        let root = Map::new();
        root.set("x", Value::List(x.clone())).unwrap();
        tracker.add_reference(&Value::Map(root.clone())).unwrap();

        let x_ref = tracker.get_ref_id(&Value::List(x.clone())).unwrap();
        let z_ref = tracker.get_ref_id(&z).unwrap();
        assert_eq!(tracker.ref_count(&Value::List(x.clone())), Some(2));
        root.remove("x").unwrap();
        assert_eq!(tracker.ref_count(&Value::List(x.clone())), Some(1));

        // Dropping y releases x while x is still mid-removal.
        x.remove_at(0).unwrap();
        assert_eq!(tracker.ref_count(&Value::List(x.clone())), None);
        assert_eq!(tracker.ref_count(&z), Some(1));

        assert_eq!(tracker.release_busy().unwrap(), 1);
        assert_eq!(tracker.ref_count(&z), None);
        assert!(tracker.bucket().nested(x_ref).is_empty());
        assert!(tracker.bucket().nested(z_ref).is_empty());
        assert_eq!(tracker.release_busy().unwrap(), 0);
    }

    #[test]
    fn test_release_unreferenced_sweeps_zero_counts() {
        let tracker = tracker();
        let orphan = Value::List(List::new());
        let kept = Value::List(List::new());
        tracker.get_ref_id(&orphan).unwrap();
        tracker.add_reference(&kept).unwrap();

        assert_eq!(tracker.release_unreferenced().unwrap(), 1);
        assert_eq!(tracker.ref_count(&orphan), None);
        assert_eq!(tracker.ref_count(&kept), Some(1));
    }
}
