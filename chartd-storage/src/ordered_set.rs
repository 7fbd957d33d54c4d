//! Persisting controller for ordered sets of document ids.
//!
//! ```text
//! <bucket>/<n>/op    added | deleted
//! <bucket>/<n>/id    document id
//! ```

use crate::bucket::Bucket;
use crate::controller::KEY_OPERATION;
use crate::error::StorageError;
use chartd_core::{CoreError, OrderedSet, SetChange, SetObserver, SubscriptionId};
use parking_lot::Mutex;
use std::sync::Arc;

const KEY_ID: &str = "id";
const OP_ADDED: &str = "added";
const OP_DELETED: &str = "deleted";

/// Keeps an [`OrderedSet`] in sync with its bucket.
pub struct OrderedSetPersistingController {
    set: OrderedSet,
    subscription: SubscriptionId,
}

impl OrderedSetPersistingController {
    /// Replays the bucket into `set`, compacts when needed and subscribes.
    pub fn attach(bucket: Bucket, set: OrderedSet) -> Result<Self, StorageError> {
        let mut shrink = !set.is_empty();
        let mut record = 0i64;

        loop {
            let rec = bucket.nested(record);
            let Some(op) = rec.get_string(KEY_OPERATION) else {
                break;
            };
            let id = rec
                .get_i64(KEY_ID)
                .and_then(|id| u32::try_from(id).ok())
                .ok_or_else(|| StorageError::corruption(format!("record {:?} has no valid id", rec)))?;
            match op.as_str() {
                OP_ADDED => {
                    set.add(id)?;
                }
                OP_DELETED => {
                    shrink = true;
                    set.delete(id)?;
                }
                other => {
                    return Err(StorageError::invalid_state(format!(
                        "unknown set operation '{}'",
                        other
                    )))
                }
            }
            record += 1;
        }

        if shrink {
            bucket.remove_all();
            record = 0;
            for id in set.to_vec() {
                write_record(&bucket.nested(record), OP_ADDED, id);
                record += 1;
            }
        }

        let journal = Arc::new(SetJournal {
            bucket,
            next: Mutex::new(record),
        });
        let subscription = set.subscribe(journal);

        Ok(Self { set, subscription })
    }
}

impl Drop for OrderedSetPersistingController {
    fn drop(&mut self) {
        self.set.unsubscribe(self.subscription);
    }
}

fn write_record(rec: &Bucket, op: &str, id: u32) {
    rec.add(KEY_OPERATION, op);
    rec.add(KEY_ID, id);
}

struct SetJournal {
    bucket: Bucket,
    next: Mutex<i64>,
}

impl SetJournal {
    fn append(&self, op: &str, id: u32) {
        let mut next = self.next.lock();
        write_record(&self.bucket.nested(*next), op, id);
        *next += 1;
    }

    fn reset(&self) {
        let mut next = self.next.lock();
        *next = 0;
        self.bucket.remove_all();
    }
}

impl SetObserver for SetJournal {
    fn set_changed(&self, change: SetChange) -> Result<(), CoreError> {
        match change {
            SetChange::Added(id) => self.append(OP_ADDED, id),
            SetChange::Deleted { item, remaining } if remaining > 0 => {
                self.append(OP_DELETED, item)
            }
            SetChange::Deleted { .. } | SetChange::Clear => self.reset(),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records(bucket: &Bucket) -> Vec<(String, i64)> {
        (0i64..)
            .map_while(|n| {
                let rec = bucket.nested(n);
                Some((rec.get_string(KEY_OPERATION)?, rec.get_i64(KEY_ID)?))
            })
            .collect()
    }

    #[test]
    fn test_changes_are_journaled_and_replayed() {
        let bucket = Bucket::in_memory();
        let set = OrderedSet::new();
        let controller = OrderedSetPersistingController::attach(bucket.clone(), set.clone()).unwrap();

        set.add(4).unwrap();
        set.add(2).unwrap();
        set.add(9).unwrap();
        set.delete(2).unwrap();
        drop(controller);

        assert_eq!(
            records(&bucket),
            vec![
                ("added".to_string(), 4),
                ("added".to_string(), 2),
                ("added".to_string(), 9),
                ("deleted".to_string(), 2),
            ]
        );

        let restored = OrderedSet::new();
        let _controller =
            OrderedSetPersistingController::attach(bucket.clone(), restored.clone()).unwrap();
        assert_eq!(restored.to_vec(), vec![4, 9]);
        assert_eq!(
            records(&bucket),
            vec![("added".to_string(), 4), ("added".to_string(), 9)]
        );
    }

    #[test]
    fn test_emptying_resets_the_bucket() {
        let bucket = Bucket::in_memory();
        let set = OrderedSet::new();
        let _controller = OrderedSetPersistingController::attach(bucket.clone(), set.clone()).unwrap();

        set.add(1).unwrap();
        set.add(2).unwrap();
        set.clear().unwrap();
        assert!(bucket.is_empty());

        set.add(7).unwrap();
        set.delete(7).unwrap();
        assert!(bucket.is_empty());

        set.add(3).unwrap();
        assert_eq!(records(&bucket), vec![("added".to_string(), 3)]);
    }

    #[test]
    fn test_detached_controller_stops_recording() {
        let bucket = Bucket::in_memory();
        let set = OrderedSet::new();
        let controller = OrderedSetPersistingController::attach(bucket.clone(), set.clone()).unwrap();
        drop(controller);
        set.add(1).unwrap();
        assert!(bucket.is_empty());
    }

    #[test]
    fn test_unknown_operation() {
        let bucket = Bucket::in_memory();
        let rec = bucket.nested(0i64);
        rec.add(KEY_OPERATION, "moved");
        rec.add(KEY_ID, 1i64);
        assert!(matches!(
            OrderedSetPersistingController::attach(bucket, OrderedSet::new()),
            Err(StorageError::InvalidState { .. })
        ));
    }
}
