//! Value and event encoding inside buckets.
//!
//! A stored value occupies a few keys of its bucket:
//!
//! ```text
//! t    value kind ("null", "number", "list", ...)
//! v    scalar payload (absent for undefined/null and containers)
//! r    reference id of a container, resolved through a ReferenceTracker
//! ro   true when the slot holding the value is read-only
//! ```

use crate::bucket::Bucket;
use crate::controller::KEY_READ_ONLY;
use crate::error::StorageError;
use crate::tracker::ReferenceTracker;
use chartd_core::{
    Event, EventName, EventType, InvokeId, InvokeUniqueId, SendId, Value, ValueKind,
};
use chrono::DateTime;

const KEY_TYPE: &str = "t";
const KEY_VALUE: &str = "v";
const KEY_REF: &str = "r";

/// Writes `value` into `bucket`. Containers are stored by reference id;
/// the caller accounts for the reference with the tracker.
pub fn write_value(
    bucket: &Bucket,
    tracker: &ReferenceTracker,
    value: &Value,
    read_only: bool,
) -> Result<(), StorageError> {
    bucket.add(KEY_TYPE, value.kind().as_str());
    match value {
        Value::Undefined | Value::Null => {}
        Value::Boolean(b) => bucket.add(KEY_VALUE, *b),
        Value::Number(n) => bucket.add(KEY_VALUE, *n),
        Value::String(s) => bucket.add(KEY_VALUE, s.as_str()),
        Value::DateTime(dt) => bucket.add(KEY_VALUE, dt.to_rfc3339()),
        Value::List(_) | Value::Map(_) => bucket.add(KEY_REF, tracker.get_ref_id(value)?),
    }
    if read_only {
        bucket.add(KEY_READ_ONLY, true);
    }
    Ok(())
}

/// Reads a value written by [`write_value`], with its slot read-only flag.
pub fn read_value(
    bucket: &Bucket,
    tracker: &ReferenceTracker,
) -> Result<(Value, bool), StorageError> {
    read_value_into(bucket, tracker, None)
}

/// Like [`read_value`], but a container is loaded into `base` unless the
/// tracker already materialized it.
pub fn read_value_into(
    bucket: &Bucket,
    tracker: &ReferenceTracker,
    base: Option<&Value>,
) -> Result<(Value, bool), StorageError> {
    let kind_name = bucket
        .get_string(KEY_TYPE)
        .ok_or_else(|| StorageError::corruption(format!("{:?} holds no value", bucket)))?;
    let kind = ValueKind::parse(&kind_name)
        .ok_or_else(|| StorageError::corruption(format!("unknown value type '{}'", kind_name)))?;

    let missing = || {
        StorageError::corruption(format!("{:?} is missing its {} payload", bucket, kind_name))
    };

    let value = match kind {
        ValueKind::Undefined => Value::Undefined,
        ValueKind::Null => Value::Null,
        ValueKind::Boolean => Value::Boolean(bucket.get_bool(KEY_VALUE).ok_or_else(missing)?),
        ValueKind::Number => Value::Number(bucket.get_f64(KEY_VALUE).ok_or_else(missing)?),
        ValueKind::String => Value::String(bucket.get_string(KEY_VALUE).ok_or_else(missing)?),
        ValueKind::DateTime => {
            let text = bucket.get_string(KEY_VALUE).ok_or_else(missing)?;
            let parsed = DateTime::parse_from_rfc3339(&text)
                .map_err(|e| StorageError::corruption(format!("bad datetime '{}': {}", text, e)))?;
            Value::DateTime(parsed)
        }
        ValueKind::List | ValueKind::Map => {
            let ref_id = bucket.get_i64(KEY_REF).ok_or_else(missing)?;
            tracker.get_value(ref_id, kind, base)?
        }
    };

    let read_only = bucket.get_bool(KEY_READ_ONLY).unwrap_or(false);
    Ok((value, read_only))
}

const EVENT_NAME: &str = "name";
const EVENT_TYPE: &str = "type";
const EVENT_SEND_ID: &str = "send_id";
const EVENT_INVOKE_ID: &str = "invoke_id";
const EVENT_INVOKE_UNIQUE_ID: &str = "invoke_unique_id";
const EVENT_ORIGIN: &str = "origin";
const EVENT_ORIGIN_TYPE: &str = "origin_type";
const EVENT_DATA: &str = "data";
const EVENT_REFS: &str = "refs";

/// Stores an event. The payload gets its own reference tracker under the
/// event's bucket.
pub fn store_event(bucket: &Bucket, event: &Event) -> Result<(), StorageError> {
    bucket.add(EVENT_NAME, event.name.to_string());
    bucket.add(EVENT_TYPE, event.kind.as_str());
    if let Some(id) = &event.send_id {
        bucket.add(EVENT_SEND_ID, id.as_str());
    }
    if let Some(id) = &event.invoke_id {
        bucket.add(EVENT_INVOKE_ID, id.as_str());
    }
    if let Some(id) = &event.invoke_unique_id {
        bucket.add(EVENT_INVOKE_UNIQUE_ID, id.as_str());
    }
    if let Some(origin) = &event.origin {
        bucket.add(EVENT_ORIGIN, origin.as_str());
    }
    if let Some(origin_type) = &event.origin_type {
        bucket.add(EVENT_ORIGIN_TYPE, origin_type.as_str());
    }

    if !event.data.is_undefined() {
        let tracker = ReferenceTracker::new(bucket.nested(EVENT_REFS));
        tracker.add_reference(&event.data)?;
        write_value(&bucket.nested(EVENT_DATA), &tracker, &event.data, false)?;
        tracker.dispose();
    }
    Ok(())
}

/// Loads an event stored by [`store_event`]. `None` when the bucket is empty.
pub fn load_event(bucket: &Bucket) -> Result<Option<Event>, StorageError> {
    let Some(name) = bucket.get_string(EVENT_NAME) else {
        return Ok(None);
    };
    let name = EventName::parse(&name)?;
    let kind = bucket
        .get_string(EVENT_TYPE)
        .and_then(|t| EventType::parse(&t))
        .ok_or_else(|| StorageError::corruption(format!("event '{}' has no valid type", name)))?;

    let mut event = Event::new(name, kind);
    event.send_id = bucket.get_string(EVENT_SEND_ID).map(SendId::new);
    event.invoke_id = bucket.get_string(EVENT_INVOKE_ID).map(InvokeId::new);
    event.invoke_unique_id = bucket
        .get_string(EVENT_INVOKE_UNIQUE_ID)
        .map(InvokeUniqueId::new);
    event.origin = bucket.get_string(EVENT_ORIGIN);
    event.origin_type = bucket.get_string(EVENT_ORIGIN_TYPE);

    let data_bucket = bucket.nested(EVENT_DATA);
    if data_bucket.try_get(KEY_TYPE).is_some() {
        let tracker = ReferenceTracker::new(bucket.nested(EVENT_REFS));
        let (data, _) = read_value(&data_bucket, &tracker)?;
        tracker.dispose();
        event.data = data.as_constant();
    }
    Ok(Some(event))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chartd_core::{List, Map};

    fn roundtrip(value: &Value) -> Value {
        let bucket = Bucket::in_memory();
        let tracker = ReferenceTracker::new(bucket.nested("refs"));
        tracker.add_reference(value).unwrap();
        write_value(&bucket.nested("v"), &tracker, value, false).unwrap();
        tracker.dispose();

        let tracker = ReferenceTracker::new(bucket.nested("refs"));
        read_value(&bucket.nested("v"), &tracker).unwrap().0
    }

    #[test]
    fn test_scalars() {
        for value in [
            Value::Undefined,
            Value::Null,
            Value::Boolean(true),
            Value::from(2.5),
            Value::from("text"),
        ] {
            assert_eq!(roundtrip(&value), value);
        }
    }

    #[test]
    fn test_datetime() {
        let dt = DateTime::parse_from_rfc3339("2024-02-29T12:30:00+02:00").unwrap();
        assert_eq!(roundtrip(&Value::DateTime(dt)), Value::DateTime(dt));
    }

    #[test]
    fn test_nested_containers() {
        let value = Value::from_json(&serde_json::json!({
            "items": [1, {"deep": true}],
            "name": "order"
        }));
        assert!(roundtrip(&value).deep_eq(&value));
    }

    #[test]
    fn test_slot_read_only_flag() {
        let bucket = Bucket::in_memory();
        let tracker = ReferenceTracker::new(bucket.nested("refs"));
        write_value(&bucket, &tracker, &Value::from(1.0), true).unwrap();
        assert_eq!(read_value(&bucket, &tracker).unwrap(), (Value::from(1.0), true));
    }

    #[test]
    fn test_missing_value_is_corruption() {
        let bucket = Bucket::in_memory();
        let tracker = ReferenceTracker::new(bucket.nested("refs"));
        assert!(matches!(
            read_value(&bucket, &tracker),
            Err(StorageError::Corruption { .. })
        ));
        bucket.add(KEY_TYPE, "number");
        assert!(matches!(
            read_value(&bucket, &tracker),
            Err(StorageError::Corruption { .. })
        ));
    }

    #[test]
    fn test_event_roundtrip() {
        let bucket = Bucket::in_memory();
        let data = Map::new();
        data.set("list", Value::List(List::from_values([Value::from(1.0)])))
            .unwrap();
        let event = Event::external(EventName::parse("order.created").unwrap())
            .with_data(Value::Map(data))
            .with_send_id(SendId::new("s1"))
            .with_invoke(InvokeId::new("inv"), Some(InvokeUniqueId::new("u1")))
            .with_origin("#_scxml_abc", "http://www.w3.org/TR/scxml/#SCXMLEventProcessor");

        store_event(&bucket, &event).unwrap();
        let loaded = load_event(&bucket).unwrap().unwrap();

        assert_eq!(loaded.name, event.name);
        assert_eq!(loaded.kind, EventType::External);
        assert_eq!(loaded.send_id, event.send_id);
        assert_eq!(loaded.invoke_id, event.invoke_id);
        assert_eq!(loaded.invoke_unique_id, event.invoke_unique_id);
        assert_eq!(loaded.origin, event.origin);
        assert_eq!(loaded.origin_type, event.origin_type);
        assert!(loaded.data.deep_eq(&event.data));
        assert!(loaded.data.is_read_only());
    }

    #[test]
    fn test_load_event_from_empty_bucket() {
        assert!(load_event(&Bucket::in_memory()).unwrap().is_none());
    }
}
