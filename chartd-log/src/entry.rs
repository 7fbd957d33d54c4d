//! Log entry types.
//!
//! Each log record has the following on-disk format:
//!
//! ```text
//! +----------+----------+----------+----------+----------+----------+
//! | magic    | type     | flags    | reserved | length   | crc32c   |
//! | 4 bytes  | 1 byte   | 1 byte   | 2 bytes  | 4 bytes  | 4 bytes  |
//! +----------+----------+----------+----------+----------+----------+
//! | sequence_number     | payload (JSON)                            |
//! | 8 bytes             | length bytes                              |
//! +---------------------+-------------------------------------------+
//! ```

use crate::error::LogError;
use crate::RECORD_HEADER_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Magic bytes for log records: "CLOG"
pub const LOG_MAGIC: [u8; 4] = *b"CLOG";

/// Maximum record payload size (16 MiB).
pub const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

/// One segment of a bucket key. Indices order before names.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPart {
    Index(i64),
    Name(String),
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Index(i) => write!(f, "{}", i),
            KeyPart::Name(n) => f.write_str(n),
        }
    }
}

impl From<i64> for KeyPart {
    fn from(i: i64) -> Self {
        KeyPart::Index(i)
    }
}

impl From<usize> for KeyPart {
    fn from(i: usize) -> Self {
        KeyPart::Index(i as i64)
    }
}

impl From<u32> for KeyPart {
    fn from(i: u32) -> Self {
        KeyPart::Index(i as i64)
    }
}

impl From<&str> for KeyPart {
    fn from(s: &str) -> Self {
        KeyPart::Name(s.to_string())
    }
}

impl From<String> for KeyPart {
    fn from(s: String) -> Self {
        KeyPart::Name(s)
    }
}

/// A scalar stored under a bucket key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum StoredValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl StoredValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            StoredValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            StoredValue::Float(f) => Some(*f),
            StoredValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            StoredValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            StoredValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for StoredValue {
    fn from(b: bool) -> Self {
        StoredValue::Bool(b)
    }
}

impl From<i64> for StoredValue {
    fn from(i: i64) -> Self {
        StoredValue::Int(i)
    }
}

impl From<u32> for StoredValue {
    fn from(i: u32) -> Self {
        StoredValue::Int(i as i64)
    }
}

impl From<usize> for StoredValue {
    fn from(i: usize) -> Self {
        StoredValue::Int(i as i64)
    }
}

impl From<f64> for StoredValue {
    fn from(f: f64) -> Self {
        StoredValue::Float(f)
    }
}

impl From<&str> for StoredValue {
    fn from(s: &str) -> Self {
        StoredValue::Str(s.to_string())
    }
}

impl From<String> for StoredValue {
    fn from(s: String) -> Self {
        StoredValue::Str(s)
    }
}

/// Type of log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum LogEntryType {
    /// Key written.
    Put = 1,
    /// Key and everything nested beneath it removed.
    RemoveSubtree = 2,
    /// Transaction boundary; everything before it is committed.
    Checkpoint = 3,
    /// No-op (for padding/alignment).
    Noop = 255,
}

impl TryFrom<u8> for LogEntryType {
    type Error = LogError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(LogEntryType::Put),
            2 => Ok(LogEntryType::RemoveSubtree),
            3 => Ok(LogEntryType::Checkpoint),
            255 => Ok(LogEntryType::Noop),
            _ => Err(LogError::InvalidHeader {
                offset: 0,
                reason: format!("unknown entry type: {}", value),
            }),
        }
    }
}

/// A parsed log record header.
#[derive(Debug, Clone)]
pub struct LogRecordHeader {
    pub entry_type: LogEntryType,
    pub flags: u8,
    pub payload_len: u32,
    pub crc32c: u32,
    pub sequence: u64,
}

/// A complete log record (header + payload).
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub header: LogRecordHeader,
    pub payload: Bytes,
}

impl LogRecord {
    /// Creates a new log record.
    pub fn new(entry_type: LogEntryType, sequence: u64, payload: Bytes) -> Self {
        let crc = crc32c::crc32c(&payload);
        Self {
            header: LogRecordHeader {
                entry_type,
                flags: 0,
                payload_len: payload.len() as u32,
                crc32c: crc,
                sequence,
            },
            payload,
        }
    }

    /// Serializes an entry into a record.
    pub fn from_entry(entry: &LogEntry, sequence: u64) -> Result<Self, LogError> {
        let payload = serde_json::to_vec(entry)?;
        Ok(Self::new(entry.entry_type(), sequence, Bytes::from(payload)))
    }

    /// Deserializes the payload.
    pub fn entry(&self) -> Result<LogEntry, LogError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Encodes the record into bytes.
    pub fn encode(&self) -> Result<BytesMut, LogError> {
        if self.payload.len() > MAX_RECORD_SIZE {
            return Err(LogError::RecordTooLarge {
                size: self.payload.len(),
                max: MAX_RECORD_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(RECORD_HEADER_SIZE + self.payload.len());
        buf.put_slice(&LOG_MAGIC);
        buf.put_u8(self.header.entry_type as u8);
        buf.put_u8(self.header.flags);
        buf.put_u16(0);
        buf.put_u32(self.header.payload_len);
        buf.put_u32(self.header.crc32c);
        buf.put_u64(self.header.sequence);
        buf.put_slice(&self.payload);

        Ok(buf)
    }

    /// Decodes a record from the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed or the rest is zero padding.
    pub fn decode(buf: &mut BytesMut, offset: u64) -> Result<Option<Self>, LogError> {
        if buf.len() < RECORD_HEADER_SIZE {
            return Ok(None);
        }

        let magic = [buf[0], buf[1], buf[2], buf[3]];
        if magic != LOG_MAGIC {
            if magic == [0, 0, 0, 0] {
                return Ok(None);
            }
            return Err(LogError::InvalidHeader {
                offset,
                reason: format!("invalid magic: {:?}", magic),
            });
        }

        let entry_type = LogEntryType::try_from(buf[4]).map_err(|_| LogError::InvalidHeader {
            offset,
            reason: format!("unknown entry type: {}", buf[4]),
        })?;

        let flags = buf[5];
        let payload_len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
        let crc_expected = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);
        let sequence = u64::from_be_bytes([
            buf[16], buf[17], buf[18], buf[19], buf[20], buf[21], buf[22], buf[23],
        ]);

        if payload_len > MAX_RECORD_SIZE {
            return Err(LogError::RecordTooLarge {
                size: payload_len,
                max: MAX_RECORD_SIZE,
            });
        }

        if buf.len() < RECORD_HEADER_SIZE + payload_len {
            return Ok(None);
        }

        buf.advance(RECORD_HEADER_SIZE);
        let payload = buf.split_to(payload_len).freeze();

        let crc_actual = crc32c::crc32c(&payload);
        if crc_actual != crc_expected {
            return Err(LogError::CorruptedRecord {
                offset,
                expected: crc_expected,
                actual: crc_actual,
            });
        }

        Ok(Some(Self {
            header: LogRecordHeader {
                entry_type,
                flags,
                payload_len: payload_len as u32,
                crc32c: crc_expected,
                sequence,
            },
            payload,
        }))
    }

    /// Returns the total size of this record on disk.
    pub fn disk_size(&self) -> usize {
        RECORD_HEADER_SIZE + self.payload.len()
    }
}

/// Typed log entry with deserialized payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEntry {
    Put { key: Vec<KeyPart>, value: StoredValue },
    RemoveSubtree { key: Vec<KeyPart> },
    Checkpoint,
}

impl LogEntry {
    /// Returns the entry type for this entry.
    pub fn entry_type(&self) -> LogEntryType {
        match self {
            LogEntry::Put { .. } => LogEntryType::Put,
            LogEntry::RemoveSubtree { .. } => LogEntryType::RemoveSubtree,
            LogEntry::Checkpoint => LogEntryType::Checkpoint,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(key: &[KeyPart], value: StoredValue) -> LogEntry {
        LogEntry::Put {
            key: key.to_vec(),
            value,
        }
    }

    #[test]
    fn test_record_roundtrip() {
        let entry = put(&[KeyPart::from("root"), KeyPart::from(3i64)], StoredValue::Int(7));
        let record = LogRecord::from_entry(&entry, 42).unwrap();

        let mut buf = record.encode().unwrap();
        let decoded = LogRecord::decode(&mut buf, 0).unwrap().unwrap();

        assert_eq!(decoded.header.entry_type, LogEntryType::Put);
        assert_eq!(decoded.header.sequence, 42);
        assert_eq!(decoded.entry().unwrap(), entry);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_corrupted_record_detection() {
        let record = LogRecord::from_entry(&LogEntry::Checkpoint, 1).unwrap();
        let mut encoded = record.encode().unwrap();

        let len = encoded.len();
        encoded[len - 1] ^= 0xFF;

        let result = LogRecord::decode(&mut encoded, 0);
        assert!(matches!(result, Err(LogError::CorruptedRecord { .. })));
    }

    #[test]
    fn test_partial_record_needs_more_data() {
        let record = LogRecord::from_entry(&LogEntry::Checkpoint, 1).unwrap();
        let encoded = record.encode().unwrap();
        let mut partial = BytesMut::from(&encoded[..encoded.len() - 2]);
        assert!(LogRecord::decode(&mut partial, 0).unwrap().is_none());
    }

    #[test]
    fn test_key_part_ordering() {
        let mut keys = vec![
            KeyPart::from("b"),
            KeyPart::from(10i64),
            KeyPart::from("a"),
            KeyPart::from(2i64),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                KeyPart::from(2i64),
                KeyPart::from(10i64),
                KeyPart::from("a"),
                KeyPart::from("b")
            ]
        );
    }

    #[test]
    fn test_entry_json_shape() {
        let entry = put(&[KeyPart::from("x")], StoredValue::Str("v".into()));
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "put", "key": ["x"], "value": {"t": "str", "v": "v"}})
        );
    }

    #[test]
    fn test_entry_type_conversion() {
        assert_eq!(LogEntryType::try_from(1u8).unwrap(), LogEntryType::Put);
        assert_eq!(
            LogEntryType::try_from(2u8).unwrap(),
            LogEntryType::RemoveSubtree
        );
        assert_eq!(LogEntryType::try_from(3u8).unwrap(), LogEntryType::Checkpoint);
        assert_eq!(LogEntryType::try_from(255u8).unwrap(), LogEntryType::Noop);
        assert!(LogEntryType::try_from(100u8).is_err());
    }

    fn key_part() -> impl proptest::strategy::Strategy<Value = KeyPart> {
        use proptest::prelude::*;
        prop_oneof![
            any::<i64>().prop_map(KeyPart::Index),
            "[a-z_]{1,12}".prop_map(KeyPart::Name),
        ]
    }

    fn stored_value() -> impl proptest::strategy::Strategy<Value = StoredValue> {
        use proptest::prelude::*;
        prop_oneof![
            any::<bool>().prop_map(StoredValue::Bool),
            any::<i64>().prop_map(StoredValue::Int),
            "\\PC{0,32}".prop_map(StoredValue::Str),
        ]
    }

    proptest::proptest! {
        #[test]
        fn test_truncated_record_is_never_decoded(
            key in proptest::collection::vec(key_part(), 1..6),
            value in stored_value(),
            cut in 0usize..64,
        ) {
            let entry = put(&key, value);
            let encoded = LogRecord::from_entry(&entry, 7).unwrap().encode().unwrap();

            let mut whole = BytesMut::from(&encoded[..]);
            let decoded = LogRecord::decode(&mut whole, 0).unwrap().unwrap();
            proptest::prop_assert_eq!(decoded.entry().unwrap(), entry);

            let cut = cut.min(encoded.len() - 1);
            let mut partial = BytesMut::from(&encoded[..cut]);
            proptest::prop_assert!(LogRecord::decode(&mut partial, 0).unwrap().is_none());
        }
    }

    #[test]
    fn test_record_too_large() {
        let huge_payload = Bytes::from(vec![0u8; MAX_RECORD_SIZE + 1]);
        let record = LogRecord::new(LogEntryType::Put, 1, huge_payload);
        assert!(matches!(
            record.encode(),
            Err(LogError::RecordTooLarge { .. })
        ));
    }
}
