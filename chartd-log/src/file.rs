//! A single log file on disk.

use crate::entry::LogRecord;
use crate::error::LogError;
use crate::RECORD_HEADER_SIZE;
use bytes::BytesMut;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Append-only file of encoded [`LogRecord`]s.
pub struct LogFile {
    path: PathBuf,
    file: File,
    size: u64,
    sync_pending: bool,
}

impl LogFile {
    /// Creates a new, empty log file. Fails if the file exists.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, LogError> {
        let path = path.into();
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;

        Ok(Self {
            path,
            file,
            size: 0,
            sync_pending: false,
        })
    }

    /// Opens an existing log file for reading and appending.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LogError> {
        let path = path.into();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let size = file.metadata()?.len();

        Ok(Self {
            path,
            file,
            size,
            sync_pending: false,
        })
    }

    /// Opens the file if present, otherwise creates it.
    pub fn open_or_create(path: impl Into<PathBuf>) -> Result<Self, LogError> {
        let path = path.into();
        if path.exists() {
            Self::open(path)
        } else {
            Self::create(path)
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Appends a record, returning its offset.
    pub fn append(&mut self, record: &LogRecord) -> Result<u64, LogError> {
        let encoded = record.encode()?;
        let offset = self.size;

        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&encoded)?;
        self.size += encoded.len() as u64;
        self.sync_pending = true;

        Ok(offset)
    }

    /// Syncs the file to disk if anything was written since the last sync.
    pub fn sync(&mut self) -> Result<bool, LogError> {
        if self.sync_pending {
            self.file.sync_data()?;
            self.sync_pending = false;
            return Ok(true);
        }
        Ok(false)
    }

    /// Reads all records with their offsets.
    pub fn read_all(&mut self) -> Result<Vec<(u64, LogRecord)>, LogError> {
        let mut records = Vec::new();
        let mut offset = 0u64;

        self.file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(&self.file);
        let mut buf = BytesMut::new();
        let mut chunk = vec![0u8; 8192];

        loop {
            match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(e) => return Err(e.into()),
            }

            while buf.len() >= RECORD_HEADER_SIZE {
                match LogRecord::decode(&mut buf, offset)? {
                    Some(record) => {
                        let record_size = record.disk_size();
                        records.push((offset, record));
                        offset += record_size as u64;
                    }
                    None => break,
                }
            }
        }

        Ok(records)
    }

    /// Truncates the file at the given offset (drops a torn tail).
    pub fn truncate_at(&mut self, offset: u64) -> Result<(), LogError> {
        self.file.set_len(offset)?;
        self.size = offset;
        self.file.seek(SeekFrom::End(0))?;
        self.sync_pending = true;
        self.sync()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{KeyPart, LogEntry, StoredValue};
    use tempfile::TempDir;

    fn put(i: i64) -> LogEntry {
        LogEntry::Put {
            key: vec![KeyPart::Index(i)],
            value: StoredValue::Int(i),
        }
    }

    #[test]
    fn test_file_create_and_append() {
        let dir = TempDir::new().unwrap();
        let mut file = LogFile::create(dir.path().join("a.clog")).unwrap();

        let record = LogRecord::from_entry(&put(1), 1).unwrap();
        let offset = file.append(&record).unwrap();
        assert_eq!(offset, 0);
        assert!(file.sync().unwrap());
        assert!(!file.sync().unwrap());
        assert_eq!(file.size(), record.disk_size() as u64);
    }

    #[test]
    fn test_file_create_existing_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.clog");
        LogFile::create(&path).unwrap();
        assert!(LogFile::create(&path).is_err());
        assert!(LogFile::open_or_create(&path).is_ok());
    }

    #[test]
    fn test_file_read_all() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.clog");
        {
            let mut file = LogFile::create(&path).unwrap();
            for i in 0..5 {
                let record = LogRecord::from_entry(&put(i), i as u64).unwrap();
                file.append(&record).unwrap();
            }
            file.sync().unwrap();
        }

        let mut file = LogFile::open(&path).unwrap();
        let records = file.read_all().unwrap();
        assert_eq!(records.len(), 5);
        for (i, (_, record)) in records.iter().enumerate() {
            assert_eq!(record.header.sequence, i as u64);
            assert_eq!(record.entry().unwrap(), put(i as i64));
        }
    }

    #[test]
    fn test_file_truncate() {
        let dir = TempDir::new().unwrap();
        let mut file = LogFile::create(dir.path().join("a.clog")).unwrap();
        let first = LogRecord::from_entry(&put(1), 1).unwrap();
        file.append(&first).unwrap();
        file.append(&LogRecord::from_entry(&put(2), 2).unwrap())
            .unwrap();

        file.truncate_at(first.disk_size() as u64).unwrap();
        assert_eq!(file.read_all().unwrap().len(), 1);
    }
}
