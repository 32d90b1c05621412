//! Persistence interface and the in-memory backend.

use crate::domain::errors::StorageError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Byte-level storage for append-only streams and their latest snapshot.
///
/// Positions are 1-based; an empty stream has head 0.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Appends `records` iff the stream head equals `expected_head`.
    /// Returns the new head.
    async fn append(
        &self,
        stream: &str,
        expected_head: u64,
        records: Vec<Vec<u8>>,
    ) -> Result<u64, StorageError>;

    /// Records at positions `from..=head`, in order.
    async fn read_range(&self, stream: &str, from: u64) -> Result<Vec<Vec<u8>>, StorageError>;

    async fn head(&self, stream: &str) -> Result<u64, StorageError>;

    /// Replaces the stream's snapshot.
    async fn write_snapshot(
        &self,
        stream: &str,
        sequence: u64,
        bytes: Vec<u8>,
    ) -> Result<(), StorageError>;

    /// Latest snapshot and the sequence it was taken at.
    async fn read_latest(&self, stream: &str) -> Result<Option<(u64, Vec<u8>)>, StorageError>;

    /// Names of every non-empty stream.
    async fn streams(&self) -> Result<Vec<String>, StorageError>;
}

/// Backend keeping everything in process memory.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    logs: Mutex<HashMap<String, Vec<Vec<u8>>>>,
    snapshots: Mutex<HashMap<String, (u64, Vec<u8>)>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for InMemoryBackend {
    async fn append(
        &self,
        stream: &str,
        expected_head: u64,
        records: Vec<Vec<u8>>,
    ) -> Result<u64, StorageError> {
        let mut logs = self.logs.lock();
        let log = logs.entry(stream.to_string()).or_default();
        let actual = log.len() as u64;
        if actual != expected_head {
            return Err(StorageError::SequenceMismatch {
                stream: stream.to_string(),
                expected: expected_head,
                actual,
            });
        }
        log.extend(records);
        Ok(log.len() as u64)
    }

    async fn read_range(&self, stream: &str, from: u64) -> Result<Vec<Vec<u8>>, StorageError> {
        let logs = self.logs.lock();
        let Some(log) = logs.get(stream) else {
            return Ok(Vec::new());
        };
        let skip = usize::try_from(from.saturating_sub(1)).unwrap_or(usize::MAX);
        Ok(log.iter().skip(skip).cloned().collect())
    }

    async fn head(&self, stream: &str) -> Result<u64, StorageError> {
        Ok(self
            .logs
            .lock()
            .get(stream)
            .map_or(0, |log| log.len() as u64))
    }

    async fn write_snapshot(
        &self,
        stream: &str,
        sequence: u64,
        bytes: Vec<u8>,
    ) -> Result<(), StorageError> {
        self.snapshots
            .lock()
            .insert(stream.to_string(), (sequence, bytes));
        Ok(())
    }

    async fn read_latest(&self, stream: &str) -> Result<Option<(u64, Vec<u8>)>, StorageError> {
        Ok(self.snapshots.lock().get(stream).cloned())
    }

    async fn streams(&self) -> Result<Vec<String>, StorageError> {
        let mut names: Vec<String> = self
            .logs
            .lock()
            .iter()
            .filter(|(_, log)| !log.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }
}
