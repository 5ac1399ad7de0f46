//! Core traits for reading a partitioned event log.

use std::time::Duration;

use async_trait::async_trait;

/// Offset of a record within a partition.
pub type Offset = u64;

/// Record timestamp in milliseconds since the Unix epoch.
pub type Timestamp = i64;

/// Position to seek a reader to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekPosition {
    /// Start from the beginning.
    Beginning,
    /// Start from the end (new records only).
    End,
    /// Start from a specific offset.
    Offset(Offset),
}

/// A single record read from a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Topic the record was read from.
    pub topic: String,
    /// Record key, if the producer set one.
    pub key: Option<String>,
    /// Raw payload. `None` for tombstones.
    pub value: Option<Vec<u8>>,
    /// Broker timestamp (epoch ms).
    pub timestamp: Timestamp,
    /// Offset within the partition.
    pub offset: Offset,
}

impl std::fmt::Display for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}; o:{}; ts:{}] {}",
            self.topic,
            self.offset,
            self.timestamp,
            self.key.as_deref().unwrap_or("<no key>")
        )
    }
}

/// A batch of records returned from polling.
#[derive(Debug, Default)]
pub struct RecordBatch {
    /// Records in offset order.
    pub records: Vec<Record>,
}

impl RecordBatch {
    /// Create a batch from records.
    #[must_use]
    pub fn new(records: Vec<Record>) -> Self {
        Self { records }
    }

    /// Create an empty batch.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Number of records in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the batch has no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Offset of the first record.
    #[must_use]
    pub fn first_offset(&self) -> Option<Offset> {
        self.records.first().map(|r| r.offset)
    }

    /// Offset of the last record.
    #[must_use]
    pub fn last_offset(&self) -> Option<Offset> {
        self.records.last().map(|r| r.offset)
    }
}

impl IntoIterator for RecordBatch {
    type Item = Record;
    type IntoIter = std::vec::IntoIter<Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

/// Resolves partition offsets and creates readers.
///
/// Topics are assumed to have a single partition.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Offset that the next appended record will receive.
    async fn end_offset(&self, topic: &str) -> crate::Result<Offset>;

    /// Offset of the first record whose timestamp is at or after `timestamp`.
    ///
    /// Returns `None` when no such record exists (including empty topics).
    async fn offset_for_timestamp(
        &self,
        topic: &str,
        timestamp: Timestamp,
    ) -> crate::Result<Option<Offset>>;

    /// Create a reader positioned at the beginning of the topic's partition.
    async fn reader(&self, topic: &str) -> crate::Result<Box<dyn PartitionReader>>;
}

/// Reads records from one partition in offset order.
#[async_trait]
pub trait PartitionReader: Send {
    /// Topic this reader is attached to.
    fn topic(&self) -> &str;

    /// Move the read position.
    async fn seek(&mut self, position: SeekPosition) -> crate::Result<()>;

    /// Poll for up to `max_count` records, waiting at most `timeout` when
    /// none are available yet.
    async fn poll(&mut self, max_count: usize, timeout: Duration) -> crate::Result<RecordBatch>;
}
