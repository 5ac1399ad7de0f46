//! In-memory Broker implementation.
//!
//! Every topic is a single partition held in a `Vec`. Readers wake up on
//! appends, so real-time consumers see new records without busy polling.
//! Useful for testing and for replaying recorded dumps without a broker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::traits::{
    Broker, Offset, PartitionReader, Record, RecordBatch, SeekPosition, Timestamp,
};

/// Shared state between the broker and its readers.
#[derive(Default)]
struct SharedState {
    topics: RwLock<HashMap<String, Vec<Record>>>,
    /// Topics whose next poll should fail.
    failing: RwLock<HashMap<String, String>>,
    notify: Notify,
}

/// In-memory implementation of [`Broker`].
#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<SharedState>,
}

impl MemoryBroker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a raw record to a topic, creating the topic if needed.
    pub async fn append(
        &self,
        topic: &str,
        key: Option<&str>,
        value: Option<Vec<u8>>,
        timestamp: Timestamp,
    ) -> Offset {
        let mut topics = self.shared.topics.write().await;
        let partition = topics.entry(topic.to_string()).or_default();
        let offset = partition.len() as Offset;

        partition.push(Record {
            topic: topic.to_string(),
            key: key.map(str::to_string),
            value,
            timestamp,
            offset,
        });

        self.shared.notify.notify_waiters();
        offset
    }

    /// Serialize `event` as JSON and append it.
    pub async fn append_json<T: Serialize>(
        &self,
        topic: &str,
        key: Option<&str>,
        event: &T,
        timestamp: Timestamp,
    ) -> Result<Offset> {
        let payload = serde_json::to_vec(event)?;
        Ok(self.append(topic, key, Some(payload), timestamp).await)
    }

    /// Number of records in a topic.
    pub async fn len(&self, topic: &str) -> usize {
        self.shared
            .topics
            .read()
            .await
            .get(topic)
            .map_or(0, Vec::len)
    }

    /// Make the next poll on `topic` fail with `message`.
    pub async fn fail_next_poll(&self, topic: &str, message: impl Into<String>) {
        self.shared
            .failing
            .write()
            .await
            .insert(topic.to_string(), message.into());
        self.shared.notify.notify_waiters();
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn end_offset(&self, topic: &str) -> Result<Offset> {
        Ok(self.len(topic).await as Offset)
    }

    async fn offset_for_timestamp(
        &self,
        topic: &str,
        timestamp: Timestamp,
    ) -> Result<Option<Offset>> {
        let topics = self.shared.topics.read().await;
        let offset = topics.get(topic).and_then(|records| {
            records
                .iter()
                .find(|r| r.timestamp >= timestamp)
                .map(|r| r.offset)
        });

        debug!(topic, timestamp, ?offset, "Resolved offset for timestamp");
        Ok(offset)
    }

    async fn reader(&self, topic: &str) -> Result<Box<dyn PartitionReader>> {
        Ok(Box::new(MemoryReader {
            topic: topic.to_string(),
            shared: Arc::clone(&self.shared),
            position: 0,
        }))
    }
}

/// Reader over one in-memory topic.
struct MemoryReader {
    topic: String,
    shared: Arc<SharedState>,
    position: Offset,
}

impl MemoryReader {
    async fn take_failure(&self) -> Option<Error> {
        self.shared
            .failing
            .write()
            .await
            .remove(&self.topic)
            .map(|message| Error::Poll {
                topic: self.topic.clone(),
                message,
            })
    }

    async fn read_available(&mut self, max_count: usize) -> RecordBatch {
        let topics = self.shared.topics.read().await;
        let Some(records) = topics.get(&self.topic) else {
            return RecordBatch::empty();
        };

        let start = self.position as usize;
        if start >= records.len() {
            return RecordBatch::empty();
        }

        let end = std::cmp::min(start + max_count, records.len());
        let batch: Vec<Record> = records[start..end].to_vec();
        self.position = end as Offset;

        RecordBatch::new(batch)
    }
}

#[async_trait]
impl PartitionReader for MemoryReader {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn seek(&mut self, position: SeekPosition) -> Result<()> {
        self.position = match position {
            SeekPosition::Beginning => 0,
            SeekPosition::End => self
                .shared
                .topics
                .read()
                .await
                .get(&self.topic)
                .map_or(0, |r| r.len() as Offset),
            SeekPosition::Offset(o) => o,
        };
        debug!(topic = %self.topic, position = self.position, "Seeked reader");
        Ok(())
    }

    async fn poll(&mut self, max_count: usize, timeout: Duration) -> Result<RecordBatch> {
        // Register interest before checking so an append in between is not missed.
        let shared = Arc::clone(&self.shared);
        let notified = shared.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if let Some(e) = self.take_failure().await {
            return Err(e);
        }

        let batch = self.read_available(max_count).await;
        if !batch.is_empty() {
            return Ok(batch);
        }

        trace!(topic = %self.topic, "No records available, waiting");
        if tokio::time::timeout(timeout, notified).await.is_err() {
            return Ok(RecordBatch::empty());
        }

        if let Some(e) = self.take_failure().await {
            return Err(e);
        }
        Ok(self.read_available(max_count).await)
    }
}
