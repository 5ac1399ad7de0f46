//! Iggy-backed Broker implementation.
//!
//! Each tempo topic maps to an Iggy topic inside the configured stream and is
//! read from a single partition. Iggy stamps messages in microseconds; records
//! are exposed with millisecond timestamps.
//!
//! Iggy uses a message key only to choose the partition on send and does not
//! store it with the message, so records read through [`IggyBroker`] have no
//! key. Producers that need keyed handlers should carry the key in the payload.

use std::time::Duration;

use async_trait::async_trait;
use iggy::prelude::*;
use tracing::{debug, info};

use crate::config::BrokerConfig;
use crate::error::{Error, Result};
use crate::traits::{
    Broker, Offset, PartitionReader, Record, RecordBatch, SeekPosition, Timestamp,
};

fn named(name: &str) -> Result<Identifier> {
    Identifier::named(name).map_err(|e| Error::Iggy(format!("Invalid name '{}': {}", name, e)))
}

fn to_record(topic: &str, msg: &IggyMessage) -> Record {
    Record {
        topic: topic.to_string(),
        // Not stored by Iggy.
        key: None,
        value: if msg.payload.is_empty() {
            None
        } else {
            Some(msg.payload.to_vec())
        },
        timestamp: (msg.header.timestamp / 1_000) as Timestamp,
        offset: msg.header.offset,
    }
}

/// Build, connect and log in a client for `config`.
async fn connect_client(config: &BrokerConfig) -> Result<IggyClient> {
    let client = IggyClient::builder()
        .with_tcp()
        .with_server_address(config.connection_address())
        .build()
        .map_err(|e| Error::Connection(e.to_string()))?;

    client.connect().await?;
    client
        .login_user(&config.username, &config.password)
        .await?;
    Ok(client)
}

/// Poll at most `count` messages from the configured partition.
async fn poll_raw(
    client: &IggyClient,
    config: &BrokerConfig,
    topic: &str,
    strategy: &PollingStrategy,
    count: u32,
) -> Result<PolledMessages> {
    let stream_id = named(&config.stream)?;
    let topic_id = named(topic)?;
    let consumer = Consumer::new(named(&config.consumer_name)?);

    let polled = client
        .poll_messages(
            &stream_id,
            &topic_id,
            Some(config.partition_id),
            &consumer,
            strategy,
            count,
            false, // auto_commit = false, offsets are owned by the reader
        )
        .await?;
    Ok(polled)
}

/// Iggy-backed implementation of [`Broker`].
pub struct IggyBroker {
    config: BrokerConfig,
    client: IggyClient,
}

impl IggyBroker {
    /// Connect to the Iggy server described by `config`.
    pub async fn connect(config: BrokerConfig) -> Result<Self> {
        let client = connect_client(&config).await?;
        info!(
            address = %config.connection_address(),
            stream = %config.stream,
            "Connected to Iggy broker"
        );
        Ok(Self { config, client })
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }
}

#[async_trait]
impl Broker for IggyBroker {
    async fn end_offset(&self, topic: &str) -> Result<Offset> {
        let polled = poll_raw(
            &self.client,
            &self.config,
            topic,
            &PollingStrategy::last(),
            1,
        )
        .await?;

        Ok(polled
            .messages
            .last()
            .map_or(0, |msg| msg.header.offset + 1))
    }

    async fn offset_for_timestamp(
        &self,
        topic: &str,
        timestamp: Timestamp,
    ) -> Result<Option<Offset>> {
        let micros = timestamp.max(0) as u64 * 1_000;
        let strategy = PollingStrategy::timestamp(IggyTimestamp::from(micros));
        let polled = poll_raw(&self.client, &self.config, topic, &strategy, 1).await?;

        let offset = polled.messages.first().map(|msg| msg.header.offset);
        debug!(topic, timestamp, ?offset, "Resolved offset for timestamp");
        Ok(offset)
    }

    async fn reader(&self, topic: &str) -> Result<Box<dyn PartitionReader>> {
        // Each reader gets its own connection.
        let client = connect_client(&self.config).await?;

        Ok(Box::new(IggyReader {
            client,
            config: self.config.clone(),
            topic: topic.to_string(),
            position: 0,
        }))
    }
}

/// Reader over one Iggy partition.
struct IggyReader {
    client: IggyClient,
    config: BrokerConfig,
    topic: String,
    position: Offset,
}

#[async_trait]
impl PartitionReader for IggyReader {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn seek(&mut self, position: SeekPosition) -> Result<()> {
        self.position = match position {
            SeekPosition::Beginning => 0,
            SeekPosition::Offset(o) => o,
            SeekPosition::End => {
                let polled = poll_raw(
                    &self.client,
                    &self.config,
                    &self.topic,
                    &PollingStrategy::last(),
                    1,
                )
                .await?;
                polled
                    .messages
                    .last()
                    .map_or(0, |msg| msg.header.offset + 1)
            }
        };
        debug!(topic = %self.topic, position = self.position, "Seeked Iggy reader");
        Ok(())
    }

    async fn poll(&mut self, max_count: usize, timeout: Duration) -> Result<RecordBatch> {
        let strategy = PollingStrategy::offset(self.position);
        let count = u32::try_from(max_count).unwrap_or(u32::MAX);

        let polled = poll_raw(&self.client, &self.config, &self.topic, &strategy, count)
            .await
            .map_err(|e| Error::Poll {
                topic: self.topic.clone(),
                message: e.to_string(),
            })?;

        if polled.messages.is_empty() {
            tokio::time::sleep(timeout.min(self.config.empty_poll_backoff)).await;
            return Ok(RecordBatch::empty());
        }

        let records: Vec<Record> = polled
            .messages
            .iter()
            .map(|msg| to_record(&self.topic, msg))
            .collect();

        if let Some(last) = records.last() {
            self.position = last.offset + 1;
        }

        Ok(RecordBatch::new(records))
    }
}
