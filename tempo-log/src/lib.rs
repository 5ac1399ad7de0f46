//! Partitioned event log boundary for tempo.
//!
//! The consumer engine needs four things from a broker, per topic:
//! the end offset of the partition "now", the first offset at or after a
//! timestamp, a reader that can seek to an offset, and an ordered stream of
//! `(key, value, timestamp, offset)` records from that reader.
//!
//! # Key Types
//!
//! - [`Broker`] - Resolves offsets and creates readers for a topic
//! - [`PartitionReader`] - Seeks and polls records from one partition
//! - [`MemoryBroker`] - In-memory single-partition broker for tests and replay dumps
//! - `IggyBroker` - Iggy-backed broker (feature `iggy`)

pub mod config;
pub mod error;
#[cfg(feature = "iggy")]
pub mod iggy_log;
pub mod memory;
pub mod traits;

// Re-exports
pub use config::BrokerConfig;
pub use error::{Error, Result};
#[cfg(feature = "iggy")]
pub use iggy_log::IggyBroker;
pub use memory::MemoryBroker;
pub use traits::{Broker, Offset, PartitionReader, Record, RecordBatch, SeekPosition, Timestamp};
