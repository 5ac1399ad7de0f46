//! tempo-consumer: real-time and paced historical replay consumers
//!
//! This crate reads typed events from a partitioned log ([`tempo_log::Broker`])
//! and delivers them to handlers, either live from the end of each topic or
//! replayed from a past time interval at a chosen rate:
//!
//! - **Lifecycle** - [`Phase`] state machine shared by every [`Consumer`]
//! - **Single-topic consumer** - [`SingleTopicConsumer`] seeks by timestamp,
//!   paces delivery by the original record gaps and completes at the end of
//!   the interval
//! - **Multi-topic consumer** - [`MultiTopicConsumer`] merges one sub-consumer
//!   per event type into one lifecycle
//! - **Playback clock** - a ticking "current replay time" driven by the rate
//! - **Wait handles** - [`WaitHandle`] set/reset signals with multi-wait
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use chrono::{Duration, Utc};
//! use serde::Deserialize;
//! use tempo_consumer::{
//!     BoxError, Consumer, ConsumingParams, ConsumingRegime, Event, SingleTopicConsumer,
//! };
//! use tempo_log::MemoryBroker;
//!
//! #[derive(Debug, Deserialize)]
//! struct Position {
//!     lat: f64,
//!     lon: f64,
//! }
//!
//! impl Event for Position {
//!     const EVENT_TYPE: &'static str = "position";
//! }
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let broker = Arc::new(MemoryBroker::new());
//!     let consumer = SingleTopicConsumer::for_event::<Position>("positions", broker);
//!
//!     consumer.set_event_handler(|key, position: Position| async move {
//!         println!("{key:?}: {} {}", position.lat, position.lon);
//!         Ok::<(), BoxError>(())
//!     })?;
//!     consumer.set_consuming_params(
//!         ConsumingParams::builder(ConsumingRegime::PastTimeInterval)
//!             .from(Utc::now() - Duration::hours(1))
//!             .with_rate(4.0)
//!             .build()?,
//!     )?;
//!
//!     consumer.start().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │               MultiTopicConsumer               │
//! │  fan-out ──┬──────────────────────┬ phases ◄─  │
//! │  ┌─────────▼─────────┐  ┌─────────▼─────────┐  │
//! │  │SingleTopicConsumer│  │SingleTopicConsumer│  │
//! │  │ reader ─ pacer    │  │ reader ─ pacer    │  │
//! │  └─────────┬─────────┘  └─────────┬─────────┘  │
//! └────────────┼──────────────────────┼────────────┘
//!              ▼                      ▼
//!      tempo_log::Broker (one partition per topic)
//! ```

pub mod config;
pub mod consumer;
pub mod error;
pub mod event;
mod lifecycle;
pub mod multi;
mod pacer;
pub mod params;
pub mod phase;
pub mod playback;
pub mod single;
pub mod wait_handle;

// Re-export key types for convenience
pub use config::{ConsumerOptions, ConsumerSettings, DATE_TIME_FORMAT, TopicMap, parse_date_time};
pub use consumer::Consumer;
pub use error::{ConsumerError, Result};
pub use event::{
    BoxError, ErrorHandler, Event, EventType, Filter, HandlerResult, IdleHandler,
    PhaseChangedHandler, PlaybackTimeHandler, RecordMeta,
};
pub use multi::MultiTopicConsumer;
pub use params::{
    ConsumingParams, ConsumingParamsBuilder, ConsumingRegime, RATE_MAX, RATE_MIN, validate_rate,
};
pub use phase::Phase;
pub use playback::period_for_rate;
pub use single::SingleTopicConsumer;
pub use wait_handle::WaitHandle;
