//! Event typing, handler slots and record filters.

use std::any::{Any, TypeId};
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use tempo_log::{Offset, Record, Timestamp};

use crate::error::{ConsumerError, Result};
use crate::phase::Phase;

/// Boxed error returned by user event handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of one event handler invocation.
pub type HandlerResult = std::result::Result<(), BoxError>;

/// A typed event carried on exactly one topic.
///
/// Payloads are JSON documents decoded with `serde_json`.
pub trait Event: DeserializeOwned + Send + 'static {
    /// Name used to resolve the event's topic.
    const EVENT_TYPE: &'static str;
}

/// Runtime identity of an [`Event`] type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventType {
    name: &'static str,
    id: TypeId,
}

impl EventType {
    #[must_use]
    pub fn of<T: Event>() -> Self {
        Self {
            name: T::EVENT_TYPE,
            id: TypeId::of::<T>(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name)
    }
}

/// Record metadata visible to filters.
#[derive(Debug, Clone, Copy)]
pub struct RecordMeta<'a> {
    pub topic: &'a str,
    pub key: Option<&'a str>,
    pub offset: Offset,
    pub timestamp: Timestamp,
}

impl<'a> From<&'a Record> for RecordMeta<'a> {
    fn from(record: &'a Record) -> Self {
        Self {
            topic: &record.topic,
            key: record.key.as_deref(),
            offset: record.offset,
            timestamp: record.timestamp,
        }
    }
}

/// Predicate deciding whether a record is delivered.
pub type Filter = Arc<dyn Fn(&RecordMeta<'_>) -> bool + Send + Sync>;

/// Called after every phase change.
pub type PhaseChangedHandler = Arc<dyn Fn(Phase) + Send + Sync>;

/// Receives handler failures, decode failures and broker failures.
pub type ErrorHandler = Arc<dyn Fn(&ConsumerError) + Send + Sync>;

/// Receives playback-clock ticks (epoch ms).
pub type PlaybackTimeHandler = Arc<dyn Fn(Timestamp) + Send + Sync>;

/// Called when a running consumer has received nothing for its idle interval.
pub type IdleHandler = Arc<dyn Fn() + Send + Sync>;

/// Type-erased event handler: decodes the record and runs the user handler.
pub(crate) type RecordHandler = Arc<dyn Fn(Record) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wrap a typed handler into a [`RecordHandler`].
///
/// Records without a value never reach the wrapper.
pub(crate) fn record_handler<T, F, Fut>(handler: F) -> RecordHandler
where
    T: Event,
    F: Fn(Option<String>, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    let handler = Arc::new(handler);
    Arc::new(move |record: Record| -> BoxFuture<'static, Result<()>> {
        let handler = Arc::clone(&handler);
        Box::pin(async move {
            let identity = record.to_string();
            let payload = record.value.unwrap_or_default();
            let event: T = serde_json::from_slice(&payload).map_err(|source| {
                ConsumerError::Decode {
                    record: identity.clone(),
                    source,
                }
            })?;

            handler(record.key, event)
                .await
                .map_err(|e| ConsumerError::Handler {
                    record: identity,
                    message: e.to_string(),
                })
        })
    })
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::Mutex;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Position {
        x: f64,
        y: f64,
    }

    impl Event for Position {
        const EVENT_TYPE: &'static str = "position";
    }

    #[derive(Debug, Deserialize)]
    struct Alarm {}

    impl Event for Alarm {
        const EVENT_TYPE: &'static str = "alarm";
    }

    fn record(value: &[u8]) -> Record {
        Record {
            topic: "positions".to_string(),
            key: Some("obj-1".to_string()),
            value: Some(value.to_vec()),
            timestamp: 1_000,
            offset: 3,
        }
    }

    #[test]
    fn event_type_identity() {
        assert_eq!(EventType::of::<Position>(), EventType::of::<Position>());
        assert_ne!(EventType::of::<Position>(), EventType::of::<Alarm>());
        assert_eq!(EventType::of::<Alarm>().name(), "alarm");
        assert_eq!(EventType::of::<Position>().to_string(), "position");
    }

    #[tokio::test]
    async fn record_handler_decodes_and_passes_key() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler = record_handler(move |key, event: Position| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push((key, event));
                Ok::<(), BoxError>(())
            }
        });

        handler(record(br#"{"x":1.0,"y":2.0}"#)).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0.as_deref(), Some("obj-1"));
        assert_eq!(seen[0].1, Position { x: 1.0, y: 2.0 });
    }

    #[tokio::test]
    async fn record_handler_reports_decode_failure() {
        let handler = record_handler(|_, _: Position| async { Ok::<(), BoxError>(()) });

        let err = handler(record(b"not json")).await.unwrap_err();
        match err {
            ConsumerError::Decode { record, .. } => assert!(record.contains("o:3")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn record_handler_wraps_handler_failure() {
        let handler =
            record_handler(|_, _: Position| async { Err::<(), BoxError>("boom".into()) });

        let err = handler(record(br#"{"x":0,"y":0}"#)).await.unwrap_err();
        assert!(matches!(err, ConsumerError::Handler { ref message, .. } if message == "boom"));
    }

    #[test]
    fn record_meta_borrows_record_fields() {
        let record = record(b"{}");
        let meta = RecordMeta::from(&record);
        assert_eq!(meta.topic, "positions");
        assert_eq!(meta.key, Some("obj-1"));
        assert_eq!(meta.offset, 3);
        assert_eq!(meta.timestamp, 1_000);
    }

    #[test]
    fn panic_message_extracts_text() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(payload.as_ref()), "static");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn Any + Send> = Box::new(42);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
