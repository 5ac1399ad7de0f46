//! Error types for tempo-consumer

use thiserror::Error;

use crate::phase::Phase;

/// Errors raised by consumers, their parameters and their configuration.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Invalid consuming params: {0}")]
    InvalidParams(String),

    #[error(
        "Phase change from {from} to {to} is not allowed; available next phases: {}",
        join_phases(.allowed)
    )]
    IllegalTransition {
        from: Phase,
        to: Phase,
        allowed: Vec<Phase>,
    },

    #[error("{operation} is available for the past time interval regime only")]
    RegimeMismatch { operation: &'static str },

    #[error("{operation} must be called before the consumer is started")]
    AlreadyStarted { operation: &'static str },

    #[error("Handler event type must be '{expected}', but it is '{actual}'")]
    EventTypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Topic not defined for event type: {0}")]
    TopicNotDefined(String),

    #[error("More than one event type is mapped to topic: {0}")]
    DuplicateTopic(String),

    #[error("Event type is mapped more than once: {0}")]
    DuplicateEventType(String),

    #[error("Broker error: {0}")]
    Broker(#[from] tempo_log::Error),

    #[error("Failed to decode {record}: {source}")]
    Decode {
        record: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Event handler failed on {record}: {message}")]
    Handler { record: String, message: String },

    #[error("{handler} panicked: {message}")]
    HandlerPanicked {
        handler: &'static str,
        message: String,
    },

    #[error("{handler} panicked on {record}: {message}")]
    RecordHandlerPanicked {
        handler: &'static str,
        record: String,
        message: String,
    },

    #[error("Consumer {consumer_id} failed: {source}")]
    FanOut {
        consumer_id: String,
        #[source]
        source: Box<ConsumerError>,
    },

    #[error("Consumer {consumer_id} reported: {message}")]
    Forwarded { consumer_id: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for consumer operations.
pub type Result<T> = std::result::Result<T, ConsumerError>;

fn join_phases(phases: &[Phase]) -> String {
    if phases.is_empty() {
        return "none".to_string();
    }
    phases
        .iter()
        .map(|p| p.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl ConsumerError {
    /// Wrap an error raised by the sub-consumer `consumer_id`.
    pub(crate) fn fan_out(consumer_id: &str, source: ConsumerError) -> Self {
        ConsumerError::FanOut {
            consumer_id: consumer_id.to_string(),
            source: Box::new(source),
        }
    }
}
