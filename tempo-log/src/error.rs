//! Error types for the event log boundary.

/// Error type for broker operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The broker could not be reached or the session was lost.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A poll against the partition failed.
    #[error("Poll failed on topic '{topic}': {message}")]
    Poll { topic: String, message: String },

    /// Payload could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Error reported by the Iggy SDK.
    #[error("Iggy error: {0}")]
    Iggy(String),
}

#[cfg(feature = "iggy")]
impl From<iggy::prelude::IggyError> for Error {
    fn from(e: iggy::prelude::IggyError) -> Self {
        Self::Iggy(e.to_string())
    }
}

/// Result type alias for broker operations.
pub type Result<T> = std::result::Result<T, Error>;
