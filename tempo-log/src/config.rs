//! Configuration for connecting to an Iggy broker.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Connection settings for the Iggy-backed broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Broker host.
    #[serde(default = "default_host")]
    pub host: String,

    /// TCP port of the Iggy server.
    #[serde(default = "default_port")]
    pub port: u16,

    /// User to log in as.
    #[serde(default = "default_username")]
    pub username: String,

    /// Password for `username`.
    #[serde(default = "default_password")]
    pub password: String,

    /// Stream that holds the topics.
    #[serde(default = "default_stream")]
    pub stream: String,

    /// Partition read by every reader (topics are single-partition).
    #[serde(default)]
    pub partition_id: u32,

    /// Consumer name used for polling.
    #[serde(default = "default_consumer_name")]
    pub consumer_name: String,

    /// How long an empty poll waits before returning.
    #[serde(default = "default_empty_poll_backoff", with = "humantime_serde")]
    pub empty_poll_backoff: Duration,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8090
}

fn default_username() -> String {
    "iggy".to_string()
}

fn default_password() -> String {
    "iggy".to_string()
}

fn default_stream() -> String {
    "tempo".to_string()
}

fn default_consumer_name() -> String {
    "tempo-replay".to_string()
}

fn default_empty_poll_backoff() -> Duration {
    Duration::from_millis(50)
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            username: default_username(),
            password: default_password(),
            stream: default_stream(),
            partition_id: 0,
            consumer_name: default_consumer_name(),
            empty_poll_backoff: default_empty_poll_backoff(),
        }
    }
}

impl BrokerConfig {
    /// Create a new config with a custom host.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Create a new config with a custom port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Create a new config with a custom stream name.
    #[must_use]
    pub fn with_stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = stream.into();
        self
    }

    /// Create a new config with custom credentials.
    #[must_use]
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Get the TCP connection address for clients.
    #[must_use]
    pub fn connection_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
