//! Consumer settings, worker options and the event type to topic mapping.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ConsumerError, Result};
use crate::params::{ConsumingParams, ConsumingRegime};

/// Format of `from` / `to` in settings files, interpreted as UTC.
pub const DATE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Parse a `"YYYY-MM-DD HH:MM:SS"` UTC timestamp.
pub fn parse_date_time(value: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value.trim(), DATE_TIME_FORMAT)
        .map(|dt| dt.and_utc())
        .map_err(|e| {
            ConsumerError::Config(format!(
                "invalid date time '{value}', expected YYYY-MM-DD HH:MM:SS: {e}"
            ))
        })
}

/// Tuning for a consumer's worker loop.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerOptions {
    /// Maximum records per poll.
    pub batch_size: usize,
    /// How long one poll waits for records.
    pub poll_timeout: Duration,
    /// How long `stop()` waits for the worker before aborting it.
    pub shutdown_timeout: Duration,
    /// Quiet period after which the idle handler fires.
    pub idle_interval: Option<Duration>,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            poll_timeout: default_poll_timeout(),
            shutdown_timeout: default_shutdown_timeout(),
            idle_interval: None,
        }
    }
}

impl ConsumerOptions {
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    #[must_use]
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = Some(interval);
        self
    }
}

fn default_rate() -> f64 {
    1.0
}

fn default_batch_size() -> usize {
    100
}

fn default_poll_timeout() -> Duration {
    Duration::from_millis(100)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_millis(100)
}

/// Consumer section of a settings file.
///
/// ```toml
/// from = "2024-05-01 10:00:00"
/// to = "2024-05-01 11:00:00"
/// rate = 4.0
/// idle_interval = "30s"
///
/// [topics]
/// position = "positions"
/// alarm = "alarms"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerSettings {
    /// Interval start; absent means real time.
    #[serde(default)]
    pub from: Option<String>,

    /// Interval end; absent means open-ended.
    #[serde(default)]
    pub to: Option<String>,

    #[serde(default = "default_rate")]
    pub rate: f64,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_poll_timeout", with = "humantime_serde")]
    pub poll_timeout: Duration,

    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    #[serde(default, with = "humantime_serde")]
    pub idle_interval: Option<Duration>,

    /// Event type name → topic name.
    #[serde(default)]
    pub topics: BTreeMap<String, String>,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            from: None,
            to: None,
            rate: default_rate(),
            batch_size: default_batch_size(),
            poll_timeout: default_poll_timeout(),
            shutdown_timeout: default_shutdown_timeout(),
            idle_interval: None,
            topics: BTreeMap::new(),
        }
    }
}

impl ConsumerSettings {
    /// Parse settings from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| ConsumerError::Config(e.to_string()))
    }

    /// Read settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConsumerError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Validated params: past time interval when `from` is set, else real time.
    pub fn consuming_params(&self) -> Result<ConsumingParams> {
        let Some(from) = self.from.as_deref() else {
            if self.to.is_some() {
                return Err(ConsumerError::Config("'to' requires 'from'".to_string()));
            }
            return ConsumingParams::builder(ConsumingRegime::RealTime)
                .with_rate(self.rate)
                .build();
        };

        let mut builder = ConsumingParams::builder(ConsumingRegime::PastTimeInterval)
            .from(parse_date_time(from)?)
            .with_rate(self.rate);
        if let Some(to) = self.to.as_deref() {
            builder = builder.to(parse_date_time(to)?);
        }
        builder.build()
    }

    #[must_use]
    pub fn options(&self) -> ConsumerOptions {
        ConsumerOptions {
            batch_size: self.batch_size.max(1),
            poll_timeout: self.poll_timeout,
            shutdown_timeout: self.shutdown_timeout,
            idle_interval: self.idle_interval,
        }
    }

    pub fn topic_map(&self) -> Result<TopicMap> {
        TopicMap::from_pairs(
            self.topics
                .iter()
                .map(|(event_type, topic)| (event_type.as_str(), topic.as_str())),
        )
    }
}

/// One-to-one mapping between event type names and topics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicMap {
    by_event_type: HashMap<String, String>,
}

impl TopicMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(event type, topic)` pairs.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Result<Self> {
        let mut map = Self::new();
        for (event_type, topic) in pairs {
            map.insert(event_type, topic)?;
        }
        Ok(map)
    }

    /// Map `event_type` to `topic`, rejecting reuse of either side.
    pub fn insert(&mut self, event_type: impl Into<String>, topic: impl Into<String>) -> Result<()> {
        let event_type = event_type.into();
        let topic = topic.into();

        if self.by_event_type.contains_key(&event_type) {
            return Err(ConsumerError::DuplicateEventType(event_type));
        }
        if self.by_event_type.values().any(|t| *t == topic) {
            return Err(ConsumerError::DuplicateTopic(topic));
        }
        self.by_event_type.insert(event_type, topic);
        Ok(())
    }

    /// Builder-style [`TopicMap::insert`].
    pub fn with(mut self, event_type: impl Into<String>, topic: impl Into<String>) -> Result<Self> {
        self.insert(event_type, topic)?;
        Ok(self)
    }

    /// Topic carrying `event_type`.
    pub fn resolve(&self, event_type: &str) -> Result<&str> {
        self.by_event_type
            .get(event_type)
            .map(String::as_str)
            .ok_or_else(|| ConsumerError::TopicNotDefined(event_type.to_string()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_event_type.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_event_type.is_empty()
    }

    /// `(event type, topic)` pairs in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.by_event_type
            .iter()
            .map(|(e, t)| (e.as_str(), t.as_str()))
    }
}
