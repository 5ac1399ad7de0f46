//! JSON-lines record dumps.
//!
//! One record per line:
//!
//! ```text
//! {"topic":"positions","key":"truck-7","timestamp":1714557600000,"value":{"lat":52.1,"lon":4.3}}
//! ```
//!
//! `timestamp` is epoch milliseconds. `key` and `value` may be omitted or null.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tempo_log::{MemoryBroker, Timestamp};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DumpRecord {
    pub topic: String,
    #[serde(default)]
    pub key: Option<String>,
    pub timestamp: Timestamp,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
}

/// Records grouped by topic, each topic ordered by timestamp.
#[derive(Debug, Default)]
pub struct Dump {
    topics: BTreeMap<String, Vec<DumpRecord>>,
}

impl Dump {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read dump {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut dump = Self::default();
        for (index, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let record: DumpRecord = serde_json::from_str(line)
                .with_context(|| format!("Invalid record on line {}", index + 1))?;
            dump.topics.entry(record.topic.clone()).or_default().push(record);
        }

        // Timestamp lookups assume offsets follow time.
        for records in dump.topics.values_mut() {
            records.sort_by_key(|r| r.timestamp);
        }
        Ok(dump)
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.topics.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.topics.values().map(Vec::len).sum()
    }

    pub fn earliest(&self) -> Option<Timestamp> {
        self.topics
            .values()
            .filter_map(|records| records.first())
            .map(|r| r.timestamp)
            .min()
    }

    /// Append every record to `broker`, topic by topic.
    pub async fn load_into(&self, broker: &MemoryBroker) -> Result<()> {
        for (topic, records) in &self.topics {
            for record in records {
                let value = record
                    .value
                    .as_ref()
                    .map(serde_json::to_vec)
                    .transpose()?;
                broker
                    .append(topic, record.key.as_deref(), value, record.timestamp)
                    .await;
            }
            debug!(%topic, records = records.len(), "Topic loaded");
        }
        Ok(())
    }
}
