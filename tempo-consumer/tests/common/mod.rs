//! Shared fixtures for consumer integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tempo_consumer::{ConsumingParams, ConsumingRegime, Event, Phase};
use tempo_log::MemoryBroker;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub seq: u32,
}

impl Event for Position {
    const EVENT_TYPE: &'static str = "position";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alarm {
    pub code: String,
}

impl Event for Alarm {
    const EVENT_TYPE: &'static str = "alarm";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {}

impl Event for Heartbeat {
    const EVENT_TYPE: &'static str = "heartbeat";
}

/// Record timestamp base one hour in the past, truncated to whole millis.
pub fn base_ts() -> i64 {
    (Utc::now() - Duration::hours(1)).timestamp_millis()
}

pub fn at(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ts).unwrap()
}

pub fn replay_from(from_ts: i64, rate: f64) -> ConsumingParams {
    ConsumingParams::builder(ConsumingRegime::PastTimeInterval)
        .from(at(from_ts))
        .with_rate(rate)
        .build()
        .unwrap()
}

pub fn replay_between(from_ts: i64, to_ts: i64, rate: f64) -> ConsumingParams {
    ConsumingParams::builder(ConsumingRegime::PastTimeInterval)
        .from(at(from_ts))
        .to(at(to_ts))
        .with_rate(rate)
        .build()
        .unwrap()
}

/// Append one `Position` per timestamp, numbered from zero.
pub async fn append_positions(broker: &MemoryBroker, topic: &str, timestamps: &[i64]) {
    for (seq, ts) in timestamps.iter().enumerate() {
        broker
            .append_json(topic, Some("vehicle-1"), &Position { seq: seq as u32 }, *ts)
            .await
            .unwrap();
    }
}

/// Deliveries observed by a handler, with the (tokio) time they happened.
#[derive(Clone, Default)]
pub struct Deliveries {
    inner: Arc<Mutex<Vec<(Instant, u32)>>>,
}

impl Deliveries {
    pub fn push(&self, seq: u32) {
        self.inner.lock().unwrap().push((Instant::now(), seq));
    }

    pub fn seqs(&self) -> Vec<u32> {
        self.inner.lock().unwrap().iter().map(|(_, s)| *s).collect()
    }

    /// Milliseconds between consecutive deliveries.
    pub fn gaps_ms(&self) -> Vec<u128> {
        let deliveries = self.inner.lock().unwrap();
        deliveries
            .windows(2)
            .map(|w| (w[1].0 - w[0].0).as_millis())
            .collect()
    }
}

/// Phases reported to a phase-changed handler.
#[derive(Clone, Default)]
pub struct PhaseLog {
    inner: Arc<Mutex<Vec<Phase>>>,
}

impl PhaseLog {
    pub fn handler(&self) -> tempo_consumer::PhaseChangedHandler {
        let inner = Arc::clone(&self.inner);
        Arc::new(move |phase: Phase| inner.lock().unwrap().push(phase))
    }

    pub fn phases(&self) -> Vec<Phase> {
        self.inner.lock().unwrap().clone()
    }

    pub fn count(&self, phase: Phase) -> usize {
        self.phases().iter().filter(|p| **p == phase).count()
    }
}

pub fn assert_close(actual: u128, expected: u128) {
    let diff = actual.abs_diff(expected);
    assert!(diff <= 5, "expected ~{expected}ms, got {actual}ms");
}
