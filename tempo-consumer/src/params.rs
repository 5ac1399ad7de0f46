//! Consumption mode, interval bounds and replay rate.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempo_log::Timestamp;

use crate::error::{ConsumerError, Result};

/// Slowest accepted replay rate.
pub const RATE_MIN: f64 = 0.001;

/// Fastest accepted replay rate.
pub const RATE_MAX: f64 = 1000.0;

/// How a consumer reads its topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsumingRegime {
    /// Only records appended after start, delivered as they arrive.
    RealTime,
    /// Records inside `[from, to]`, replayed with their original spacing.
    PastTimeInterval,
}

impl std::fmt::Display for ConsumingRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsumingRegime::RealTime => f.write_str("REAL_TIME"),
            ConsumingRegime::PastTimeInterval => f.write_str("PAST_TIME_INTERVAL"),
        }
    }
}

/// Validated consumption parameters.
///
/// Only built through [`ConsumingParamsBuilder`]; replaced rather than
/// mutated. The live rate of a running consumer is held separately so that
/// `change_rate` never touches a params value.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumingParams {
    regime: ConsumingRegime,
    from: Option<DateTime<Utc>>,
    from_ts: Timestamp,
    to: Option<DateTime<Utc>>,
    to_ts: Timestamp,
    rate: f64,
}

impl ConsumingParams {
    /// Real-time parameters at rate 1.0.
    #[must_use]
    pub fn real_time() -> Self {
        Self {
            regime: ConsumingRegime::RealTime,
            from: None,
            from_ts: 0,
            to: None,
            to_ts: Timestamp::MAX,
            rate: 1.0,
        }
    }

    /// Start building parameters for `regime`.
    #[must_use]
    pub fn builder(regime: ConsumingRegime) -> ConsumingParamsBuilder {
        ConsumingParamsBuilder::new(regime)
    }

    #[must_use]
    pub fn regime(&self) -> ConsumingRegime {
        self.regime
    }

    #[must_use]
    pub fn from(&self) -> Option<DateTime<Utc>> {
        self.from
    }

    /// Interval start in epoch ms; 0 for real time.
    #[must_use]
    pub fn from_ts(&self) -> Timestamp {
        self.from_ts
    }

    #[must_use]
    pub fn to(&self) -> Option<DateTime<Utc>> {
        self.to
    }

    /// Interval end in epoch ms; `Timestamp::MAX` when open-ended.
    #[must_use]
    pub fn to_ts(&self) -> Timestamp {
        self.to_ts
    }

    #[must_use]
    pub fn rate(&self) -> f64 {
        self.rate
    }

    #[must_use]
    pub fn is_past_time_interval(&self) -> bool {
        self.regime == ConsumingRegime::PastTimeInterval
    }
}

impl Default for ConsumingParams {
    fn default() -> Self {
        Self::real_time()
    }
}

impl std::fmt::Display for ConsumingParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.regime {
            ConsumingRegime::RealTime => write!(f, "{}", self.regime),
            ConsumingRegime::PastTimeInterval => {
                write!(f, "{} from {}", self.regime, format_bound(self.from))?;
                if let Some(to) = self.to {
                    write!(f, " to {}", format_bound(Some(to)))?;
                }
                write!(f, " at rate {}", self.rate)
            }
        }
    }
}

fn format_bound(bound: Option<DateTime<Utc>>) -> String {
    bound.map_or_else(|| "-".to_string(), |dt| dt.to_rfc3339())
}

/// Check that `rate` lies in `[RATE_MIN, RATE_MAX]`.
pub fn validate_rate(rate: f64) -> Result<()> {
    if (RATE_MIN..=RATE_MAX).contains(&rate) {
        Ok(())
    } else {
        Err(ConsumerError::InvalidParams(format!(
            "rate must be between {RATE_MIN} and {RATE_MAX}, got {rate}"
        )))
    }
}

/// Builder enforcing the interval and rate invariants of [`ConsumingParams`].
#[derive(Debug, Clone)]
pub struct ConsumingParamsBuilder {
    regime: ConsumingRegime,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    rate: f64,
}

impl ConsumingParamsBuilder {
    #[must_use]
    pub fn new(regime: ConsumingRegime) -> Self {
        Self {
            regime,
            from: None,
            to: None,
            rate: 1.0,
        }
    }

    #[must_use]
    pub fn from(mut self, from: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self
    }

    #[must_use]
    pub fn to(mut self, to: DateTime<Utc>) -> Self {
        self.to = Some(to);
        self
    }

    #[must_use]
    pub fn with_rate(mut self, rate: f64) -> Self {
        self.rate = rate;
        self
    }

    /// Validate against the current time and build.
    pub fn build(self) -> Result<ConsumingParams> {
        self.build_at(Utc::now())
    }

    /// Validate against `now` and build.
    pub fn build_at(self, now: DateTime<Utc>) -> Result<ConsumingParams> {
        validate_rate(self.rate)?;

        match self.regime {
            ConsumingRegime::RealTime => Ok(ConsumingParams {
                rate: self.rate,
                ..ConsumingParams::real_time()
            }),
            ConsumingRegime::PastTimeInterval => {
                let from = self.from.ok_or_else(|| {
                    ConsumerError::InvalidParams("from is required for past time interval".into())
                })?;
                if from >= now {
                    return Err(ConsumerError::InvalidParams(format!(
                        "from must be in the past: {from}"
                    )));
                }
                if let Some(to) = self.to {
                    if to >= now {
                        return Err(ConsumerError::InvalidParams(format!(
                            "to must be in the past: {to}"
                        )));
                    }
                    if from >= to {
                        return Err(ConsumerError::InvalidParams(format!(
                            "to must be after from: {from} >= {to}"
                        )));
                    }
                }

                Ok(ConsumingParams {
                    regime: self.regime,
                    from: Some(from),
                    from_ts: from.timestamp_millis(),
                    to: self.to,
                    to_ts: self.to.map_or(Timestamp::MAX, |to| to.timestamp_millis()),
                    rate: self.rate,
                })
            }
        }
    }
}

/// Live replay rate shared between a consumer's control surface and its
/// workers.
#[derive(Debug)]
pub(crate) struct RateCell(AtomicU64);

impl RateCell {
    pub(crate) fn new(rate: f64) -> Self {
        Self(AtomicU64::new(rate.to_bits()))
    }

    pub(crate) fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, rate: f64) {
        self.0.store(rate.to_bits(), Ordering::Release);
    }
}
