//! Replay pacing for one partition.
//!
//! Records are released with their original spacing divided by the rate:
//!
//! ```text
//! delta = (record_ts - (last_record_ts + ready_delta)) / rate - elapsed
//! ```
//!
//! `elapsed` is the wall-clock time since the previous delivery (handler time
//! included) minus the time the consumer spent paused, and `ready_delta` is
//! the simulated time already paid off by earlier partial waits of the same
//! record. Paused time never counts, however many pauses fall in between.

use std::time::Duration;

use tempo_log::{Offset, Timestamp};
use tokio::time::Instant;
use tracing::debug;

use crate::lifecycle::{Lifecycle, Signal};

/// Where a record's timestamp falls relative to the replay interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    /// Before `from`; the timestamp index was imprecise.
    BeforeInterval,
    Within,
    /// After `to`; the interval is exhausted.
    AfterInterval,
}

/// Outcome of waiting for a record's playback time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pacing {
    Deliver,
    Aborted,
}

#[derive(Debug)]
pub(crate) struct ReplayPacer {
    from_ts: Timestamp,
    to_ts: Timestamp,
    /// Offset of the last record that existed when the consumer started.
    last_offset_at_start: Offset,
    last_record_ts: Timestamp,
    /// Start of the current segment since the last delivery.
    record_playback_started_at: Instant,
    /// Lifecycle paused time when the segment began.
    paused_at_segment_start: Duration,
}

impl ReplayPacer {
    pub(crate) fn new(from_ts: Timestamp, to_ts: Timestamp, last_offset_at_start: Offset) -> Self {
        Self {
            from_ts,
            to_ts,
            last_offset_at_start,
            last_record_ts: from_ts,
            record_playback_started_at: Instant::now(),
            paused_at_segment_start: Duration::ZERO,
        }
    }

    pub(crate) fn admit(&self, record_ts: Timestamp) -> Admission {
        if record_ts < self.from_ts {
            Admission::BeforeInterval
        } else if record_ts > self.to_ts {
            Admission::AfterInterval
        } else {
            Admission::Within
        }
    }

    /// Whether `offset` reaches the end of the partition as seen at start.
    pub(crate) fn is_last(&self, offset: Offset) -> bool {
        offset >= self.last_offset_at_start
    }

    /// Record that a record stamped `record_ts` was just delivered.
    pub(crate) fn mark_delivered(&mut self, record_ts: Timestamp, lifecycle: &Lifecycle) {
        self.last_record_ts = record_ts;
        self.restart_segment(lifecycle, Instant::now());
    }

    /// Wait until the record stamped `record_ts` is due.
    ///
    /// Returns [`Pacing::Aborted`] as soon as the consumer stops, including
    /// while paused.
    pub(crate) async fn wait_for_record_time(
        &mut self,
        record_ts: Timestamp,
        lifecycle: &Lifecycle,
    ) -> Pacing {
        let mut ready_delta = 0.0_f64;

        loop {
            if lifecycle.is_stopped() {
                return Pacing::Aborted;
            }

            if lifecycle.is_paused() {
                let now = Instant::now();
                ready_delta += self.running_since_segment(lifecycle, now) * lifecycle.rate();
                self.restart_segment(lifecycle, now);
                if !lifecycle.wait_for_resume_or_stop().await {
                    return Pacing::Aborted;
                }
                continue;
            }

            let now = Instant::now();
            let rate = lifecycle.rate();
            let elapsed = self.running_since_segment(lifecycle, now);

            let mut delta = ((record_ts - self.last_record_ts) as f64 - ready_delta) / rate;
            delta -= elapsed;
            ready_delta += elapsed * rate;
            self.restart_segment(lifecycle, now);

            debug!(
                consumer_id = %lifecycle.id(),
                record_ts,
                last_record_ts = self.last_record_ts,
                elapsed_ms = elapsed,
                ready_delta,
                delta_ms = delta,
                "Pacing record"
            );

            if delta <= 0.0 {
                return Pacing::Deliver;
            }

            let sleep = Duration::from_secs_f64(delta / 1000.0);
            tokio::select! {
                signal = lifecycle.wait_for_stop_or_pause(Some(sleep)) => match signal {
                    None => return Pacing::Deliver,
                    Some(Signal::Stopped) => return Pacing::Aborted,
                    Some(Signal::Paused) => {}
                },
                () = lifecycle.rate_changed() => {}
            }

            // Credit the time slept at the rate it was slept under.
            let now = Instant::now();
            ready_delta += self.running_since_segment(lifecycle, now) * rate;
            self.restart_segment(lifecycle, now);
        }
    }

    /// Running (unpaused) milliseconds since the current segment began.
    fn running_since_segment(&self, lifecycle: &Lifecycle, now: Instant) -> f64 {
        let wall = now.saturating_duration_since(self.record_playback_started_at);
        let paused = lifecycle
            .paused_time(now)
            .saturating_sub(self.paused_at_segment_start);
        millis(wall.saturating_sub(paused))
    }

    fn restart_segment(&mut self, lifecycle: &Lifecycle, now: Instant) {
        self.record_playback_started_at = now;
        self.paused_at_segment_start = lifecycle.paused_time(now);
    }
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}
