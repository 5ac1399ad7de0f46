//! Playback clock: a simulated "now" that ticks independently of delivery.
//!
//! The clock starts at the interval's `from`, and every `period` it reports
//! its current value and then moves forward by `period * rate`. It only runs
//! for past time interval consumers with a playback-time handler, holds still
//! while the consumer is paused and ends when the consumer stops.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, Weak};
use std::time::Duration;

use tempo_log::Timestamp;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::lifecycle::{Lifecycle, Signal};

/// How long the clock waits for a stopped tracker before aborting it.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(100);

/// Tick period for `rate`: faster replays tick more often.
#[must_use]
pub fn period_for_rate(rate: f64) -> Duration {
    if rate < 2.0 {
        Duration::from_millis(1000)
    } else if rate <= 4.0 {
        Duration::from_millis(500)
    } else {
        Duration::from_millis(250)
    }
}

#[derive(Debug)]
pub(crate) struct PlaybackClock {
    period_ms: AtomicU64,
    increment_ms: AtomicI64,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PlaybackClock {
    pub(crate) fn new(rate: f64) -> Self {
        let clock = Self {
            period_ms: AtomicU64::new(1000),
            increment_ms: AtomicI64::new(1000),
            task: Mutex::new(None),
        };
        clock.adjust(rate);
        clock
    }

    /// Recompute period and increment for `rate`.
    pub(crate) fn adjust(&self, rate: f64) {
        let period = period_for_rate(rate);
        let period_ms = period.as_millis() as u64;
        let increment_ms = (period_ms as f64 * rate) as i64;

        self.period_ms.store(period_ms, Ordering::Release);
        self.increment_ms.store(increment_ms, Ordering::Release);
        debug!(period_ms, increment_ms, "Playback clock adjusted");
    }

    pub(crate) fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms.load(Ordering::Acquire))
    }

    pub(crate) fn increment(&self) -> i64 {
        self.increment_ms.load(Ordering::Acquire)
    }

    /// Spawn the tracker unless one is already running.
    ///
    /// Resuming after a pause reuses the running tracker.
    pub(crate) fn start(&self, lifecycle: Weak<Lifecycle>, from_ts: Timestamp) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return;
        }
        *task = Some(tokio::spawn(track(lifecycle, from_ts)));
    }

    /// Detach the tracker, aborting it if it has not exited shortly after
    /// the stop signal.
    pub(crate) fn shutdown(&self) {
        let handle = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(mut handle) = handle {
            tokio::spawn(async move {
                if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
                    handle.abort();
                }
            });
        }
    }

    #[cfg(test)]
    pub(crate) fn is_tracking(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

async fn track(lifecycle: Weak<Lifecycle>, from_ts: Timestamp) {
    let mut playback_ts = from_ts;
    // Part of a period left over when a pause interrupted it.
    let mut remaining: Option<Duration> = None;

    loop {
        let Some(lifecycle) = lifecycle.upgrade() else {
            return;
        };
        let clock = lifecycle.playback();
        let period = clock.period();
        let wait = remaining.take().map_or(period, |left| left.min(period));
        let waiting_since = Instant::now();

        match lifecycle.wait_for_stop_or_pause(Some(wait)).await {
            Some(Signal::Stopped) => {
                debug!(consumer_id = %lifecycle.id(), "Consumer stopped, playback clock ends");
                return;
            }
            Some(Signal::Paused) => {
                remaining = Some(wait.saturating_sub(waiting_since.elapsed()));
                debug!(consumer_id = %lifecycle.id(), "Consumer paused, playback clock holds");
                if !lifecycle.wait_for_resume_or_stop().await {
                    debug!(consumer_id = %lifecycle.id(), "Consumer stopped while paused, playback clock ends");
                    return;
                }
            }
            None => {
                lifecycle.notify_playback_time(playback_ts);
                playback_ts += clock.increment();
            }
        }
    }
}
