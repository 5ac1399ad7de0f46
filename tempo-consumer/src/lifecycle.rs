//! Phase bookkeeping shared by single-topic consumers and the orchestrator.
//!
//! A [`Lifecycle`] owns the phase, the stop/pause/resume signals that workers
//! block on, the handler slots, the consuming params with the live rate, and
//! the playback clock. Phase changes are serialized by one lock that covers
//! only the phase and its signals; handlers always run after it is released.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
};
use std::time::Duration;

use tempo_log::Timestamp;
use tokio::sync::{Notify, watch};
use tokio::time::Instant;
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::{ConsumerError, Result};
use crate::event::{
    ErrorHandler, IdleHandler, PhaseChangedHandler, PlaybackTimeHandler, panic_message,
};
use crate::params::{ConsumingParams, ConsumingRegime, RateCell};
use crate::phase::Phase;
use crate::playback::PlaybackClock;
use crate::wait_handle::WaitHandle;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// How the phase-changed handler learns about a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Notification {
    /// On the caller, before `set_phase` returns.
    Sync,
    /// On a spawned task after the delay.
    Delayed(Duration),
}

/// Which signal ended a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Signal {
    Stopped,
    Paused,
}

/// Total time spent paused, including a pause still in progress.
#[derive(Debug, Clone, Copy, Default)]
struct PauseClock {
    /// Sum of every finished pause.
    finished: Duration,
    paused_at: Option<Instant>,
}

impl PauseClock {
    fn total_at(&self, now: Instant) -> Duration {
        let current = self
            .paused_at
            .map_or(Duration::ZERO, |paused_at| now.saturating_duration_since(paused_at));
        self.finished + current
    }
}

#[derive(Default)]
struct Handlers {
    phase_changed: Option<PhaseChangedHandler>,
    error: Option<ErrorHandler>,
    playback_time: Option<PlaybackTimeHandler>,
    idle: Option<IdleHandler>,
}

pub(crate) struct Lifecycle {
    id: String,
    me: Weak<Lifecycle>,
    phase: Mutex<Phase>,
    phase_tx: watch::Sender<Phase>,
    pause_clock: Mutex<PauseClock>,
    stopped: WaitHandle,
    paused: WaitHandle,
    resumed: WaitHandle,
    handlers: RwLock<Handlers>,
    params: RwLock<ConsumingParams>,
    rate: RateCell,
    rate_changed: Notify,
    playback: PlaybackClock,
}

impl Lifecycle {
    /// Create a lifecycle whose id is `"{prefix}-{uuid}"`.
    pub(crate) fn new(prefix: &str) -> Arc<Self> {
        let params = ConsumingParams::default();
        Arc::new_cyclic(|me| Self {
            id: format!("{prefix}-{}", Uuid::new_v4()),
            me: me.clone(),
            phase: Mutex::new(Phase::NotStarted),
            phase_tx: watch::channel(Phase::NotStarted).0,
            pause_clock: Mutex::default(),
            stopped: WaitHandle::new(),
            paused: WaitHandle::new(),
            resumed: WaitHandle::new(),
            handlers: RwLock::default(),
            rate: RateCell::new(params.rate()),
            rate_changed: Notify::new(),
            playback: PlaybackClock::new(params.rate()),
            params: RwLock::new(params),
        })
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn phase(&self) -> Phase {
        *lock(&self.phase)
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase_tx.subscribe()
    }

    pub(crate) fn params(&self) -> ConsumingParams {
        read(&self.params).clone()
    }

    pub(crate) fn regime(&self) -> ConsumingRegime {
        read(&self.params).regime()
    }

    /// Replace the params; only allowed before start.
    pub(crate) fn set_params(&self, params: ConsumingParams) -> Result<()> {
        if self.phase() != Phase::NotStarted {
            return Err(ConsumerError::AlreadyStarted {
                operation: "set_consuming_params",
            });
        }
        self.rate.set(params.rate());
        self.playback.adjust(params.rate());
        debug!(consumer_id = %self.id, params = %params, "Consuming params set");
        *write(&self.params) = params;
        Ok(())
    }

    pub(crate) fn rate(&self) -> f64 {
        self.rate.get()
    }

    /// Change the live rate and wake pacers waiting under the old one.
    pub(crate) fn set_rate(&self, rate: f64) {
        self.rate.set(rate);
        self.playback.adjust(rate);
        self.rate_changed.notify_waiters();
    }

    /// Resolves at the next [`Lifecycle::set_rate`].
    pub(crate) async fn rate_changed(&self) {
        self.rate_changed.notified().await;
    }

    pub(crate) fn playback(&self) -> &PlaybackClock {
        &self.playback
    }

    /// Time spent paused since creation, as of `now`.
    pub(crate) fn paused_time(&self, now: Instant) -> Duration {
        lock(&self.pause_clock).total_at(now)
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused.is_set()
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.is_set()
    }

    /// Move to `next`.
    ///
    /// Returns `Ok(false)` when already in `next`. An illegal transition
    /// leaves the phase untouched.
    pub(crate) fn set_phase(&self, next: Phase, notification: Notification) -> Result<bool> {
        let previous = {
            let mut phase = lock(&self.phase);
            let previous = *phase;
            if previous == next {
                debug!(consumer_id = %self.id, phase = %next, "Phase already set");
                return Ok(false);
            }
            *phase = previous.check_transition(next)?;

            match next {
                Phase::Running => {
                    self.stopped.reset();
                    if previous == Phase::Paused {
                        self.paused.reset();
                        let mut clock = lock(&self.pause_clock);
                        if let Some(paused_at) = clock.paused_at.take() {
                            clock.finished += paused_at.elapsed();
                        }
                    }
                    self.resumed.set();
                }
                Phase::Paused => {
                    self.resumed.reset();
                    lock(&self.pause_clock).paused_at = Some(Instant::now());
                    self.paused.set();
                }
                Phase::Stopped => self.stopped.set(),
                Phase::NotStarted => {}
            }

            self.phase_tx.send_replace(next);
            previous
        };

        debug!(consumer_id = %self.id, from = %previous, to = %next, "Phase changed");

        match next {
            Phase::Running => self.start_playback(),
            Phase::Stopped => self.playback.shutdown(),
            _ => {}
        }

        match notification {
            Notification::Sync => self.notify_phase_changed(next),
            Notification::Delayed(delay) => {
                let me = self.me.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(lifecycle) = me.upgrade() {
                        lifecycle.notify_phase_changed(next);
                    }
                });
            }
        }

        Ok(true)
    }

    fn start_playback(&self) {
        if self.regime() != ConsumingRegime::PastTimeInterval
            || read(&self.handlers).playback_time.is_none()
        {
            return;
        }
        self.playback
            .start(self.me.clone(), read(&self.params).from_ts());
    }

    /// Wait for stop or pause; `None` on timeout. Stop wins a tie.
    pub(crate) async fn wait_for_stop_or_pause(&self, timeout: Option<Duration>) -> Option<Signal> {
        match WaitHandle::wait_any(&[&self.stopped, &self.paused], timeout).await {
            Some(0) => Some(Signal::Stopped),
            Some(_) => Some(Signal::Paused),
            None => None,
        }
    }

    /// Wait until resumed (`true`) or stopped (`false`).
    pub(crate) async fn wait_for_resume_or_stop(&self) -> bool {
        matches!(
            WaitHandle::wait_any(&[&self.stopped, &self.resumed], None).await,
            Some(1)
        )
    }

    /// Wait for the stop signal.
    pub(crate) async fn wait_for_stop(&self, timeout: Option<Duration>) -> bool {
        self.stopped.wait(timeout).await
    }

    pub(crate) fn set_phase_changed_handler(&self, handler: PhaseChangedHandler) {
        write(&self.handlers).phase_changed = Some(handler);
    }

    pub(crate) fn set_error_handler(&self, handler: ErrorHandler) {
        write(&self.handlers).error = Some(handler);
    }

    pub(crate) fn set_playback_time_handler(&self, handler: PlaybackTimeHandler) {
        write(&self.handlers).playback_time = Some(handler);
    }

    pub(crate) fn set_idle_handler(&self, handler: IdleHandler) {
        write(&self.handlers).idle = Some(handler);
    }

    pub(crate) fn notify_phase_changed(&self, phase: Phase) {
        let handler = read(&self.handlers).phase_changed.clone();
        if let Some(handler) = handler {
            self.run_handler("phase changed handler", || handler(phase));
        }
    }

    pub(crate) fn notify_playback_time(&self, timestamp: Timestamp) {
        let handler = read(&self.handlers).playback_time.clone();
        if let Some(handler) = handler {
            self.run_handler("playback time handler", || handler(timestamp));
        }
    }

    pub(crate) fn notify_idle(&self) {
        let handler = read(&self.handlers).idle.clone();
        if let Some(handler) = handler {
            debug!(consumer_id = %self.id, "Consumer is idle");
            self.run_handler("idle handler", || handler());
        }
    }

    /// Log `error` and pass it to the error handler.
    pub(crate) fn report_error(&self, error: &ConsumerError) {
        error!(consumer_id = %self.id, error = %error, "Consumer error");

        let Some(handler) = read(&self.handlers).error.clone() else {
            return;
        };
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler(error))) {
            error!(
                consumer_id = %self.id,
                panic = %panic_message(payload.as_ref()),
                "Error handler panicked"
            );
        }
    }

    /// Run a user callback, turning a panic into a reported error.
    fn run_handler(&self, name: &'static str, f: impl FnOnce()) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
            self.report_error(&ConsumerError::HandlerPanicked {
                handler: name,
                message: panic_message(payload.as_ref()),
            });
        }
    }
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("id", &self.id)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}
