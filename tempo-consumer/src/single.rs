//! Consumer of a single topic.
//!
//! In real time the consumer seeks to the end of the partition and delivers
//! every record as it arrives. For a past time interval it seeks to the first
//! record at or after `from`, paces records with their original spacing
//! scaled by the rate, and completes on its own once it passes `to` or
//! reaches the last record that existed at start.

use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use tempo_log::{Broker, PartitionReader, Record, RecordBatch, SeekPosition};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::ConsumerOptions;
use crate::consumer::Consumer;
use crate::error::{ConsumerError, Result};
use crate::event::{
    ErrorHandler, Event, EventType, Filter, HandlerResult, IdleHandler, PhaseChangedHandler,
    PlaybackTimeHandler, RecordHandler, RecordMeta, panic_message, record_handler,
};
use crate::lifecycle::{Lifecycle, Notification, lock, read, write};
use crate::pacer::{Admission, Pacing, ReplayPacer};
use crate::params::{ConsumingParams, ConsumingRegime, validate_rate};
use crate::phase::Phase;

/// Delay of the STOPPED notification after the consumer completes on its own,
/// so the worker has finished before the handler reacts.
const COMPLETION_NOTIFY_DELAY: Duration = Duration::from_millis(100);

/// Back-off after a failed poll.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// What the worker does once started.
enum Plan {
    RealTime,
    Replay(ReplayPacer),
    /// Nothing at or after `from`.
    Empty,
}

/// Consumer bound to one topic and one event type.
#[derive(Clone)]
pub struct SingleTopicConsumer {
    inner: Arc<Inner>,
}

struct Inner {
    lifecycle: Arc<Lifecycle>,
    event_type: EventType,
    topic: String,
    broker: Arc<dyn Broker>,
    options: RwLock<ConsumerOptions>,
    handler: RwLock<Option<RecordHandler>>,
    filters: RwLock<Vec<Filter>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    started_at: Mutex<Option<Instant>>,
}

impl SingleTopicConsumer {
    /// Create a consumer of `topic` carrying `event_type` events.
    pub fn new(
        event_type: EventType,
        topic: impl Into<String>,
        broker: Arc<dyn Broker>,
        options: ConsumerOptions,
    ) -> Self {
        let topic = topic.into();
        let lifecycle = Lifecycle::new(event_type.name());
        info!(consumer_id = %lifecycle.id(), %topic, %event_type, "Consumer created");

        Self {
            inner: Arc::new(Inner {
                lifecycle,
                event_type,
                topic,
                broker,
                options: RwLock::new(options),
                handler: RwLock::new(None),
                filters: RwLock::new(Vec::new()),
                worker: Mutex::new(None),
                started_at: Mutex::new(None),
            }),
        }
    }

    /// Create a consumer of `topic` for `T` with default options.
    pub fn for_event<T: Event>(topic: impl Into<String>, broker: Arc<dyn Broker>) -> Self {
        Self::new(
            EventType::of::<T>(),
            topic,
            broker,
            ConsumerOptions::default(),
        )
    }

    #[must_use]
    pub fn event_type(&self) -> EventType {
        self.inner.event_type
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// Register the handler for decoded events.
    ///
    /// `T` must be the consumer's event type.
    pub fn set_event_handler<T, F, Fut>(&self, handler: F) -> Result<()>
    where
        T: Event,
        F: Fn(Option<String>, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let actual = EventType::of::<T>();
        if actual != self.inner.event_type {
            return Err(ConsumerError::EventTypeMismatch {
                expected: self.inner.event_type.name(),
                actual: actual.name(),
            });
        }
        *write(&self.inner.handler) = Some(record_handler(handler));
        Ok(())
    }

    fn require_past_time_interval(&self, operation: &'static str) -> Result<()> {
        match self.inner.lifecycle.regime() {
            ConsumingRegime::PastTimeInterval => Ok(()),
            ConsumingRegime::RealTime => Err(ConsumerError::RegimeMismatch { operation }),
        }
    }
}

impl std::fmt::Debug for SingleTopicConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleTopicConsumer")
            .field("id", &self.inner.lifecycle.id())
            .field("topic", &self.inner.topic)
            .field("event_type", &self.inner.event_type)
            .field("phase", &self.inner.lifecycle.phase())
            .finish()
    }
}

#[async_trait]
impl Consumer for SingleTopicConsumer {
    fn id(&self) -> &str {
        self.inner.lifecycle.id()
    }

    fn phase(&self) -> Phase {
        self.inner.lifecycle.phase()
    }

    fn subscribe(&self) -> watch::Receiver<Phase> {
        self.inner.lifecycle.subscribe()
    }

    fn consuming_params(&self) -> ConsumingParams {
        self.inner.lifecycle.params()
    }

    fn set_consuming_params(&self, params: ConsumingParams) -> Result<()> {
        self.inner.lifecycle.set_params(params)
    }

    async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let lifecycle = &inner.lifecycle;
        if lifecycle.phase() != Phase::NotStarted {
            return Err(ConsumerError::AlreadyStarted { operation: "start" });
        }

        let params = lifecycle.params();
        let mut reader = inner.broker.reader(&inner.topic).await?;

        let plan = match params.regime() {
            ConsumingRegime::RealTime => {
                reader.seek(SeekPosition::End).await?;
                Plan::RealTime
            }
            ConsumingRegime::PastTimeInterval => {
                let end_offset = inner.broker.end_offset(&inner.topic).await?;
                let from_offset = inner
                    .broker
                    .offset_for_timestamp(&inner.topic, params.from_ts())
                    .await?;

                match from_offset {
                    Some(offset) if end_offset > 0 => {
                        reader.seek(SeekPosition::Offset(offset)).await?;
                        debug!(
                            consumer_id = %lifecycle.id(),
                            topic = %inner.topic,
                            from_offset = offset,
                            last_offset_at_start = end_offset - 1,
                            "Seeked to interval start"
                        );
                        Plan::Replay(ReplayPacer::new(
                            params.from_ts(),
                            params.to_ts(),
                            end_offset - 1,
                        ))
                    }
                    _ => Plan::Empty,
                }
            }
        };

        *lock(&inner.started_at) = Some(Instant::now());
        lifecycle.set_phase(Phase::Running, Notification::Sync)?;
        info!(
            consumer_id = %lifecycle.id(),
            topic = %inner.topic,
            params = %params,
            "Consumer started"
        );

        let worker = tokio::spawn(Arc::clone(inner).run(reader, plan));
        *lock(&inner.worker) = Some(worker);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let lifecycle = &self.inner.lifecycle;
        if lifecycle.phase() == Phase::Stopped {
            debug!(consumer_id = %lifecycle.id(), "Consumer already stopped");
            return Ok(());
        }

        if lifecycle.set_phase(Phase::Stopped, Notification::Sync)? {
            self.inner.join_worker().await;
            self.inner.log_stopped("stop was called");
        }
        Ok(())
    }

    fn pause(&self) -> Result<()> {
        self.require_past_time_interval("pause")?;
        debug!(consumer_id = %self.id(), "Pausing");
        self.inner
            .lifecycle
            .set_phase(Phase::Paused, Notification::Sync)
            .map(|_| ())
    }

    fn resume(&self) -> Result<()> {
        self.require_past_time_interval("resume")?;
        debug!(consumer_id = %self.id(), "Resuming");
        self.inner
            .lifecycle
            .set_phase(Phase::Running, Notification::Sync)
            .map(|_| ())
    }

    fn change_rate(&self, rate: f64) -> Result<()> {
        validate_rate(rate)?;
        let lifecycle = &self.inner.lifecycle;

        // Pause around the change so no wait is computed against a rate that
        // is changing underneath it.
        let was_running = lifecycle.regime() == ConsumingRegime::PastTimeInterval
            && lifecycle.phase() == Phase::Running;
        if was_running {
            lifecycle.set_phase(Phase::Paused, Notification::Sync)?;
        }
        lifecycle.set_rate(rate);
        if was_running {
            lifecycle.set_phase(Phase::Running, Notification::Sync)?;
        }

        info!(consumer_id = %lifecycle.id(), rate, "Rate changed");
        Ok(())
    }

    fn set_phase_changed_handler(&self, handler: PhaseChangedHandler) {
        self.inner.lifecycle.set_phase_changed_handler(handler);
    }

    fn set_error_handler(&self, handler: ErrorHandler) {
        self.inner.lifecycle.set_error_handler(handler);
    }

    fn set_playback_time_handler(&self, handler: PlaybackTimeHandler) {
        self.inner.lifecycle.set_playback_time_handler(handler);
    }

    fn set_idle_handler(&self, handler: IdleHandler) {
        self.inner.lifecycle.set_idle_handler(handler);
    }

    fn set_idle_interval(&self, interval: Duration) {
        write(&self.inner.options).idle_interval = Some(interval);
    }

    fn add_filter(&self, filter: Filter) {
        write(&self.inner.filters).push(filter);
    }

    fn reset_filters(&self) {
        write(&self.inner.filters).clear();
    }
}

/// Fires the idle handler after a quiet period.
struct IdleTimer {
    last_activity: Instant,
}

impl IdleTimer {
    fn new() -> Self {
        Self {
            last_activity: Instant::now(),
        }
    }

    fn record_activity(&mut self) {
        self.last_activity = Instant::now();
    }

    fn check(&mut self, interval: Option<Duration>, lifecycle: &Lifecycle) {
        let Some(interval) = interval else {
            return;
        };
        if lifecycle.phase() == Phase::Running && self.last_activity.elapsed() >= interval {
            lifecycle.notify_idle();
            self.last_activity = Instant::now();
        }
    }
}

impl Inner {
    fn options(&self) -> ConsumerOptions {
        read(&self.options).clone()
    }

    async fn run(self: Arc<Self>, mut reader: Box<dyn PartitionReader>, plan: Plan) {
        match plan {
            Plan::Empty => {
                debug!(
                    consumer_id = %self.lifecycle.id(),
                    topic = %self.topic,
                    "No records at or after interval start"
                );
                self.complete();
            }
            Plan::RealTime => self.consume_real_time(reader.as_mut()).await,
            Plan::Replay(pacer) => self.consume_replay(reader.as_mut(), pacer).await,
        }
        debug!(consumer_id = %self.lifecycle.id(), "Worker finished");
    }

    async fn consume_real_time(&self, reader: &mut dyn PartitionReader) {
        let mut idle = IdleTimer::new();
        while let Some(batch) = self.next_batch(reader, &mut idle).await {
            for record in batch {
                if self.lifecycle.is_stopped() {
                    return;
                }
                if self.passes_filters(&record) {
                    self.deliver(record).await;
                }
            }
        }
    }

    async fn consume_replay(&self, reader: &mut dyn PartitionReader, mut pacer: ReplayPacer) {
        let mut idle = IdleTimer::new();
        while let Some(batch) = self.next_batch(reader, &mut idle).await {
            for record in batch {
                if self.lifecycle.is_stopped() {
                    return;
                }
                let offset = record.offset;

                match pacer.admit(record.timestamp) {
                    Admission::BeforeInterval => {
                        trace!(consumer_id = %self.lifecycle.id(), record = %record, "Record before interval skipped");
                    }
                    Admission::AfterInterval => {
                        debug!(consumer_id = %self.lifecycle.id(), record = %record, "Record after interval, replay exhausted");
                        self.complete();
                        return;
                    }
                    Admission::Within if self.passes_filters(&record) => {
                        if pacer.wait_for_record_time(record.timestamp, &self.lifecycle).await
                            == Pacing::Aborted
                        {
                            return;
                        }
                        if self.lifecycle.is_paused()
                            && !self.lifecycle.wait_for_resume_or_stop().await
                        {
                            return;
                        }
                        pacer.mark_delivered(record.timestamp, &self.lifecycle);
                        self.deliver(record).await;
                    }
                    Admission::Within => {
                        trace!(consumer_id = %self.lifecycle.id(), offset, "Record filtered out");
                    }
                }

                if pacer.is_last(offset) {
                    debug!(consumer_id = %self.lifecycle.id(), offset, "Reached last offset at start");
                    self.complete();
                    return;
                }
            }
        }
    }

    /// Next batch, or `None` once stopped.
    async fn next_batch(
        &self,
        reader: &mut dyn PartitionReader,
        idle: &mut IdleTimer,
    ) -> Option<RecordBatch> {
        let options = self.options();
        let polled = tokio::select! {
            biased;
            _ = self.lifecycle.wait_for_stop(None) => return None,
            polled = reader.poll(options.batch_size, options.poll_timeout) => polled,
        };

        match polled {
            Ok(batch) => {
                if batch.is_empty() {
                    trace!(consumer_id = %self.lifecycle.id(), topic = %self.topic, "Empty poll");
                    idle.check(options.idle_interval, &self.lifecycle);
                } else {
                    idle.record_activity();
                }
                Some(batch)
            }
            Err(e) => {
                self.lifecycle.report_error(&ConsumerError::Broker(e));
                if self.lifecycle.wait_for_stop(Some(ERROR_BACKOFF)).await {
                    None
                } else {
                    Some(RecordBatch::empty())
                }
            }
        }
    }

    fn passes_filters(&self, record: &Record) -> bool {
        let filters = read(&self.filters).clone();
        if filters.is_empty() {
            return true;
        }

        let meta = RecordMeta::from(record);
        match catch_unwind(AssertUnwindSafe(|| filters.iter().all(|f| f(&meta)))) {
            Ok(passed) => passed,
            Err(payload) => {
                self.lifecycle.report_error(&ConsumerError::RecordHandlerPanicked {
                    handler: "filter",
                    record: record.to_string(),
                    message: panic_message(payload.as_ref()),
                });
                false
            }
        }
    }

    async fn deliver(&self, record: Record) {
        if record.value.is_none() {
            warn!(consumer_id = %self.lifecycle.id(), record = %record, "Record has no value, skipped");
            return;
        }
        let Some(handler) = read(&self.handler).clone() else {
            trace!(consumer_id = %self.lifecycle.id(), "No event handler registered");
            return;
        };

        let identity = record.to_string();
        debug!(consumer_id = %self.lifecycle.id(), record = %identity, "Delivering record");
        match AssertUnwindSafe(handler(record)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.lifecycle.report_error(&e),
            Err(payload) => self.lifecycle.report_error(&ConsumerError::RecordHandlerPanicked {
                handler: "Event handler",
                record: identity,
                message: panic_message(payload.as_ref()),
            }),
        }
    }

    /// Stop on the worker's own initiative.
    fn complete(&self) {
        match self
            .lifecycle
            .set_phase(Phase::Stopped, Notification::Delayed(COMPLETION_NOTIFY_DELAY))
        {
            Ok(true) => self.log_stopped("consuming completed"),
            Ok(false) => {}
            Err(e) => self.lifecycle.report_error(&e),
        }
    }

    /// Wait for the worker to exit, aborting it after the shutdown timeout.
    async fn join_worker(&self) {
        let Some(mut handle) = lock(&self.worker).take() else {
            return;
        };
        // Stopped from inside the worker, e.g. by an event handler.
        if tokio::task::try_id() == Some(handle.id()) {
            return;
        }

        let timeout = self.options().shutdown_timeout;
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(consumer_id = %self.lifecycle.id(), error = %e, "Worker ended abnormally"),
            Err(_) => {
                warn!(
                    consumer_id = %self.lifecycle.id(),
                    ?timeout,
                    "Worker did not stop in time, aborting"
                );
                handle.abort();
            }
        }
    }

    fn log_stopped(&self, reason: &str) {
        let working_time = lock(&self.started_at).map(|at| at.elapsed());
        info!(
            consumer_id = %self.lifecycle.id(),
            topic = %self.topic,
            reason,
            ?working_time,
            "Consumer stopped"
        );
    }
}
