//! Consumer of several topics, one sub-consumer per event type.
//!
//! Sub-consumers are created the first time a handler is registered for
//! their event type and live as long as the orchestrator. Lifecycle calls fan
//! out to them. Sub-consumers report phase changes over a channel to an
//! aggregator task, which stops the orchestrator once every sub-consumer has
//! stopped.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::{join_all, try_join_all};
use tempo_log::Broker;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::config::{ConsumerOptions, TopicMap};
use crate::consumer::Consumer;
use crate::error::{ConsumerError, Result};
use crate::event::{
    ErrorHandler, Event, EventType, Filter, HandlerResult, IdleHandler, PhaseChangedHandler,
    PlaybackTimeHandler,
};
use crate::lifecycle::{Lifecycle, Notification, lock, read, write};
use crate::params::{ConsumingParams, ConsumingRegime, validate_rate};
use crate::phase::Phase;
use crate::single::SingleTopicConsumer;

/// Phase change reported by a sub-consumer.
type PhaseReport = (String, Phase);

/// Consumer that merges one [`SingleTopicConsumer`] per event type into a
/// single lifecycle.
#[derive(Clone)]
pub struct MultiTopicConsumer {
    inner: Arc<Inner>,
}

struct Inner {
    lifecycle: Arc<Lifecycle>,
    broker: Arc<dyn Broker>,
    topics: TopicMap,
    options: RwLock<ConsumerOptions>,
    filters: RwLock<Vec<Filter>>,
    consumers: RwLock<HashMap<EventType, SingleTopicConsumer>>,
    phase_tx: mpsc::UnboundedSender<PhaseReport>,
    phase_rx: Mutex<Option<mpsc::UnboundedReceiver<PhaseReport>>>,
    /// Set once `stop()` is called; sub-consumers stopping after that is not completion.
    stop_requested: AtomicBool,
}

impl MultiTopicConsumer {
    pub fn new(topics: TopicMap, broker: Arc<dyn Broker>, options: ConsumerOptions) -> Self {
        let lifecycle = Lifecycle::new("multi");
        let (phase_tx, phase_rx) = mpsc::unbounded_channel();
        info!(consumer_id = %lifecycle.id(), topics = topics.len(), "Multi-topic consumer created");

        Self {
            inner: Arc::new(Inner {
                lifecycle,
                broker,
                topics,
                options: RwLock::new(options),
                filters: RwLock::new(Vec::new()),
                consumers: RwLock::new(HashMap::new()),
                phase_tx,
                phase_rx: Mutex::new(Some(phase_rx)),
                stop_requested: AtomicBool::new(false),
            }),
        }
    }

    /// Register the handler for `T`, creating its sub-consumer if needed.
    ///
    /// Fails when no topic is mapped to `T`.
    pub fn set_event_handler<T, F, Fut>(&self, handler: F) -> Result<()>
    where
        T: Event,
        F: Fn(Option<String>, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.inner
            .get_or_create(EventType::of::<T>())?
            .set_event_handler(handler)
    }

    /// Event types that have a sub-consumer.
    #[must_use]
    pub fn event_types(&self) -> Vec<EventType> {
        read(&self.inner.consumers).keys().copied().collect()
    }

    /// Sub-consumer for `event_type`, if one was created.
    #[must_use]
    pub fn consumer(&self, event_type: EventType) -> Option<SingleTopicConsumer> {
        read(&self.inner.consumers).get(&event_type).cloned()
    }

    fn consumers(&self) -> Vec<SingleTopicConsumer> {
        read(&self.inner.consumers).values().cloned().collect()
    }

    fn active_consumers(&self) -> Vec<SingleTopicConsumer> {
        self.consumers()
            .into_iter()
            .filter(|c| c.phase() != Phase::Stopped)
            .collect()
    }

    /// Apply `op` to every sub-consumer that has not stopped, wrapping the
    /// first failure with the failing consumer's id.
    fn fan_out(&self, op: impl Fn(&SingleTopicConsumer) -> Result<()>) -> Result<()> {
        for consumer in self.active_consumers() {
            op(&consumer).map_err(|e| ConsumerError::fan_out(consumer.id(), e))?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for MultiTopicConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiTopicConsumer")
            .field("id", &self.inner.lifecycle.id())
            .field("phase", &self.inner.lifecycle.phase())
            .field("event_types", &self.event_types())
            .finish()
    }
}

impl Inner {
    fn stop_reason(&self) -> &'static str {
        if self.stop_requested.load(Ordering::SeqCst) {
            "stop was called"
        } else {
            "consuming completed"
        }
    }

    fn get_or_create(self: &Arc<Self>, event_type: EventType) -> Result<SingleTopicConsumer> {
        let mut consumers = write(&self.consumers);
        if let Some(consumer) = consumers.get(&event_type) {
            return Ok(consumer.clone());
        }

        let topic = self.topics.resolve(event_type.name())?;
        let consumer = SingleTopicConsumer::new(
            event_type,
            topic,
            Arc::clone(&self.broker),
            read(&self.options).clone(),
        );
        consumer.set_consuming_params(self.lifecycle.params())?;
        for filter in read(&self.filters).iter() {
            consumer.add_filter(Arc::clone(filter));
        }

        let consumer_id = consumer.id().to_string();
        let phase_tx = self.phase_tx.clone();
        let reporter = consumer_id.clone();
        consumer.set_phase_changed_handler(Arc::new(move |phase: Phase| {
            // The aggregator is gone only once the orchestrator is dropped.
            let _ = phase_tx.send((reporter.clone(), phase));
        }));

        let lifecycle = Arc::downgrade(&self.lifecycle);
        let reporter = consumer_id.clone();
        consumer.set_error_handler(Arc::new(move |error: &ConsumerError| {
            if let Some(lifecycle) = lifecycle.upgrade() {
                lifecycle.report_error(&ConsumerError::Forwarded {
                    consumer_id: reporter.clone(),
                    message: error.to_string(),
                });
            }
        }));

        let lifecycle = Arc::downgrade(&self.lifecycle);
        consumer.set_idle_handler(Arc::new(move || {
            if let Some(lifecycle) = lifecycle.upgrade() {
                lifecycle.notify_idle();
            }
        }));

        debug!(
            consumer_id = %self.lifecycle.id(),
            sub_consumer_id = %consumer_id,
            %event_type,
            %topic,
            "Sub-consumer registered"
        );
        consumers.insert(event_type, consumer.clone());
        Ok(consumer)
    }
}

/// Stop the orchestrator once every sub-consumer has stopped.
async fn aggregate_phases(inner: Weak<Inner>, mut phase_rx: mpsc::UnboundedReceiver<PhaseReport>) {
    while let Some((consumer_id, phase)) = phase_rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        debug!(
            consumer_id = %inner.lifecycle.id(),
            sub_consumer_id = %consumer_id,
            %phase,
            "Sub-consumer phase changed"
        );
        if phase != Phase::Stopped {
            continue;
        }

        let all_stopped = read(&inner.consumers)
            .values()
            .all(|c| c.phase() == Phase::Stopped);
        if !all_stopped {
            continue;
        }

        match inner.lifecycle.set_phase(Phase::Stopped, Notification::Sync) {
            Ok(true) => info!(
                consumer_id = %inner.lifecycle.id(),
                reason = inner.stop_reason(),
                "Multi-topic consumer stopped"
            ),
            Ok(false) => {}
            Err(e) => inner.lifecycle.report_error(&e),
        }
        return;
    }
}

#[async_trait]
impl Consumer for MultiTopicConsumer {
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
        self.inner.lifecycle.set_params(params.clone())?;
        for consumer in self.consumers() {
            consumer
                .set_consuming_params(params.clone())
                .map_err(|e| ConsumerError::fan_out(consumer.id(), e))?;
        }
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let lifecycle = &self.inner.lifecycle;
        if lifecycle.phase() != Phase::NotStarted {
            return Err(ConsumerError::AlreadyStarted { operation: "start" });
        }

        let consumers = self.consumers();
        let started = try_join_all(consumers.iter().map(|consumer| async move {
            consumer
                .start()
                .await
                .map_err(|e| ConsumerError::fan_out(consumer.id(), e))
        }))
        .await;

        if let Err(e) = started {
            // Leave nothing running behind a failed start.
            join_all(consumers.iter().map(|c| c.stop_if_running())).await;
            return Err(e);
        }

        lifecycle.set_phase(Phase::Running, Notification::Sync)?;
        if consumers.is_empty() {
            info!(consumer_id = %lifecycle.id(), "No event handlers registered, nothing to consume");
            lifecycle.set_phase(Phase::Stopped, Notification::Sync)?;
            return Ok(());
        }
        if let Some(phase_rx) = lock(&self.inner.phase_rx).take() {
            tokio::spawn(aggregate_phases(Arc::downgrade(&self.inner), phase_rx));
        }

        info!(
            consumer_id = %lifecycle.id(),
            consumers = consumers.len(),
            params = %lifecycle.params(),
            "Multi-topic consumer started"
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let lifecycle = &self.inner.lifecycle;
        if lifecycle.phase() == Phase::Stopped {
            debug!(consumer_id = %lifecycle.id(), "Multi-topic consumer already stopped");
            return Ok(());
        }
        lifecycle.phase().check_transition(Phase::Stopped)?;
        self.inner.stop_requested.store(true, Ordering::SeqCst);

        let consumers = self.active_consumers();
        try_join_all(consumers.iter().map(|consumer| async move {
            consumer
                .stop()
                .await
                .map_err(|e| ConsumerError::fan_out(consumer.id(), e))
        }))
        .await?;

        if lifecycle.set_phase(Phase::Stopped, Notification::Sync)? {
            info!(
                consumer_id = %lifecycle.id(),
                reason = self.inner.stop_reason(),
                "Multi-topic consumer stopped"
            );
        }
        Ok(())
    }

    fn pause(&self) -> Result<()> {
        let lifecycle = &self.inner.lifecycle;
        if lifecycle.regime() == ConsumingRegime::RealTime {
            debug!(consumer_id = %lifecycle.id(), "Pause ignored in real time");
            return Ok(());
        }
        lifecycle.phase().check_transition(Phase::Paused)?;

        self.fan_out(|c| c.pause())?;
        lifecycle
            .set_phase(Phase::Paused, Notification::Sync)
            .map(|_| ())
    }

    fn resume(&self) -> Result<()> {
        let lifecycle = &self.inner.lifecycle;
        if lifecycle.regime() == ConsumingRegime::RealTime {
            debug!(consumer_id = %lifecycle.id(), "Resume ignored in real time");
            return Ok(());
        }
        lifecycle.phase().check_transition(Phase::Running)?;

        self.fan_out(|c| c.resume())?;
        lifecycle
            .set_phase(Phase::Running, Notification::Sync)
            .map(|_| ())
    }

    fn change_rate(&self, rate: f64) -> Result<()> {
        validate_rate(rate)?;
        let lifecycle = &self.inner.lifecycle;

        let was_running = lifecycle.regime() == ConsumingRegime::PastTimeInterval
            && lifecycle.phase() == Phase::Running;
        if was_running {
            lifecycle.set_phase(Phase::Paused, Notification::Sync)?;
        }
        lifecycle.set_rate(rate);
        let changed = self.fan_out(|c| c.change_rate(rate));
        if was_running {
            lifecycle.set_phase(Phase::Running, Notification::Sync)?;
        }
        changed?;

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
        for consumer in self.consumers() {
            consumer.set_idle_interval(interval);
        }
    }

    fn add_filter(&self, filter: Filter) {
        write(&self.inner.filters).push(Arc::clone(&filter));
        for consumer in self.consumers() {
            consumer.add_filter(Arc::clone(&filter));
        }
    }

    fn reset_filters(&self) {
        write(&self.inner.filters).clear();
        for consumer in self.consumers() {
            consumer.reset_filters();
        }
    }
}
