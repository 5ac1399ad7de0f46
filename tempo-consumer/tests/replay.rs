//! Single-topic consumer integration tests
//!
//! Runs consumers against the in-memory broker on a paused tokio clock, so
//! pacing assertions are exact to the millisecond.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{
    Deliveries, PhaseLog, Position, append_positions, assert_close, base_ts, replay_between,
    replay_from,
};
use tempo_consumer::{
    BoxError, Consumer, ConsumerError, ConsumerOptions, ConsumingParams, Phase, RecordMeta,
    SingleTopicConsumer,
};
use tempo_log::MemoryBroker;

const TOPIC: &str = "positions";

fn consumer(broker: &MemoryBroker) -> SingleTopicConsumer {
    SingleTopicConsumer::for_event::<Position>(TOPIC, Arc::new(broker.clone()))
}

fn record_into(consumer: &SingleTopicConsumer, deliveries: &Deliveries) {
    let deliveries = deliveries.clone();
    consumer
        .set_event_handler(move |_key, position: Position| {
            let deliveries = deliveries.clone();
            async move {
                deliveries.push(position.seq);
                Ok::<(), BoxError>(())
            }
        })
        .unwrap();
}

/// Error kinds seen by the error handler.
fn collect_errors(consumer: &impl Consumer) -> Arc<Mutex<Vec<&'static str>>> {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    consumer.set_error_handler(Arc::new(move |error: &ConsumerError| {
        let kind = match error {
            ConsumerError::Broker(_) => "broker",
            ConsumerError::Decode { .. } => "decode",
            ConsumerError::Handler { .. } => "handler",
            ConsumerError::HandlerPanicked { .. } | ConsumerError::RecordHandlerPanicked { .. } => {
                "panic"
            }
            _ => "other",
        };
        sink.lock().unwrap().push(kind);
    }));
    errors
}

fn keyed_a(meta: &RecordMeta<'_>) -> bool {
    meta.key == Some("a")
}

fn reject_all(_: &RecordMeta<'_>) -> bool {
    false
}

async fn wait_for_stopped(consumer: &impl Consumer) {
    let mut phases = consumer.subscribe();
    tokio::time::timeout(
        Duration::from_secs(60),
        phases.wait_for(|phase| *phase == Phase::Stopped),
    )
    .await
    .expect("consumer did not stop")
    .expect("phase channel closed");
}

#[tokio::test(start_paused = true)]
async fn replay_scales_record_spacing_by_rate() {
    let broker = MemoryBroker::new();
    let base = base_ts();
    append_positions(&broker, TOPIC, &[base, base + 1000, base + 2000]).await;

    let consumer = consumer(&broker);
    let deliveries = Deliveries::default();
    record_into(&consumer, &deliveries);
    consumer.set_consuming_params(replay_from(base, 2.0)).unwrap();

    consumer.start().await.unwrap();
    wait_for_stopped(&consumer).await;

    assert_eq!(deliveries.seqs(), vec![0, 1, 2]);
    let gaps = deliveries.gaps_ms();
    assert_close(gaps[0], 500);
    assert_close(gaps[1], 500);
}

#[tokio::test(start_paused = true)]
async fn first_record_waits_for_its_offset_from_interval_start() {
    let broker = MemoryBroker::new();
    let base = base_ts();
    append_positions(&broker, TOPIC, &[base + 600]).await;

    let consumer = consumer(&broker);
    let deliveries = Deliveries::default();
    record_into(&consumer, &deliveries);
    consumer.set_consuming_params(replay_from(base, 1.0)).unwrap();

    let started = tokio::time::Instant::now();
    consumer.start().await.unwrap();
    wait_for_stopped(&consumer).await;

    assert_eq!(deliveries.seqs(), vec![0]);
    assert_close(started.elapsed().as_millis(), 600);
}

#[tokio::test(start_paused = true)]
async fn pause_does_not_consume_replay_time() {
    let broker = MemoryBroker::new();
    let base = base_ts();
    append_positions(&broker, TOPIC, &[base, base + 1000]).await;

    let consumer = consumer(&broker);
    let deliveries = Deliveries::default();
    record_into(&consumer, &deliveries);
    consumer.set_consuming_params(replay_from(base, 1.0)).unwrap();

    consumer.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    consumer.pause().unwrap();
    assert_eq!(consumer.phase(), Phase::Paused);

    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(deliveries.seqs(), vec![0]);
    consumer.resume().unwrap();

    wait_for_stopped(&consumer).await;
    assert_eq!(deliveries.seqs(), vec![0, 1]);
    // 300ms before the pause, 1000ms paused, the remaining 700ms after.
    assert_close(deliveries.gaps_ms()[0], 2000);
}

#[tokio::test(start_paused = true)]
async fn pauses_while_handler_runs_do_not_count() {
    let broker = MemoryBroker::new();
    let base = base_ts();
    append_positions(&broker, TOPIC, &[base, base + 2000]).await;

    let consumer = consumer(&broker);
    let deliveries = Deliveries::default();
    let seen = deliveries.clone();
    consumer
        .set_event_handler(move |_key, position: Position| {
            let seen = seen.clone();
            async move {
                seen.push(position.seq);
                if position.seq == 0 {
                    tokio::time::sleep(Duration::from_millis(1000)).await;
                }
                Ok::<(), BoxError>(())
            }
        })
        .unwrap();
    consumer.set_consuming_params(replay_from(base, 1.0)).unwrap();

    consumer.start().await.unwrap();
    // Two pause/resume cycles while the first handler is still busy.
    for _ in 0..2 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        consumer.pause().unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        consumer.resume().unwrap();
    }

    wait_for_stopped(&consumer).await;
    assert_eq!(deliveries.seqs(), vec![0, 1]);
    // 2000ms of replay time plus 600ms paused.
    assert_close(deliveries.gaps_ms()[0], 2600);
}

#[tokio::test(start_paused = true)]
async fn only_record_after_interval_end_completes_without_delivery() {
    let broker = MemoryBroker::new();
    let base = base_ts();
    let to = base + 1000;
    append_positions(&broker, TOPIC, &[to + 1]).await;

    let consumer = consumer(&broker);
    let deliveries = Deliveries::default();
    record_into(&consumer, &deliveries);
    let phases = PhaseLog::default();
    consumer.set_phase_changed_handler(phases.handler());
    consumer
        .set_consuming_params(replay_between(base, to, 1.0))
        .unwrap();

    let started = tokio::time::Instant::now();
    consumer.start().await.unwrap();
    wait_for_stopped(&consumer).await;

    assert!(deliveries.seqs().is_empty());
    // Discarded without pacing.
    assert_close(started.elapsed().as_millis(), 0);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(phases.phases(), vec![Phase::Running, Phase::Stopped]);
}

#[tokio::test(start_paused = true)]
async fn record_past_interval_end_completes_replay() {
    let broker = MemoryBroker::new();
    let base = base_ts();
    append_positions(
        &broker,
        TOPIC,
        &[base, base + 1000, base + 1001, base + 5000],
    )
    .await;

    let consumer = consumer(&broker);
    let deliveries = Deliveries::default();
    record_into(&consumer, &deliveries);
    consumer
        .set_consuming_params(replay_between(base, base + 1000, 10.0))
        .unwrap();

    consumer.start().await.unwrap();
    wait_for_stopped(&consumer).await;

    // `to` itself is inside the interval, `to + 1` is not.
    assert_eq!(deliveries.seqs(), vec![0, 1]);
}

#[tokio::test(start_paused = true)]
async fn records_appended_after_start_are_not_replayed() {
    let broker = MemoryBroker::new();
    let base = base_ts();
    append_positions(&broker, TOPIC, &[base, base + 100]).await;

    let consumer = consumer(&broker);
    let deliveries = Deliveries::default();
    record_into(&consumer, &deliveries);
    consumer.set_consuming_params(replay_from(base, 1.0)).unwrap();

    consumer.start().await.unwrap();
    broker
        .append_json(TOPIC, None, &Position { seq: 99 }, base + 200)
        .await
        .unwrap();

    wait_for_stopped(&consumer).await;
    assert_eq!(deliveries.seqs(), vec![0, 1]);
}

#[tokio::test(start_paused = true)]
async fn empty_topic_completes_at_start() {
    let broker = MemoryBroker::new();
    let consumer = consumer(&broker);
    let phases = PhaseLog::default();
    consumer.set_phase_changed_handler(phases.handler());
    consumer.set_consuming_params(replay_from(base_ts(), 1.0)).unwrap();

    consumer.start().await.unwrap();
    wait_for_stopped(&consumer).await;

    // The STOPPED notification trails the phase change.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(phases.phases(), vec![Phase::Running, Phase::Stopped]);
}

#[tokio::test(start_paused = true)]
async fn interval_after_last_record_completes_at_start() {
    let broker = MemoryBroker::new();
    let base = base_ts();
    append_positions(&broker, TOPIC, &[base, base + 1000]).await;

    let consumer = consumer(&broker);
    let deliveries = Deliveries::default();
    record_into(&consumer, &deliveries);
    consumer
        .set_consuming_params(replay_from(base + 5000, 1.0))
        .unwrap();

    consumer.start().await.unwrap();
    wait_for_stopped(&consumer).await;
    assert!(deliveries.seqs().is_empty());
}

#[tokio::test(start_paused = true)]
async fn stop_is_idempotent_and_reported_once() {
    let broker = MemoryBroker::new();
    let consumer = consumer(&broker);
    let phases = PhaseLog::default();
    consumer.set_phase_changed_handler(phases.handler());

    consumer.start().await.unwrap();
    assert!(consumer.is_running());

    consumer.stop().await.unwrap();
    consumer.stop().await.unwrap();
    consumer.stop_if_running().await.unwrap();

    assert_eq!(consumer.phase(), Phase::Stopped);
    assert_eq!(phases.count(Phase::Stopped), 1);
}

#[tokio::test(start_paused = true)]
async fn stop_interrupts_a_paced_wait() {
    let broker = MemoryBroker::new();
    let base = base_ts();
    append_positions(&broker, TOPIC, &[base, base + 60_000]).await;

    let consumer = consumer(&broker);
    let deliveries = Deliveries::default();
    record_into(&consumer, &deliveries);
    consumer.set_consuming_params(replay_from(base, 1.0)).unwrap();

    consumer.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stopping = tokio::time::Instant::now();
    consumer.stop().await.unwrap();
    assert!(stopping.elapsed() < Duration::from_millis(100));
    assert_eq!(deliveries.seqs(), vec![0]);
}

#[tokio::test(start_paused = true)]
async fn stop_while_paused() {
    let broker = MemoryBroker::new();
    let base = base_ts();
    append_positions(&broker, TOPIC, &[base, base + 1000]).await;

    let consumer = consumer(&broker);
    consumer.set_consuming_params(replay_from(base, 1.0)).unwrap();
    consumer.start().await.unwrap();
    consumer.pause().unwrap();

    consumer.stop().await.unwrap();
    assert_eq!(consumer.phase(), Phase::Stopped);
    assert!(consumer.resume().is_err());
}

#[tokio::test(start_paused = true)]
async fn handler_can_stop_its_own_consumer() {
    let broker = MemoryBroker::new();
    let consumer = consumer(&broker);
    let deliveries = Deliveries::default();

    let me = consumer.clone();
    let seen = deliveries.clone();
    consumer
        .set_event_handler(move |_key, position: Position| {
            let me = me.clone();
            let seen = seen.clone();
            async move {
                seen.push(position.seq);
                me.stop().await?;
                Ok::<(), BoxError>(())
            }
        })
        .unwrap();

    consumer.start().await.unwrap();
    broker
        .append_json(TOPIC, None, &Position { seq: 0 }, base_ts())
        .await
        .unwrap();
    broker
        .append_json(TOPIC, None, &Position { seq: 1 }, base_ts())
        .await
        .unwrap();

    wait_for_stopped(&consumer).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(deliveries.seqs(), vec![0]);
}

#[tokio::test(start_paused = true)]
async fn handler_failure_is_reported_and_consumption_continues() {
    let broker = MemoryBroker::new();
    let base = base_ts();
    append_positions(&broker, TOPIC, &[base, base + 10, base + 20]).await;

    let consumer = consumer(&broker);
    let errors = collect_errors(&consumer);
    let deliveries = Deliveries::default();
    let seen = deliveries.clone();
    consumer
        .set_event_handler(move |_key, position: Position| {
            let seen = seen.clone();
            async move {
                if position.seq == 1 {
                    return Err::<(), BoxError>("bad position".into());
                }
                seen.push(position.seq);
                Ok(())
            }
        })
        .unwrap();
    consumer.set_consuming_params(replay_from(base, 1.0)).unwrap();

    consumer.start().await.unwrap();
    wait_for_stopped(&consumer).await;

    assert_eq!(deliveries.seqs(), vec![0, 2]);
    assert_eq!(*errors.lock().unwrap(), vec!["handler"]);
}

#[tokio::test(start_paused = true)]
async fn handler_panic_is_reported_and_consumption_continues() {
    let broker = MemoryBroker::new();
    let base = base_ts();
    append_positions(&broker, TOPIC, &[base, base + 10]).await;

    let consumer = consumer(&broker);
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    consumer.set_error_handler(Arc::new(move |error: &ConsumerError| {
        let is_panic = matches!(error, ConsumerError::RecordHandlerPanicked { .. });
        sink.lock().unwrap().push((is_panic, error.to_string()));
    }));
    let deliveries = Deliveries::default();
    let seen = deliveries.clone();
    consumer
        .set_event_handler(move |_key, position: Position| {
            let seen = seen.clone();
            async move {
                if position.seq == 0 {
                    panic!("handler blew up");
                }
                seen.push(position.seq);
                Ok::<(), BoxError>(())
            }
        })
        .unwrap();
    consumer.set_consuming_params(replay_from(base, 1.0)).unwrap();

    consumer.start().await.unwrap();
    wait_for_stopped(&consumer).await;

    assert_eq!(deliveries.seqs(), vec![1]);
    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    let (is_panic, message) = &errors[0];
    assert!(*is_panic);
    // The offending record is identified by topic, offset and key.
    assert!(message.contains("positions; o:0"), "{message}");
    assert!(message.contains("vehicle-1"), "{message}");
    assert!(message.contains("handler blew up"), "{message}");
}

#[tokio::test(start_paused = true)]
async fn undecodable_record_is_reported() {
    let broker = MemoryBroker::new();
    let base = base_ts();
    broker
        .append(TOPIC, None, Some(b"not json".to_vec()), base)
        .await;
    append_positions(&broker, TOPIC, &[base + 10]).await;

    let consumer = consumer(&broker);
    let errors = collect_errors(&consumer);
    let deliveries = Deliveries::default();
    record_into(&consumer, &deliveries);
    consumer.set_consuming_params(replay_from(base, 1.0)).unwrap();

    consumer.start().await.unwrap();
    wait_for_stopped(&consumer).await;

    assert_eq!(deliveries.seqs(), vec![0]);
    assert_eq!(*errors.lock().unwrap(), vec!["decode"]);
}

#[tokio::test(start_paused = true)]
async fn record_without_value_is_skipped() {
    let broker = MemoryBroker::new();
    let base = base_ts();
    append_positions(&broker, TOPIC, &[base]).await;
    broker.append(TOPIC, Some("vehicle-1"), None, base + 10).await;
    broker
        .append_json(TOPIC, None, &Position { seq: 2 }, base + 20)
        .await
        .unwrap();

    let consumer = consumer(&broker);
    let errors = collect_errors(&consumer);
    let deliveries = Deliveries::default();
    record_into(&consumer, &deliveries);
    consumer.set_consuming_params(replay_from(base, 1.0)).unwrap();

    consumer.start().await.unwrap();
    wait_for_stopped(&consumer).await;

    assert_eq!(deliveries.seqs(), vec![0, 2]);
    assert!(errors.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn filters_drop_records_but_not_completion() {
    let broker = MemoryBroker::new();
    let base = base_ts();
    for (seq, key) in ["a", "b", "a", "b"].iter().enumerate() {
        broker
            .append_json(TOPIC, Some(key), &Position { seq: seq as u32 }, base + seq as i64)
            .await
            .unwrap();
    }

    let consumer = consumer(&broker);
    let deliveries = Deliveries::default();
    record_into(&consumer, &deliveries);
    consumer.add_filter(Arc::new(keyed_a));
    consumer.set_consuming_params(replay_from(base, 1.0)).unwrap();

    consumer.start().await.unwrap();
    wait_for_stopped(&consumer).await;

    assert_eq!(deliveries.seqs(), vec![0, 2]);
}

#[tokio::test(start_paused = true)]
async fn reset_filters_delivers_everything() {
    let broker = MemoryBroker::new();
    let base = base_ts();
    append_positions(&broker, TOPIC, &[base, base + 1]).await;

    let consumer = consumer(&broker);
    let deliveries = Deliveries::default();
    record_into(&consumer, &deliveries);
    consumer.add_filter(Arc::new(reject_all));
    consumer.reset_filters();
    consumer.set_consuming_params(replay_from(base, 1.0)).unwrap();

    consumer.start().await.unwrap();
    wait_for_stopped(&consumer).await;
    assert_eq!(deliveries.seqs(), vec![0, 1]);
}

#[tokio::test(start_paused = true)]
async fn change_rate_speeds_up_remaining_records() {
    let broker = MemoryBroker::new();
    let base = base_ts();
    append_positions(&broker, TOPIC, &[base, base + 1000, base + 2000]).await;

    let consumer = consumer(&broker);
    let deliveries = Deliveries::default();
    record_into(&consumer, &deliveries);
    consumer.set_consuming_params(replay_from(base, 1.0)).unwrap();

    consumer.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    consumer.change_rate(4.0).unwrap();
    assert_eq!(consumer.phase(), Phase::Running);

    wait_for_stopped(&consumer).await;
    let gaps = deliveries.gaps_ms();
    // 500ms at rate 1 covers half the gap, the other 500 take 125ms.
    assert_close(gaps[0], 625);
    assert_close(gaps[1], 250);
}

#[tokio::test(start_paused = true)]
async fn real_time_delivers_only_new_records() {
    let broker = MemoryBroker::new();
    let base = base_ts();
    append_positions(&broker, TOPIC, &[base, base + 1]).await;

    let consumer = consumer(&broker);
    let deliveries = Deliveries::default();
    record_into(&consumer, &deliveries);
    consumer.set_consuming_params(ConsumingParams::real_time()).unwrap();

    consumer.start().await.unwrap();
    broker
        .append_json(TOPIC, None, &Position { seq: 7 }, base_ts())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(deliveries.seqs(), vec![7]);
    assert!(consumer.pause().is_err());
    consumer.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn idle_handler_fires_while_nothing_arrives() {
    let broker = MemoryBroker::new();
    let consumer = SingleTopicConsumer::new(
        tempo_consumer::EventType::of::<Position>(),
        TOPIC,
        Arc::new(broker.clone()),
        ConsumerOptions::default().with_poll_timeout(Duration::from_millis(100)),
    );
    let idle = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&idle);
    consumer.set_idle_handler(Arc::new(move || *counter.lock().unwrap() += 1));
    consumer.set_idle_interval(Duration::from_millis(300));

    consumer.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(1050)).await;
    consumer.stop().await.unwrap();

    let fired = *idle.lock().unwrap();
    assert!((2..=4).contains(&fired), "idle fired {fired} times");
}

#[tokio::test(start_paused = true)]
async fn broker_failure_is_reported_and_polling_resumes() {
    let broker = MemoryBroker::new();
    let consumer = consumer(&broker);
    let errors = collect_errors(&consumer);
    let deliveries = Deliveries::default();
    record_into(&consumer, &deliveries);

    consumer.start().await.unwrap();
    broker.fail_next_poll(TOPIC, "connection reset").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*errors.lock().unwrap(), vec!["broker"]);
    assert!(consumer.is_running());

    broker
        .append_json(TOPIC, None, &Position { seq: 3 }, base_ts())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert_eq!(deliveries.seqs(), vec![3]);
    consumer.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn playback_clock_ticks_from_interval_start() {
    let broker = MemoryBroker::new();
    let base = base_ts();
    append_positions(&broker, TOPIC, &[base, base + 5000]).await;

    let consumer = consumer(&broker);
    let ticks = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&ticks);
    consumer.set_playback_time_handler(Arc::new(move |ts: i64| sink.lock().unwrap().push(ts)));
    consumer.set_consuming_params(replay_from(base, 2.0)).unwrap();

    consumer.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(1600)).await;

    // Period 500ms at rate 2, each tick one simulated second later.
    assert_eq!(
        *ticks.lock().unwrap(),
        vec![base, base + 1000, base + 2000]
    );
    consumer.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn consuming_params_are_fixed_after_start() {
    let broker = MemoryBroker::new();
    let consumer = consumer(&broker);
    consumer.start().await.unwrap();

    let err = consumer
        .set_consuming_params(replay_from(base_ts(), 1.0))
        .unwrap_err();
    assert!(matches!(err, ConsumerError::AlreadyStarted { .. }));
    consumer.stop().await.unwrap();
}
