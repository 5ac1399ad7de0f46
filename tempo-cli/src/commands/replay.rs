use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result, bail};
use chrono::DateTime;
use clap::Args;
use futures_util::future::join_all;
use serde::Deserialize;
use tempo_consumer::{
    BoxError, Consumer, ConsumerError, ConsumerSettings, DATE_TIME_FORMAT, Event, EventType, Phase,
    SingleTopicConsumer,
};
use tempo_log::{MemoryBroker, Timestamp};
use tracing::{error, info, warn};

use crate::config::{SettingsLoader, SettingsOverrides};
use crate::dump::Dump;

#[derive(Args)]
pub struct ReplayArgs {
    /// JSON-lines record dump to replay
    pub dump: PathBuf,

    /// Settings file (default: .tempo/config.toml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Interval start, "YYYY-MM-DD HH:MM:SS" UTC (default: earliest record)
    #[arg(long)]
    pub from: Option<String>,

    /// Interval end, "YYYY-MM-DD HH:MM:SS" UTC
    #[arg(long)]
    pub to: Option<String>,

    /// Replay rate (1.0 = original pace)
    #[arg(short, long)]
    pub rate: Option<f64>,
}

/// Any JSON payload; the dump carries no schema.
#[derive(Debug, Deserialize)]
#[serde(transparent)]
struct DumpEvent(serde_json::Value);

impl Event for DumpEvent {
    const EVENT_TYPE: &'static str = "record";
}

pub async fn run(args: ReplayArgs) -> Result<()> {
    let settings = SettingsLoader::load(args.config.as_deref())?;
    let mut settings = SettingsLoader::apply(
        settings,
        SettingsOverrides {
            from: args.from,
            to: args.to,
            rate: args.rate,
        },
    );

    let dump = Dump::load(&args.dump)?;
    let Some(earliest) = dump.earliest() else {
        println!("Dump {} holds no records", args.dump.display());
        return Ok(());
    };
    if settings.from.is_none() {
        settings.from = Some(format_timestamp(earliest)?);
    }

    let params = settings
        .consuming_params()
        .context("Invalid replay interval")?;
    let topics = topics_to_replay(&settings, &dump)?;

    let broker = MemoryBroker::new();
    dump.load_into(&broker).await?;
    info!(records = dump.len(), topics = topics.len(), %params, "Dump loaded");

    let broker = Arc::new(broker);
    let delivered = Arc::new(AtomicUsize::new(0));
    let mut consumers = Vec::with_capacity(topics.len());
    for topic in &topics {
        let consumer = SingleTopicConsumer::new(
            EventType::of::<DumpEvent>(),
            topic.as_str(),
            broker.clone(),
            settings.options(),
        );
        consumer.set_consuming_params(params.clone())?;
        print_records(&consumer, topic, &delivered)?;
        log_activity(&consumer, topic);
        consumers.push(consumer);
    }
    if let Some(first) = consumers.first() {
        first.set_playback_time_handler(Arc::new(|ts: Timestamp| {
            info!(playback_time = %format_timestamp(ts).unwrap_or_else(|_| ts.to_string()), "Playback");
        }));
    }

    for consumer in &consumers {
        consumer.start().await?;
    }

    tokio::select! {
        _ = wait_until_stopped(&consumers) => {
            info!("Replay completed");
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, stopping replay");
            for consumer in &consumers {
                consumer.stop().await?;
            }
        }
    }

    println!(
        "Replayed {} of {} records from {} topic(s)",
        delivered.load(Ordering::Relaxed),
        dump.len(),
        topics.len()
    );
    Ok(())
}

/// Topics named in the settings, or every topic in the dump.
fn topics_to_replay(settings: &ConsumerSettings, dump: &Dump) -> Result<Vec<String>> {
    if settings.topics.is_empty() {
        return Ok(dump.topics().map(str::to_string).collect());
    }

    // Also validates the one-to-one mapping.
    let map = settings.topic_map()?;
    let mut topics = Vec::with_capacity(map.len());
    for (event_type, topic) in map.iter() {
        if !dump.topics().any(|t| t == topic) {
            bail!("Topic '{topic}' for event type '{event_type}' is not in the dump");
        }
        topics.push(topic.to_string());
    }
    topics.sort();
    Ok(topics)
}

fn print_records(
    consumer: &SingleTopicConsumer,
    topic: &str,
    delivered: &Arc<AtomicUsize>,
) -> Result<()> {
    let topic = topic.to_string();
    let delivered = Arc::clone(delivered);
    consumer.set_event_handler(move |key: Option<String>, event: DumpEvent| {
        let topic = topic.clone();
        let delivered = Arc::clone(&delivered);
        async move {
            delivered.fetch_add(1, Ordering::Relaxed);
            println!("{topic}\t{}\t{}", key.as_deref().unwrap_or("-"), event.0);
            Ok::<(), BoxError>(())
        }
    })?;
    Ok(())
}

fn log_activity(consumer: &SingleTopicConsumer, topic: &str) {
    let name = topic.to_string();
    consumer.set_error_handler(Arc::new(move |e: &ConsumerError| {
        error!(topic = %name, error = %e, "Replay error");
    }));

    let name = topic.to_string();
    consumer.set_idle_handler(Arc::new(move || {
        info!(topic = %name, "No records within the idle interval");
    }));
}

async fn wait_until_stopped(consumers: &[SingleTopicConsumer]) {
    join_all(consumers.iter().map(|consumer| {
        let mut phases = consumer.subscribe();
        async move {
            let _ = phases.wait_for(|phase| *phase == Phase::Stopped).await;
        }
    }))
    .await;
}

fn format_timestamp(ts: Timestamp) -> Result<String> {
    let Some(dt) = DateTime::from_timestamp_millis(ts) else {
        bail!("Timestamp out of range: {ts}");
    };
    Ok(dt.format(DATE_TIME_FORMAT).to_string())
}
