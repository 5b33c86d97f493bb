use std::time::Duration;

use anyhow::Context;
use clap::Args;
use relay_core::{
    ConsumerConfig, KafkaConsumer, KafkaProducer, MessageHandler, PartitionedConsumer,
    ProducerDeadLetterSink, RetryConfig,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::kafka_hosts;

#[derive(Args)]
pub struct ConsumeArgs {
    #[arg(long, env = "KAFKA_URL")]
    kafka_url: String,

    #[arg(long, env = "CONSUME_TOPIC")]
    topic: String,

    #[arg(long, env = "CONSUME_GROUP")]
    group: String,

    /// Dead-letter topic, `<topic>.dlq` when omitted.
    #[arg(long, env = "DEAD_LETTER_TOPIC")]
    dead_letter_topic: Option<String>,

    /// Lanes to start up front; asks the broker when omitted.
    #[arg(long, env = "CONSUME_PARTITIONS")]
    partitions: Option<usize>,

    /// Handler invocations per message; unbounded when omitted.
    #[arg(long, env = "CONSUME_MAX_RETRIES")]
    max_retries: Option<u32>,

    #[arg(long, env = "CONSUME_RETRY_BACKOFF_MS", default_value_t = 500)]
    retry_backoff_ms: u64,

    #[arg(long, env = "CONSUME_LANE_CAPACITY", default_value_t = relay_core::partitioned::DEFAULT_LANE_CAPACITY)]
    lane_capacity: usize,
}

/// Logs every payload as JSON. Payloads that are not JSON fail and go through
/// retries and dead-lettering.
pub struct JsonLogHandler;

impl MessageHandler for JsonLogHandler {
    async fn handle(&self, payload: &[u8]) -> anyhow::Result<()> {
        let value: serde_json::Value =
            serde_json::from_slice(payload).context("payload is not valid JSON")?;
        info!(payload = %value, "message received");
        Ok(())
    }
}

pub async fn main(args: ConsumeArgs, token: CancellationToken) -> anyhow::Result<()> {
    let hosts = kafka_hosts(&args.kafka_url);
    let consumer = KafkaConsumer::connect(hosts.clone(), &args.topic, &args.group)?;
    let partition_count = match args.partitions {
        Some(count) => count,
        None => consumer.partition_count()?.max(1),
    };

    let dead_letter_topic = args
        .dead_letter_topic
        .unwrap_or_else(|| format!("{}.dlq", args.topic));
    let dead_letters = ProducerDeadLetterSink::new(
        KafkaProducer::connect(hosts, Duration::from_secs(1))?,
        dead_letter_topic,
    );

    let config = ConsumerConfig {
        partition_count,
        lane_capacity: args.lane_capacity,
        retry: RetryConfig {
            max_retries: args.max_retries,
            retry_backoff: Duration::from_millis(args.retry_backoff_ms),
        },
        ..ConsumerConfig::new(args.topic)
    };

    PartitionedConsumer::new(config, consumer, JsonLogHandler, dead_letters)
        .run(token)
        .await?;
    Ok(())
}
