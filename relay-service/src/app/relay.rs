use std::time::Duration;

use clap::{Args, ValueEnum};
use relay_core::outbox::{pg::DEFAULT_RELAY_LOCK_KEY, PgOutboxStore};
use relay_core::{CompletionStrategy, KafkaProducer, OutboxRelay, RelayConfig};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{kafka_hosts, require_database_url};

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum Completion {
    MarkSent,
    Delete,
}

impl From<Completion> for CompletionStrategy {
    fn from(completion: Completion) -> Self {
        match completion {
            Completion::MarkSent => CompletionStrategy::MarkSent,
            Completion::Delete => CompletionStrategy::Delete,
        }
    }
}

#[derive(Args)]
pub struct RelayArgs {
    #[arg(long, env = "KAFKA_URL")]
    kafka_url: String,

    #[arg(long, env = "OUTBOX_TOPIC")]
    topic: String,

    #[arg(long, env = "RELAY_BATCH_LIMIT", default_value_t = relay_core::relay::DEFAULT_BATCH_LIMIT)]
    batch_limit: i64,

    #[arg(long, env = "RELAY_INTERVAL_MS", default_value_t = 500)]
    interval_ms: u64,

    #[arg(long, env = "RELAY_ACK_TIMEOUT_MS", default_value_t = 1000)]
    ack_timeout_ms: u64,

    #[arg(long, env = "RELAY_COMPLETION", value_enum, default_value = "mark-sent")]
    completion: Completion,

    /// Advisory lock electing the one relay that publishes.
    #[arg(long, env = "RELAY_LOCK_KEY", default_value_t = DEFAULT_RELAY_LOCK_KEY)]
    lock_key: i64,

    /// Publish without taking the relay lock.
    #[arg(long, env = "RELAY_NO_LOCK")]
    no_lock: bool,
}

pub async fn main(
    database_url: &str,
    args: RelayArgs,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let relay_lock = (!args.no_lock).then_some(args.lock_key);
    let store = PgOutboxStore::connect(require_database_url(database_url)?, args.completion.into())
        .await?
        .with_relay_lock(relay_lock);
    info!(?relay_lock, "outbox store connected");

    let producer = KafkaProducer::connect(
        kafka_hosts(&args.kafka_url),
        Duration::from_millis(args.ack_timeout_ms),
    )?;

    let config = RelayConfig {
        batch_limit: args.batch_limit,
        interval: Duration::from_millis(args.interval_ms),
        ..RelayConfig::new(args.topic)
    };
    OutboxRelay::new(config, store, producer).run(token).await;
    Ok(())
}
