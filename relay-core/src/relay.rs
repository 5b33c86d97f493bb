//! Outbox relay: moves committed outbox rows to the broker.
//!
//! Each publish cycle lists the oldest pending rows, sends their payloads as a
//! single batch and completes the rows only after the broker accepted the
//! batch. A failed send leaves the rows pending, so the same batch goes out
//! again on the next cycle. Delivery is therefore at-least-once and consumers
//! must tolerate duplicates.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{error::RelayError, outbox::OutboxStore, producer::BrokerProducer};

pub const DEFAULT_BATCH_LIMIT: i64 = 1000;
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub topic: String,
    /// Upper bound of rows per cycle.
    pub batch_limit: i64,
    pub interval: Duration,
}

impl RelayConfig {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            batch_limit: DEFAULT_BATCH_LIMIT,
            interval: DEFAULT_INTERVAL,
        }
    }
}

/// Wakes the relay without waiting for the next tick.
///
/// Pushing never blocks; pushes that arrive while a cycle is running collapse
/// into one extra cycle.
#[derive(Clone, Default)]
pub struct RelayTrigger {
    notify: Arc<Notify>,
}

impl RelayTrigger {
    pub fn push(&self) {
        self.notify.notify_one();
    }
}

pub struct OutboxRelay<S, P> {
    config: RelayConfig,
    store: S,
    producer: P,
    trigger: RelayTrigger,
}

impl<S, P> OutboxRelay<S, P>
where
    S: OutboxStore,
    P: BrokerProducer,
{
    pub fn new(config: RelayConfig, store: S, producer: P) -> Self {
        Self {
            config,
            store,
            producer,
            trigger: RelayTrigger::default(),
        }
    }

    pub fn trigger(&self) -> RelayTrigger {
        self.trigger.clone()
    }

    fn batch_limit(&self) -> i64 {
        self.config.batch_limit.max(1)
    }

    /// Publishes one batch and returns how many rows were completed.
    pub async fn publish_cycle(&self) -> Result<usize, RelayError> {
        let messages = self
            .store
            .list_pending(self.batch_limit())
            .await
            .map_err(RelayError::List)?;
        if messages.is_empty() {
            return Ok(0);
        }

        let ids = messages.iter().map(|m| m.id).collect::<Vec<_>>();
        let payloads = messages.into_iter().map(|m| m.payload).collect::<Vec<_>>();

        self.producer.produce(&self.config.topic, payloads).await?;

        // From here on a failure means the batch will be sent twice.
        self.store
            .complete(&ids)
            .await
            .map_err(|source| RelayError::Complete {
                count: ids.len(),
                source,
            })?;

        debug!(
            topic = %self.config.topic,
            count = ids.len(),
            first_id = ids[0],
            last_id = ids[ids.len() - 1],
            "published outbox batch"
        );
        Ok(ids.len())
    }

    /// Runs publish cycles on every tick or trigger until `token` is cancelled.
    pub async fn run(&self, token: CancellationToken) {
        let mut ticker = time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            topic = %self.config.topic,
            batch_limit = self.batch_limit(),
            interval_ms = self.config.interval.as_millis() as u64,
            "outbox relay started"
        );

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = self.trigger.notify.notified() => {}
                _ = ticker.tick() => {}
            }

            self.drain(&token).await;
        }

        info!(topic = %self.config.topic, "outbox relay stopped");
    }

    /// Keeps publishing while cycles come back full, so a backlog does not
    /// wait one interval per batch.
    async fn drain(&self, token: &CancellationToken) {
        loop {
            match self.publish_cycle().await {
                Ok(count) if count as i64 >= self.batch_limit() && !token.is_cancelled() => {}
                Ok(_) => break,
                Err(err) => {
                    warn!(topic = %self.config.topic, error = ?err, "outbox publish cycle failed");
                    break;
                }
            }
        }
    }
}
