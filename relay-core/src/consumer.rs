use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use kafka::client::{FetchOffset, GroupOffsetStorage};
use kafka::consumer::Consumer;

use crate::error::ConsumeError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchedMessage {
    pub partition: i32,
    pub offset: i64,
    pub payload: Vec<u8>,
}

pub trait BrokerConsumer: Send + Sync + 'static {
    /// Waits for the next message of the subscribed topic.
    fn fetch(&self) -> impl Future<Output = Result<FetchedMessage, ConsumeError>> + Send;

    /// Records `offset` as processed for the consumer group.
    fn commit(
        &self,
        partition: i32,
        offset: i64,
    ) -> impl Future<Output = Result<(), ConsumeError>> + Send;
}

impl<C: BrokerConsumer> BrokerConsumer for Arc<C> {
    async fn fetch(&self) -> Result<FetchedMessage, ConsumeError> {
        (**self).fetch().await
    }

    async fn commit(&self, partition: i32, offset: i64) -> Result<(), ConsumeError> {
        (**self).commit(partition, offset).await
    }
}

pub const DEFAULT_IDLE_BACKOFF: Duration = Duration::from_secs(1);

pub struct KafkaConsumer {
    topic: String,
    idle_backoff: Duration,
    state: Arc<Mutex<PollState>>,
}

struct PollState {
    consumer: Consumer,
    buffered: VecDeque<FetchedMessage>,
}

impl KafkaConsumer {
    pub fn connect(hosts: Vec<String>, topic: &str, group: &str) -> Result<Self, ConsumeError> {
        let consumer = Consumer::from_hosts(hosts)
            .with_topic(topic.to_string())
            .with_group(group.to_string())
            .with_fallback_offset(FetchOffset::Earliest)
            .with_offset_storage(Some(GroupOffsetStorage::Kafka))
            .create()?;

        Ok(Self {
            topic: topic.to_string(),
            idle_backoff: DEFAULT_IDLE_BACKOFF,
            state: Arc::new(Mutex::new(PollState {
                consumer,
                buffered: VecDeque::new(),
            })),
        })
    }

    pub fn with_idle_backoff(mut self, idle_backoff: Duration) -> Self {
        self.idle_backoff = idle_backoff;
        self
    }

    /// Number of partitions the cluster reports for the subscribed topic.
    pub fn partition_count(&self) -> Result<usize, ConsumeError> {
        let state = lock(&self.state)?;
        Ok(state
            .consumer
            .client()
            .topics()
            .partitions(&self.topic)
            .map(|partitions| partitions.len())
            .unwrap_or(0))
    }
}

fn lock(state: &Mutex<PollState>) -> Result<MutexGuard<'_, PollState>, ConsumeError> {
    state
        .lock()
        .map_err(|_| ConsumeError::Unavailable("consumer lock poisoned".to_string()))
}

impl BrokerConsumer for KafkaConsumer {
    async fn fetch(&self) -> Result<FetchedMessage, ConsumeError> {
        loop {
            let state = self.state.clone();
            let next = tokio::task::spawn_blocking(
                move || -> Result<Option<FetchedMessage>, ConsumeError> {
                    let mut state = lock(&state)?;
                    if state.buffered.is_empty() {
                        let message_sets = state.consumer.poll()?;
                        for ms in message_sets.iter() {
                            for m in ms.messages() {
                                state.buffered.push_back(FetchedMessage {
                                    partition: ms.partition(),
                                    offset: m.offset,
                                    payload: m.value.to_vec(),
                                });
                            }
                        }
                    }
                    Ok(state.buffered.pop_front())
                },
            )
            .await??;

            match next {
                Some(message) => return Ok(message),
                None => tokio::time::sleep(self.idle_backoff).await,
            }
        }
    }

    async fn commit(&self, partition: i32, offset: i64) -> Result<(), ConsumeError> {
        let state = self.state.clone();
        let topic = self.topic.clone();
        tokio::task::spawn_blocking(move || -> Result<(), ConsumeError> {
            let mut state = lock(&state)?;
            state.consumer.consume_message(&topic, partition, offset)?;
            state.consumer.commit_consumed()?;
            Ok(())
        })
        .await?
    }
}
