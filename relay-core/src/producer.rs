use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kafka::client::RequiredAcks;
use kafka::producer::{Producer, Record};

use crate::error::ProduceError;

/// Delivers a batch of opaque payloads to a topic.
///
/// A batch is all-or-nothing from the caller's point of view: if any payload
/// is not acknowledged the whole call fails and the caller resends all of it.
pub trait BrokerProducer: Send + Sync {
    fn produce(
        &self,
        topic: &str,
        payloads: Vec<Vec<u8>>,
    ) -> impl Future<Output = Result<(), ProduceError>> + Send;
}

impl<P: BrokerProducer> BrokerProducer for Arc<P> {
    async fn produce(&self, topic: &str, payloads: Vec<Vec<u8>>) -> Result<(), ProduceError> {
        (**self).produce(topic, payloads).await
    }
}

pub struct KafkaProducer {
    inner: Arc<Mutex<Producer>>,
}

impl KafkaProducer {
    pub fn connect(hosts: Vec<String>, ack_timeout: Duration) -> Result<Self, ProduceError> {
        let producer = Producer::from_hosts(hosts)
            .with_ack_timeout(ack_timeout)
            .with_required_acks(RequiredAcks::One)
            .create()?;

        Ok(Self {
            inner: Arc::new(Mutex::new(producer)),
        })
    }
}

impl BrokerProducer for KafkaProducer {
    async fn produce(&self, topic: &str, payloads: Vec<Vec<u8>>) -> Result<(), ProduceError> {
        if payloads.is_empty() {
            return Ok(());
        }

        let inner = self.inner.clone();
        let topic = topic.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), ProduceError> {
            let mut producer = inner
                .lock()
                .map_err(|_| ProduceError::Unavailable("producer lock poisoned".to_string()))?;

            let records = payloads
                .iter()
                .map(|payload| Record::from_value(topic.as_str(), payload.as_slice()))
                .collect::<Vec<_>>();
            let confirms = producer.send_all(&records)?;

            // The broker answers per partition; one failed partition fails the batch.
            for confirm in confirms {
                for partition_confirm in confirm.partition_confirms {
                    if let Err(code) = partition_confirm.offset {
                        return Err(ProduceError::Rejected {
                            topic: confirm.topic.clone(),
                            partition: partition_confirm.partition,
                            code: format!("{:?}", code),
                        });
                    }
                }
            }

            tracing::debug!(topic = %topic, count = records.len(), "produced batch");
            Ok(())
        })
        .await?
    }
}
