use std::future::Future;
use std::sync::Arc;

use diesel_async::{AsyncPgConnection, RunQueryDsl};
use prost::Message;
use tokio::sync::Mutex;

use crate::{
    error::{DeadLetterError, StoreError},
    establish_connection,
    models::NewDeadLetterRow,
    producer::BrokerProducer,
    schema::dead_letters,
};

/// A message that failed every handler attempt, with enough context to replay it.
#[derive(Clone, PartialEq, Message)]
pub struct DeadLetter {
    #[prost(string, tag = "1")]
    pub topic: String,
    #[prost(int32, tag = "2")]
    pub partition: i32,
    #[prost(int64, tag = "3")]
    pub offset: i64,
    #[prost(uint32, tag = "4")]
    pub attempts: u32,
    #[prost(string, tag = "5")]
    pub reason: String,
    #[prost(bytes = "vec", tag = "6")]
    pub payload: Vec<u8>,
}

pub trait DeadLetterSink: Send + Sync + 'static {
    fn send(&self, letter: DeadLetter) -> impl Future<Output = Result<(), DeadLetterError>> + Send;
}

impl<D: DeadLetterSink> DeadLetterSink for Arc<D> {
    async fn send(&self, letter: DeadLetter) -> Result<(), DeadLetterError> {
        (**self).send(letter).await
    }
}

/// Publishes protobuf-encoded [`DeadLetter`]s to a dedicated topic.
pub struct ProducerDeadLetterSink<P> {
    producer: P,
    topic: String,
}

impl<P: BrokerProducer> ProducerDeadLetterSink<P> {
    pub fn new(producer: P, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
        }
    }
}

impl<P: BrokerProducer + 'static> DeadLetterSink for ProducerDeadLetterSink<P> {
    async fn send(&self, letter: DeadLetter) -> Result<(), DeadLetterError> {
        self.producer
            .produce(&self.topic, vec![letter.encode_to_vec()])
            .await?;
        Ok(())
    }
}

/// Stores dead letters in the `dead_letters` table.
///
/// A failed insert drops the connection; the next letter reconnects.
pub struct PgDeadLetterSink {
    database_url: String,
    conn: Mutex<Option<AsyncPgConnection>>,
}

impl PgDeadLetterSink {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let conn = establish_connection(database_url).await?;
        Ok(Self {
            database_url: database_url.to_string(),
            conn: Mutex::new(Some(conn)),
        })
    }
}

async fn insert_letter(
    conn: &mut AsyncPgConnection,
    letter: &DeadLetter,
) -> Result<(), DeadLetterError> {
    diesel::insert_into(dead_letters::table)
        .values(NewDeadLetterRow {
            topic: &letter.topic,
            source_partition: letter.partition,
            source_offset: letter.offset,
            attempts: i32::try_from(letter.attempts).unwrap_or(i32::MAX),
            reason: &letter.reason,
            payload: &letter.payload,
        })
        .execute(conn)
        .await?;
    Ok(())
}

impl DeadLetterSink for PgDeadLetterSink {
    async fn send(&self, letter: DeadLetter) -> Result<(), DeadLetterError> {
        let mut slot = self.conn.lock().await;
        let mut conn = match slot.take() {
            Some(conn) => conn,
            None => establish_connection(&self.database_url).await?,
        };

        let inserted = insert_letter(&mut conn, &letter).await;
        if inserted.is_ok() {
            *slot = Some(conn);
        }
        inserted
    }
}
