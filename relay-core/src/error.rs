use thiserror::Error;
use tokio::task::JoinError;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("error while executing database query")]
    Query(#[from] diesel::result::Error),
    #[error("cannot connect to database")]
    Connect(#[from] diesel::ConnectionError),
    #[error("cannot apply migrations: {0}")]
    Migration(String),
    #[error("cannot encode outbox payload")]
    Encode(#[from] serde_json::Error),
    #[error("outbox store is unavailable: {0}")]
    Unavailable(String),
    #[error("blocking task failed")]
    Join(#[from] JoinError),
}

#[derive(Error, Debug)]
pub enum ProduceError {
    #[error("kafka error")]
    Kafka(#[from] kafka::Error),
    #[error("broker rejected message on {topic}/{partition}: {code}")]
    Rejected {
        topic: String,
        partition: i32,
        code: String,
    },
    #[error("producer is unavailable: {0}")]
    Unavailable(String),
    #[error("blocking task failed")]
    Join(#[from] JoinError),
}

#[derive(Error, Debug)]
pub enum ConsumeError {
    #[error("kafka error")]
    Kafka(#[from] kafka::Error),
    #[error("consumer is closed")]
    Closed,
    #[error("consumer is unavailable: {0}")]
    Unavailable(String),
    #[error("blocking task failed")]
    Join(#[from] JoinError),
}

#[derive(Error, Debug)]
pub enum DeadLetterError {
    #[error("cannot produce dead letter")]
    Produce(#[from] ProduceError),
    #[error("cannot store dead letter")]
    Store(#[from] StoreError),
}

impl From<diesel::result::Error> for DeadLetterError {
    fn from(err: diesel::result::Error) -> Self {
        DeadLetterError::Store(StoreError::Query(err))
    }
}

/// Failure of a single publish cycle. The relay loop logs it and retries on
/// the next tick.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("cannot list pending outbox messages")]
    List(#[source] StoreError),
    #[error("cannot publish outbox batch")]
    Produce(#[from] ProduceError),
    #[error("cannot complete {count} published outbox messages")]
    Complete {
        count: usize,
        #[source]
        source: StoreError,
    },
}

/// Unrecoverable failure that ends the partitioned consume loop.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("cannot fetch message")]
    Fetch(#[source] ConsumeError),
    #[error("cannot commit offset {offset} on partition {partition}")]
    Commit {
        partition: i32,
        offset: i64,
        #[source]
        source: ConsumeError,
    },
    #[error("cannot dead-letter offset {offset} on partition {partition}")]
    DeadLetter {
        partition: i32,
        offset: i64,
        #[source]
        source: DeadLetterError,
    },
    #[error("worker of partition {0} stopped unexpectedly")]
    LaneClosed(i32),
}
