use diesel::Connection;
use diesel_async::async_connection_wrapper::AsyncConnectionWrapper;
use diesel_async::{AsyncConnection, AsyncPgConnection};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

pub mod consumer;
pub mod dead_letter;
pub mod dispatcher;
pub mod error;
pub mod models;
pub mod outbox;
pub mod partitioned;
pub mod producer;
pub mod relay;
pub mod schema;

pub use consumer::{BrokerConsumer, FetchedMessage, KafkaConsumer};
pub use dead_letter::{DeadLetter, DeadLetterSink, PgDeadLetterSink, ProducerDeadLetterSink};
pub use dispatcher::{DispatchOutcome, MessageHandler, RetryConfig, RetryingDispatcher};
pub use error::{
    ConsumeError, ConsumerError, DeadLetterError, ProduceError, RelayError, StoreError,
};
pub use models::OutboxMessage;
pub use outbox::{CompletionStrategy, OutboxStore};
pub use partitioned::{ConsumerConfig, PartitionedConsumer};
pub use producer::{BrokerProducer, KafkaProducer};
pub use relay::{OutboxRelay, RelayConfig, RelayTrigger};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("./migrations");

pub async fn establish_connection(database_url: &str) -> Result<AsyncPgConnection, StoreError> {
    Ok(AsyncPgConnection::establish(database_url).await?)
}

/// Applies the embedded `outbox` / `dead_letters` migrations.
///
/// Migrations run through a sync wrapper around the async connection, so the
/// work is moved onto a blocking thread.
pub async fn run_migrations(database_url: &str) -> Result<usize, StoreError> {
    let database_url = database_url.to_string();
    tokio::task::spawn_blocking(move || -> Result<usize, StoreError> {
        let mut conn = AsyncConnectionWrapper::<AsyncPgConnection>::establish(&database_url)?;
        let applied = conn
            .run_pending_migrations(MIGRATIONS)
            .map_err(|err| StoreError::Migration(err.to_string()))?;
        Ok(applied.len())
    })
    .await?
}
