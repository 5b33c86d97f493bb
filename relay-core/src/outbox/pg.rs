use chrono::Utc;
use diesel::{
    define_sql_function,
    prelude::*,
    sql_types::{BigInt, Bool},
};
use diesel_async::{
    scoped_futures::{ScopedBoxFuture, ScopedFutureExt},
    AsyncConnection, AsyncPgConnection, RunQueryDsl,
};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{CompletionStrategy, OutboxStore};
use crate::{
    error::StoreError,
    establish_connection,
    models::{NewOutboxMessage, OutboxMessage},
    schema::outbox,
};

/// Advisory lock key taken by relays unless configured otherwise.
pub const DEFAULT_RELAY_LOCK_KEY: i64 = 0x6f75_7462_6f78;

define_sql_function! {
    fn pg_try_advisory_lock(key: BigInt) -> Bool;
}

/// Postgres-backed outbox read by the relay.
///
/// Only the session holding the relay lock lists rows; other stores pointed
/// at the same database see an empty outbox until the holder's connection
/// goes away, then take over on their next cycle. A failed query drops the
/// connection and the next call reconnects from `database_url`.
pub struct PgOutboxStore {
    database_url: String,
    session: Mutex<Option<Session>>,
    strategy: CompletionStrategy,
    relay_lock: Option<i64>,
}

struct Session {
    conn: AsyncPgConnection,
    holds_lock: bool,
}

impl PgOutboxStore {
    pub async fn connect(
        database_url: &str,
        strategy: CompletionStrategy,
    ) -> Result<Self, StoreError> {
        let conn = establish_connection(database_url).await?;
        Ok(Self {
            database_url: database_url.to_string(),
            session: Mutex::new(Some(Session {
                conn,
                holds_lock: false,
            })),
            strategy,
            relay_lock: Some(DEFAULT_RELAY_LOCK_KEY),
        })
    }

    /// Sets the advisory lock that elects the publishing relay. `None` lets
    /// every store publish.
    pub fn with_relay_lock(mut self, key: Option<i64>) -> Self {
        self.relay_lock = key;
        self
    }

    async fn reopen(&self) -> Result<Session, StoreError> {
        let conn = establish_connection(&self.database_url).await?;
        info!("outbox store reconnected");
        Ok(Session {
            conn,
            holds_lock: false,
        })
    }
}

impl Session {
    async fn list_pending(
        &mut self,
        limit: i64,
        relay_lock: Option<i64>,
    ) -> Result<Vec<OutboxMessage>, StoreError> {
        if let Some(key) = relay_lock {
            if !self.holds_lock {
                self.holds_lock = diesel::select(pg_try_advisory_lock(key))
                    .get_result::<bool>(&mut self.conn)
                    .await?;
                if !self.holds_lock {
                    debug!(key, "relay lock held by another session");
                    return Ok(Vec::new());
                }
                info!(key, "relay lock acquired");
            }
        }

        let rows = outbox::table
            .filter(outbox::sent_at.is_null())
            .order(outbox::id.asc())
            .limit(limit)
            .select(OutboxMessage::as_select())
            .load::<OutboxMessage>(&mut self.conn)
            .await?;
        Ok(rows)
    }

    async fn complete(
        &mut self,
        ids: &[i64],
        strategy: CompletionStrategy,
    ) -> Result<(), StoreError> {
        match strategy {
            CompletionStrategy::MarkSent => {
                // Only stamp rows still pending, so a repeated call keeps the first timestamp.
                diesel::update(
                    outbox::table
                        .filter(outbox::id.eq_any(ids))
                        .filter(outbox::sent_at.is_null()),
                )
                .set(outbox::sent_at.eq(Utc::now()))
                .execute(&mut self.conn)
                .await?;
            }
            CompletionStrategy::Delete => {
                diesel::delete(outbox::table.filter(outbox::id.eq_any(ids)))
                    .execute(&mut self.conn)
                    .await?;
            }
        }
        Ok(())
    }
}

impl OutboxStore for PgOutboxStore {
    async fn list_pending(&self, limit: i64) -> Result<Vec<OutboxMessage>, StoreError> {
        let mut slot = self.session.lock().await;
        let mut session = match slot.take() {
            Some(session) => session,
            None => self.reopen().await?,
        };

        let listed = session.list_pending(limit, self.relay_lock).await;
        match &listed {
            Ok(_) => *slot = Some(session),
            Err(err) => warn!(error = ?err, "dropping outbox store connection"),
        }
        listed
    }

    async fn complete(&self, ids: &[i64]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }

        let mut slot = self.session.lock().await;
        let mut session = match slot.take() {
            Some(session) => session,
            None => self.reopen().await?,
        };

        let completed = session.complete(ids, self.strategy).await;
        match &completed {
            Ok(()) => *slot = Some(session),
            Err(err) => warn!(error = ?err, "dropping outbox store connection"),
        }
        completed
    }
}

/// Business-side writer. Borrow the connection of the transaction that
/// changes the state being announced so both commit or abort together.
pub struct OutboxPublisher<'a> {
    conn: &'a mut AsyncPgConnection,
}

impl<'a> OutboxPublisher<'a> {
    pub fn new(conn: &'a mut AsyncPgConnection) -> Self {
        Self { conn }
    }

    pub async fn publish(&mut self, payload: &[u8]) -> Result<i64, StoreError> {
        let id = diesel::insert_into(outbox::table)
            .values(NewOutboxMessage { payload })
            .returning(outbox::id)
            .get_result::<i64>(&mut *self.conn)
            .await?;
        Ok(id)
    }

    pub async fn publish_json<T: Serialize + ?Sized>(
        &mut self,
        value: &T,
    ) -> Result<i64, StoreError> {
        let payload = serde_json::to_vec(value)?;
        self.publish(&payload).await
    }
}

/// Runs `write` and queues `message` as JSON in one new transaction.
///
/// Returns what `write` produced and the id of the outbox row. If `write`
/// fails nothing is queued.
pub async fn publish_with<'a, T, R, E, F>(
    conn: &mut AsyncPgConnection,
    message: &T,
    write: F,
) -> Result<(R, i64), E>
where
    T: Serialize + ?Sized,
    F: for<'r> FnOnce(&'r mut AsyncPgConnection) -> ScopedBoxFuture<'a, 'r, Result<R, E>>
        + Send
        + 'a,
    R: Send + 'a,
    E: From<StoreError> + From<diesel::result::Error> + Send + 'a,
{
    let payload = serde_json::to_vec(message).map_err(StoreError::from)?;
    conn.transaction(|conn| {
        async move {
            let value = write(&mut *conn).await?;
            let id = OutboxPublisher::new(conn).publish(&payload).await?;
            Ok((value, id))
        }
        .scope_boxed()
    })
    .await
}
