use chrono::{DateTime, Utc};
use diesel::prelude::*;

use crate::schema::{dead_letters, outbox};

/// One pending (or, under [`CompletionStrategy::MarkSent`], delivered) outbox row.
///
/// [`CompletionStrategy::MarkSent`]: crate::outbox::CompletionStrategy::MarkSent
#[derive(Queryable, Selectable, Identifiable, Debug, Clone, PartialEq)]
#[diesel(table_name = outbox)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct OutboxMessage {
    pub id: i64,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl OutboxMessage {
    pub fn is_pending(&self) -> bool {
        self.sent_at.is_none()
    }
}

#[derive(Insertable, Debug, PartialEq)]
#[diesel(table_name = outbox)]
pub struct NewOutboxMessage<'a> {
    pub payload: &'a [u8],
}

#[derive(Queryable, Selectable, Identifiable, Debug, PartialEq)]
#[diesel(table_name = dead_letters)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct DeadLetterRow {
    pub id: i64,
    pub topic: String,
    pub source_partition: i32,
    pub source_offset: i64,
    pub attempts: i32,
    pub reason: String,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

#[derive(Insertable, Debug, PartialEq)]
#[diesel(table_name = dead_letters)]
pub struct NewDeadLetterRow<'a> {
    pub topic: &'a str,
    pub source_partition: i32,
    pub source_offset: i64,
    pub attempts: i32,
    pub reason: &'a str,
    pub payload: &'a [u8],
}
