//! Durable store of outbound messages written alongside business data.
//!
//! Rows are inserted by the business writer inside its own transaction (see
//! [`pg::OutboxPublisher`]) and become visible to the relay once that
//! transaction commits. The relay is the only reader and the only party that
//! completes rows.

use std::future::Future;

use crate::{error::StoreError, models::OutboxMessage};

pub mod memory;
pub mod pg;

pub use memory::InMemoryOutboxStore;
pub use pg::{publish_with, OutboxPublisher, PgOutboxStore};

/// What happens to a row once its batch has been accepted by the broker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CompletionStrategy {
    /// Set `sent_at`, keeping the row for auditing.
    #[default]
    MarkSent,
    /// Remove the row.
    Delete,
}

pub trait OutboxStore: Send + Sync {
    /// Up to `limit` pending rows, oldest `id` first.
    fn list_pending(
        &self,
        limit: i64,
    ) -> impl Future<Output = Result<Vec<OutboxMessage>, StoreError>> + Send;

    /// Completes the given rows. Calling it again with the same ids must leave
    /// the store unchanged.
    fn complete(&self, ids: &[i64]) -> impl Future<Output = Result<(), StoreError>> + Send;
}

impl<S: OutboxStore> OutboxStore for std::sync::Arc<S> {
    async fn list_pending(&self, limit: i64) -> Result<Vec<OutboxMessage>, StoreError> {
        (**self).list_pending(limit).await
    }

    async fn complete(&self, ids: &[i64]) -> Result<(), StoreError> {
        (**self).complete(ids).await
    }
}
