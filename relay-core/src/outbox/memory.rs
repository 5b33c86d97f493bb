use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;

use super::{CompletionStrategy, OutboxStore};
use crate::{error::StoreError, models::OutboxMessage};

/// Process-local outbox with the same visibility rules as [`super::PgOutboxStore`].
#[derive(Clone, Default)]
pub struct InMemoryOutboxStore {
    inner: Arc<Mutex<Inner>>,
    strategy: CompletionStrategy,
}

#[derive(Default)]
struct Inner {
    next_id: i64,
    rows: BTreeMap<i64, OutboxMessage>,
}

impl InMemoryOutboxStore {
    pub fn new(strategy: CompletionStrategy) -> Self {
        Self {
            inner: Arc::default(),
            strategy,
        }
    }

    /// Appends a row and returns its id. Ids start at 1 and only grow.
    pub fn insert(&self, payload: impl Into<Vec<u8>>) -> i64 {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.rows.insert(
            id,
            OutboxMessage {
                id,
                payload: payload.into(),
                created_at: Utc::now(),
                sent_at: None,
            },
        );
        id
    }

    pub fn pending_ids(&self) -> Vec<i64> {
        self.lock()
            .rows
            .values()
            .filter(|row| row.is_pending())
            .map(|row| row.id)
            .collect()
    }

    /// Every row still held, delivered ones included under `MarkSent`.
    pub fn rows(&self) -> Vec<OutboxMessage> {
        self.lock().rows.values().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Nothing panics while holding the lock, so a poisoned guard is still consistent.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl OutboxStore for InMemoryOutboxStore {
    async fn list_pending(&self, limit: i64) -> Result<Vec<OutboxMessage>, StoreError> {
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(self
            .lock()
            .rows
            .values()
            .filter(|row| row.is_pending())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn complete(&self, ids: &[i64]) -> Result<(), StoreError> {
        let mut inner = self.lock();
        match self.strategy {
            CompletionStrategy::MarkSent => {
                let now = Utc::now();
                for id in ids {
                    if let Some(row) = inner.rows.get_mut(id) {
                        row.sent_at.get_or_insert(now);
                    }
                }
            }
            CompletionStrategy::Delete => {
                for id in ids {
                    inner.rows.remove(id);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_pending_oldest_first_up_to_limit() {
        let store = InMemoryOutboxStore::default();
        for payload in ["a", "b", "c"] {
            store.insert(payload);
        }

        let rows = store.list_pending(2).await.unwrap();

        assert_eq!(rows.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(rows[0].payload, b"a".to_vec());
    }

    #[tokio::test]
    async fn test_mark_sent_is_idempotent() {
        let store = InMemoryOutboxStore::new(CompletionStrategy::MarkSent);
        store.insert("a");
        store.insert("b");

        store.complete(&[1]).await.unwrap();
        let once = store.rows();
        store.complete(&[1]).await.unwrap();
        let twice = store.rows();

        assert_eq!(once, twice);
        assert_eq!(store.pending_ids(), vec![2]);
        assert!(twice[0].sent_at.is_some());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = InMemoryOutboxStore::new(CompletionStrategy::Delete);
        store.insert("a");
        store.insert("b");

        store.complete(&[1, 2]).await.unwrap();
        store.complete(&[1, 2]).await.unwrap();

        assert!(store.rows().is_empty());
        assert!(store.list_pending(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ids_keep_growing_after_delete() {
        let store = InMemoryOutboxStore::new(CompletionStrategy::Delete);
        store.insert("a");
        store.complete(&[1]).await.unwrap();

        assert_eq!(store.insert("b"), 2);
    }
}
