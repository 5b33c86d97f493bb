//! Bounded retry around a user handler.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::consumer::FetchedMessage;

pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Processes one payload.
///
/// Delivery is at-least-once: the same payload can arrive again after a
/// crash, a rebalance or a duplicate publication, so handlers must be
/// idempotent.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, payload: &[u8]) -> impl Future<Output = anyhow::Result<()>> + Send;
}

impl<H: MessageHandler> MessageHandler for Arc<H> {
    async fn handle(&self, payload: &[u8]) -> anyhow::Result<()> {
        (**self).handle(payload).await
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RetryConfig {
    /// Handler invocations per message, the first one included. `None` retries
    /// until the handler succeeds.
    pub max_retries: Option<u32>,
    pub retry_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: None,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

impl RetryConfig {
    fn exhausted(&self, attempts: u32) -> bool {
        self.max_retries.is_some_and(|max| attempts >= max)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The handler succeeded; the offset may be committed.
    Succeeded { attempts: u32 },
    /// Every allowed attempt failed; the message must be dead-lettered.
    Exhausted { attempts: u32, last_error: String },
    /// Shutdown interrupted the backoff; the message is left for redelivery.
    Cancelled { attempts: u32 },
}

pub struct RetryingDispatcher<H> {
    handler: H,
    retry: RetryConfig,
}

impl<H: MessageHandler> RetryingDispatcher<H> {
    pub fn new(handler: H, retry: RetryConfig) -> Self {
        Self { handler, retry }
    }

    /// Invokes the handler until it succeeds, the attempt budget runs out, or
    /// `token` is cancelled while waiting between attempts.
    pub async fn dispatch(
        &self,
        message: &FetchedMessage,
        token: &CancellationToken,
    ) -> DispatchOutcome {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let err = match self.handler.handle(&message.payload).await {
                Ok(()) => {
                    debug!(
                        partition = message.partition,
                        offset = message.offset,
                        attempts,
                        "message handled"
                    );
                    return DispatchOutcome::Succeeded { attempts };
                }
                Err(err) => err,
            };

            if self.retry.exhausted(attempts) {
                return DispatchOutcome::Exhausted {
                    attempts,
                    last_error: format!("{:#}", err),
                };
            }

            warn!(
                partition = message.partition,
                offset = message.offset,
                attempts,
                error = ?err,
                "handler failed, retrying"
            );

            tokio::select! {
                _ = token.cancelled() => return DispatchOutcome::Cancelled { attempts },
                _ = tokio::time::sleep(self.retry.retry_backoff) => {}
            }
        }
    }
}
