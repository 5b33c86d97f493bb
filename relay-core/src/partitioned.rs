//! Consume loop that keeps per-partition order without letting one partition
//! stall the others.
//!
//! Every partition owns a lane: a bounded queue drained by a single worker.
//! The fetch loop only routes messages. When a lane is full its messages wait
//! in that partition's backlog on the router side, so a message stuck in
//! retries holds back its own partition and nothing else. Offsets are
//! committed by the lane after the handler succeeded or the message was
//! dead-lettered.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    consumer::{BrokerConsumer, FetchedMessage},
    dead_letter::{DeadLetter, DeadLetterSink},
    dispatcher::{DispatchOutcome, MessageHandler, RetryConfig, RetryingDispatcher},
    error::ConsumerError,
};

pub const DEFAULT_LANE_CAPACITY: usize = 16;

#[derive(Clone, Debug)]
pub struct ConsumerConfig {
    pub topic: String,
    /// Lanes started up front. Messages from other partitions get a lane on
    /// first sight.
    pub partition_count: usize,
    /// Messages queued in a lane. Anything beyond waits in the partition's
    /// backlog without holding up other partitions.
    pub lane_capacity: usize,
    pub retry: RetryConfig,
}

impl ConsumerConfig {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            partition_count: 1,
            lane_capacity: DEFAULT_LANE_CAPACITY,
            retry: RetryConfig::default(),
        }
    }
}

pub struct PartitionedConsumer<C, H, D> {
    config: ConsumerConfig,
    consumer: Arc<C>,
    dispatcher: Arc<RetryingDispatcher<H>>,
    dead_letters: Arc<D>,
}

/// State shared by every lane worker.
struct Lane<C, H, D> {
    topic: String,
    consumer: Arc<C>,
    dispatcher: Arc<RetryingDispatcher<H>>,
    dead_letters: Arc<D>,
    fatal: mpsc::UnboundedSender<ConsumerError>,
    /// Signalled whenever a worker takes a message off its queue.
    room: Notify,
    token: CancellationToken,
}

/// Router end of a lane.
struct Route {
    tx: mpsc::Sender<FetchedMessage>,
    backlog: VecDeque<FetchedMessage>,
}

impl Route {
    fn new(tx: mpsc::Sender<FetchedMessage>) -> Self {
        Self {
            tx,
            backlog: VecDeque::new(),
        }
    }

    /// Moves backlog into the lane while it has room. Returns `false` once the
    /// lane's worker is gone.
    fn flush(&mut self) -> bool {
        while let Some(message) = self.backlog.pop_front() {
            match self.tx.try_send(message) {
                Ok(()) => {}
                Err(TrySendError::Full(message)) => {
                    self.backlog.push_front(message);
                    break;
                }
                Err(TrySendError::Closed(_)) => return false,
            }
        }
        true
    }
}

/// Flushes every backlog and returns the partition of a closed lane, if any.
fn flush_routes(routes: &mut HashMap<i32, Route>) -> Option<i32> {
    routes
        .iter_mut()
        .find_map(|(partition, route)| (!route.flush()).then_some(*partition))
}

/// A lane only closes after its worker reported why.
fn lane_closed(
    fatal_rx: &mut mpsc::UnboundedReceiver<ConsumerError>,
    partition: i32,
) -> ConsumerError {
    fatal_rx
        .try_recv()
        .unwrap_or(ConsumerError::LaneClosed(partition))
}

impl<C, H, D> PartitionedConsumer<C, H, D>
where
    C: BrokerConsumer,
    H: MessageHandler,
    D: DeadLetterSink,
{
    pub fn new(config: ConsumerConfig, consumer: C, handler: H, dead_letters: D) -> Self {
        let dispatcher = RetryingDispatcher::new(handler, config.retry);
        Self {
            config,
            consumer: Arc::new(consumer),
            dispatcher: Arc::new(dispatcher),
            dead_letters: Arc::new(dead_letters),
        }
    }

    /// Fetches and dispatches until `token` is cancelled or a fetch, commit or
    /// dead-letter write fails. Returns after every lane worker has stopped.
    pub async fn run(self, token: CancellationToken) -> Result<(), ConsumerError> {
        let lanes_token = token.child_token();
        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Lane {
            topic: self.config.topic.clone(),
            consumer: self.consumer.clone(),
            dispatcher: self.dispatcher.clone(),
            dead_letters: self.dead_letters.clone(),
            fatal: fatal_tx,
            room: Notify::new(),
            token: lanes_token.clone(),
        });

        let capacity = self.config.lane_capacity.max(1);
        let mut workers = JoinSet::new();
        let mut routes = HashMap::new();
        for partition in 0..self.config.partition_count {
            let partition = i32::try_from(partition).unwrap_or(i32::MAX);
            let route = Route::new(spawn_lane(&mut workers, &shared, partition, capacity));
            routes.insert(partition, route);
        }

        info!(
            topic = %self.config.topic,
            partitions = self.config.partition_count,
            "partitioned consumer started"
        );

        // Kept across iterations: a fetch in flight must not be dropped just
        // because a lane made room.
        let consumer = self.consumer.clone();
        let mut fetch = Box::pin(consumer.fetch());
        let result = loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break Ok(()),
                Some(err) = fatal_rx.recv() => break Err(err),
                _ = shared.room.notified() => {
                    if let Some(partition) = flush_routes(&mut routes) {
                        break Err(lane_closed(&mut fatal_rx, partition));
                    }
                }
                fetched = &mut fetch => {
                    fetch = Box::pin(consumer.fetch());
                    let message = match fetched {
                        Ok(message) => message,
                        Err(err) => break Err(ConsumerError::Fetch(err)),
                    };

                    let partition = message.partition;
                    let route = routes.entry(partition).or_insert_with(|| {
                        Route::new(spawn_lane(&mut workers, &shared, partition, capacity))
                    });
                    route.backlog.push_back(message);
                    if !route.flush() {
                        break Err(lane_closed(&mut fatal_rx, partition));
                    }
                }
            }
        };

        lanes_token.cancel();
        drop(routes);
        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                error!(error = ?err, "partition worker panicked");
            }
        }

        match &result {
            Ok(()) => info!(topic = %self.config.topic, "partitioned consumer stopped"),
            Err(err) => error!(topic = %self.config.topic, error = ?err, "partitioned consumer failed"),
        }
        result
    }
}

fn spawn_lane<C, H, D>(
    workers: &mut JoinSet<()>,
    shared: &Arc<Lane<C, H, D>>,
    partition: i32,
    capacity: usize,
) -> mpsc::Sender<FetchedMessage>
where
    C: BrokerConsumer,
    H: MessageHandler,
    D: DeadLetterSink,
{
    let (tx, rx) = mpsc::channel(capacity);
    workers.spawn(shared.clone().drive(partition, rx));
    debug!(partition, "partition lane started");
    tx
}

impl<C, H, D> Lane<C, H, D>
where
    C: BrokerConsumer,
    H: MessageHandler,
    D: DeadLetterSink,
{
    async fn drive(self: Arc<Self>, partition: i32, mut rx: mpsc::Receiver<FetchedMessage>) {
        loop {
            let message = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                next = rx.recv() => match next {
                    Some(message) => message,
                    None => break,
                },
            };
            self.room.notify_one();

            match self.process(message).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => {
                    let _ = self.fatal.send(err);
                    break;
                }
            }
        }
        debug!(partition, "partition lane stopped");
    }

    /// Returns `false` once shutdown interrupted the message.
    async fn process(&self, message: FetchedMessage) -> Result<bool, ConsumerError> {
        let FetchedMessage {
            partition, offset, ..
        } = message;

        match self.dispatcher.dispatch(&message, &self.token).await {
            DispatchOutcome::Succeeded { .. } => {}
            DispatchOutcome::Exhausted { attempts, .. } if self.token.is_cancelled() => {
                debug!(partition, offset, attempts, "message left uncommitted on shutdown");
                return Ok(false);
            }
            DispatchOutcome::Exhausted {
                attempts,
                last_error,
            } => {
                error!(
                    topic = %self.topic,
                    partition,
                    offset,
                    attempts,
                    error = %last_error,
                    "retries exhausted, dead-lettering message"
                );
                let letter = DeadLetter {
                    topic: self.topic.clone(),
                    partition,
                    offset,
                    attempts,
                    reason: last_error,
                    payload: message.payload,
                };
                self.dead_letters
                    .send(letter)
                    .await
                    .map_err(|source| ConsumerError::DeadLetter {
                        partition,
                        offset,
                        source,
                    })?;
            }
            DispatchOutcome::Cancelled { attempts } => {
                debug!(partition, offset, attempts, "message left uncommitted on shutdown");
                return Ok(false);
            }
        }

        self.consumer
            .commit(partition, offset)
            .await
            .map_err(|source| ConsumerError::Commit {
                partition,
                offset,
                source,
            })?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use anyhow::bail;
    use tokio::time;

    use super::*;
    use crate::error::{ConsumeError, DeadLetterError, ProduceError};

    #[derive(Clone, Debug, PartialEq, Eq)]
    enum Event {
        Handled(String),
        DeadLettered(i32, i64),
        Committed(i32, i64),
    }

    type Events = Arc<Mutex<Vec<Event>>>;

    fn committed(events: &Events) -> Vec<(i32, i64)> {
        events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                Event::Committed(partition, offset) => Some((*partition, *offset)),
                _ => None,
            })
            .collect()
    }

    fn handled(events: &Events) -> Vec<String> {
        events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                Event::Handled(payload) => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    /// Hands out queued fetch results, then waits forever.
    struct QueuedConsumer {
        queue: Mutex<VecDeque<Result<FetchedMessage, ConsumeError>>>,
        events: Events,
        fail_commit: bool,
    }

    impl QueuedConsumer {
        fn new(events: &Events, messages: Vec<(i32, i64, &str)>) -> Self {
            let queue = messages
                .into_iter()
                .map(|(partition, offset, payload)| {
                    Ok(FetchedMessage {
                        partition,
                        offset,
                        payload: payload.as_bytes().to_vec(),
                    })
                })
                .collect();
            Self {
                queue: Mutex::new(queue),
                events: events.clone(),
                fail_commit: false,
            }
        }
    }

    impl BrokerConsumer for QueuedConsumer {
        async fn fetch(&self) -> Result<FetchedMessage, ConsumeError> {
            let next = self.queue.lock().unwrap().pop_front();
            match next {
                Some(fetched) => fetched,
                None => std::future::pending().await,
            }
        }

        async fn commit(&self, partition: i32, offset: i64) -> Result<(), ConsumeError> {
            if self.fail_commit {
                return Err(ConsumeError::Unavailable("broker down".to_string()));
            }
            self.events
                .lock()
                .unwrap()
                .push(Event::Committed(partition, offset));
            Ok(())
        }
    }

    /// Fails listed payloads a fixed number of times, or always when `None`.
    struct FlakyHandler {
        failures: HashMap<&'static str, Option<usize>>,
        calls: Mutex<HashMap<String, usize>>,
        events: Events,
    }

    impl FlakyHandler {
        fn new(events: &Events, failures: &[(&'static str, Option<usize>)]) -> Self {
            Self {
                failures: failures.iter().copied().collect(),
                calls: Mutex::default(),
                events: events.clone(),
            }
        }
    }

    impl MessageHandler for FlakyHandler {
        async fn handle(&self, payload: &[u8]) -> anyhow::Result<()> {
            let payload = String::from_utf8_lossy(payload).into_owned();
            let call = {
                let mut calls = self.calls.lock().unwrap();
                let call = calls.entry(payload.clone()).or_default();
                *call += 1;
                *call
            };
            self.events
                .lock()
                .unwrap()
                .push(Event::Handled(payload.clone()));

            match self.failures.get(payload.as_str()) {
                Some(None) => bail!("cannot handle {}", payload),
                Some(Some(failures)) if call <= *failures => bail!("cannot handle {}", payload),
                _ => Ok(()),
            }
        }
    }

    struct RecordingSink {
        letters: Mutex<Vec<DeadLetter>>,
        events: Events,
        fail: bool,
    }

    impl RecordingSink {
        fn new(events: &Events) -> Self {
            Self {
                letters: Mutex::default(),
                events: events.clone(),
                fail: false,
            }
        }
    }

    impl DeadLetterSink for RecordingSink {
        async fn send(&self, letter: DeadLetter) -> Result<(), DeadLetterError> {
            if self.fail {
                return Err(ProduceError::Unavailable("dlq down".to_string()).into());
            }
            self.events
                .lock()
                .unwrap()
                .push(Event::DeadLettered(letter.partition, letter.offset));
            self.letters.lock().unwrap().push(letter);
            Ok(())
        }
    }

    fn config(partition_count: usize, max_retries: Option<u32>, backoff_ms: u64) -> ConsumerConfig {
        ConsumerConfig {
            partition_count,
            retry: RetryConfig {
                max_retries,
                retry_backoff: Duration::from_millis(backoff_ms),
            },
            ..ConsumerConfig::new("users.event")
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        while !condition() {
            time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_keep_order_within_partition() {
        let events = Events::default();
        let consumer = QueuedConsumer::new(&events, vec![(0, 0, "a"), (0, 1, "b"), (0, 2, "c")]);
        let handler = FlakyHandler::new(&events, &[("a", Some(2))]);
        let sink = RecordingSink::new(&events);
        let token = CancellationToken::new();

        let run = tokio::spawn(
            PartitionedConsumer::new(config(1, Some(5), 10), consumer, handler, sink)
                .run(token.clone()),
        );
        wait_until(|| committed(&events).len() == 3).await;
        token.cancel();
        run.await.unwrap().unwrap();

        assert_eq!(handled(&events), vec!["a", "a", "a", "b", "c"]);
        assert_eq!(committed(&events), vec![(0, 0), (0, 1), (0, 2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_partition_does_not_block_others() {
        let events = Events::default();
        let mut messages = vec![(0, 0, "stuck")];
        messages.extend((1..=20).map(|offset| (0, offset, "behind")));
        messages.extend([(1, 0, "x"), (1, 1, "y")]);
        let consumer = QueuedConsumer::new(&events, messages);
        let handler = FlakyHandler::new(&events, &[("stuck", None)]);
        let sink = RecordingSink::new(&events);
        let token = CancellationToken::new();

        // Twenty messages behind the stuck one overflow a lane of sixteen.
        let config = ConsumerConfig {
            lane_capacity: 16,
            ..config(2, None, 100)
        };
        let run = tokio::spawn(
            PartitionedConsumer::new(config, consumer, handler, sink).run(token.clone()),
        );
        wait_until(|| committed(&events) == vec![(1, 0), (1, 1)]).await;
        token.cancel();
        run.await.unwrap().unwrap();

        assert_eq!(committed(&events), vec![(1, 0), (1, 1)]);
        assert!(!handled(&events).contains(&"behind".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backlog_drains_in_order_once_partition_recovers() {
        let events = Events::default();
        let mut messages = vec![(0, 0, "slow")];
        messages.extend((1..=5).map(|offset| (0, offset, "next")));
        messages.push((1, 0, "other"));
        let consumer = QueuedConsumer::new(&events, messages);
        let handler = FlakyHandler::new(&events, &[("slow", Some(3))]);
        let sink = RecordingSink::new(&events);
        let token = CancellationToken::new();

        let config = ConsumerConfig {
            lane_capacity: 2,
            ..config(2, None, 10)
        };
        let run = tokio::spawn(
            PartitionedConsumer::new(config, consumer, handler, sink).run(token.clone()),
        );
        wait_until(|| committed(&events).len() == 7).await;
        token.cancel();
        run.await.unwrap().unwrap();

        let partition_zero = committed(&events)
            .into_iter()
            .filter(|(partition, _)| *partition == 0)
            .map(|(_, offset)| offset)
            .collect::<Vec<_>>();
        assert_eq!(partition_zero, vec![0, 1, 2, 3, 4, 5]);
        // The other partition went first while "slow" was backing off.
        assert_eq!(committed(&events)[0], (1, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_message_is_dead_lettered_before_commit() {
        let events = Events::default();
        let consumer = QueuedConsumer::new(&events, vec![(0, 0, "bad"), (0, 1, "good")]);
        let handler = FlakyHandler::new(&events, &[("bad", None)]);
        let sink = Arc::new(RecordingSink::new(&events));
        let token = CancellationToken::new();

        let run = tokio::spawn(
            PartitionedConsumer::new(config(1, Some(2), 10), consumer, handler, sink.clone())
                .run(token.clone()),
        );
        wait_until(|| committed(&events).len() == 2).await;
        token.cancel();
        run.await.unwrap().unwrap();

        let outcomes = events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| !matches!(event, Event::Handled(_)))
            .cloned()
            .collect::<Vec<_>>();
        assert_eq!(
            outcomes,
            vec![
                Event::DeadLettered(0, 0),
                Event::Committed(0, 0),
                Event::Committed(0, 1),
            ]
        );

        let letters = sink.letters.lock().unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].topic, "users.event");
        assert_eq!(letters[0].attempts, 2);
        assert_eq!(letters[0].reason, "cannot handle bad");
        assert_eq!(letters[0].payload, b"bad".to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_letter_failure_stops_without_commit() {
        let events = Events::default();
        let consumer = QueuedConsumer::new(&events, vec![(0, 0, "bad"), (0, 1, "good")]);
        let handler = FlakyHandler::new(&events, &[("bad", None)]);
        let sink = RecordingSink {
            fail: true,
            ..RecordingSink::new(&events)
        };

        let result = PartitionedConsumer::new(config(1, Some(1), 10), consumer, handler, sink)
            .run(CancellationToken::new())
            .await;

        assert!(matches!(
            result,
            Err(ConsumerError::DeadLetter {
                partition: 0,
                offset: 0,
                ..
            })
        ));
        assert!(committed(&events).is_empty());
        assert!(!handled(&events).contains(&"good".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_failure_is_fatal() {
        let events = Events::default();
        let consumer = QueuedConsumer {
            fail_commit: true,
            ..QueuedConsumer::new(&events, vec![(0, 0, "a")])
        };
        let handler = FlakyHandler::new(&events, &[]);
        let sink = RecordingSink::new(&events);

        let result = PartitionedConsumer::new(config(1, Some(3), 10), consumer, handler, sink)
            .run(CancellationToken::new())
            .await;

        assert!(matches!(
            result,
            Err(ConsumerError::Commit {
                partition: 0,
                offset: 0,
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_failure_is_fatal() {
        let events = Events::default();
        let consumer = QueuedConsumer::new(&events, vec![]);
        consumer
            .queue
            .lock()
            .unwrap()
            .push_back(Err(ConsumeError::Closed));
        let handler = FlakyHandler::new(&events, &[]);
        let sink = RecordingSink::new(&events);

        let result = PartitionedConsumer::new(config(1, None, 10), consumer, handler, sink)
            .run(CancellationToken::new())
            .await;

        assert!(matches!(
            result,
            Err(ConsumerError::Fetch(ConsumeError::Closed))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_partition_gets_a_lane() {
        let events = Events::default();
        let consumer = QueuedConsumer::new(&events, vec![(5, 3, "late")]);
        let handler = FlakyHandler::new(&events, &[]);
        let sink = RecordingSink::new(&events);
        let token = CancellationToken::new();

        let run = tokio::spawn(
            PartitionedConsumer::new(config(1, None, 10), consumer, handler, sink)
                .run(token.clone()),
        );
        wait_until(|| !committed(&events).is_empty()).await;
        token.cancel();
        run.await.unwrap().unwrap();

        assert_eq!(committed(&events), vec![(5, 3)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_leaves_retrying_message_uncommitted() {
        let events = Events::default();
        let consumer = QueuedConsumer::new(&events, vec![(0, 0, "stuck")]);
        let handler = FlakyHandler::new(&events, &[("stuck", None)]);
        let sink = Arc::new(RecordingSink::new(&events));
        let token = CancellationToken::new();

        let run = tokio::spawn(
            PartitionedConsumer::new(config(1, None, 60_000), consumer, handler, sink.clone())
                .run(token.clone()),
        );
        wait_until(|| !handled(&events).is_empty()).await;
        token.cancel();
        run.await.unwrap().unwrap();

        assert!(committed(&events).is_empty());
        assert!(sink.letters.lock().unwrap().is_empty());
    }
}
