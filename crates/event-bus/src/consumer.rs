//! Consumer groups: one long-lived worker task per partition.
//!
//! A worker owns one partition index across every topic of its group, reads
//! in offset order, and commits an offset only after the handler is done with
//! the message. A crash between handling and commit redelivers the message,
//! so handlers must tolerate duplicates.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::{BusError, Envelope, EventBus, HandlerError, Offset, Result, RetryPolicy};

const BATCH_SIZE: usize = 64;
const POLL_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Processes messages delivered to a consumer group.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Name used in logs and metrics.
    fn name(&self) -> &'static str;

    async fn handle(&self, envelope: &Envelope) -> std::result::Result<(), HandlerError>;
}

/// Process-wide stop signal for worker tasks.
#[derive(Debug, Clone)]
pub struct Shutdown {
    sender: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self { sender }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }

    /// Asks every subscribed worker to stop after its current message.
    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns the shared partition count of `topics`.
pub fn co_partitioned<B: EventBus + ?Sized>(bus: &B, topics: &[&str]) -> Result<u32> {
    let counts = topics
        .iter()
        .map(|topic| bus.partitions(topic))
        .collect::<Result<Vec<_>>>()?;

    match counts.split_first() {
        Some((first, rest)) if rest.iter().all(|c| c == first) => Ok(*first),
        Some(_) => Err(BusError::PartitionMismatch(
            topics.iter().map(|t| t.to_string()).collect(),
        )),
        None => Err(BusError::PartitionMismatch(Vec::new())),
    }
}

/// Read position of one worker over one partition index of several topics.
pub struct PartitionCursor<B> {
    bus: B,
    group: String,
    partition: u32,
    positions: Vec<(String, Offset)>,
}

impl<B: EventBus> PartitionCursor<B> {
    /// Opens a cursor at the group's committed offsets.
    pub async fn open(
        bus: B,
        group: impl Into<String>,
        topics: &[&str],
        partition: u32,
    ) -> Result<Self> {
        let group = group.into();
        let mut positions = Vec::with_capacity(topics.len());
        for topic in topics {
            let offset = bus.committed(&group, topic, partition).await?;
            positions.push((topic.to_string(), offset));
        }

        Ok(Self {
            bus,
            group,
            partition,
            positions,
        })
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Reads the next uncommitted messages of every topic.
    ///
    /// Order is preserved within a topic; topics are visited in declaration order.
    pub async fn poll(&self, max: usize) -> Result<Vec<Envelope>> {
        let mut batch = Vec::new();
        for (topic, offset) in &self.positions {
            let mut messages = self.bus.read(topic, self.partition, *offset, max).await?;
            batch.append(&mut messages);
        }
        Ok(batch)
    }

    /// Skips ahead to `offset` on `topic` if the cursor is behind it.
    ///
    /// Used when a worker restores state that already covers part of its input.
    pub fn fast_forward(&mut self, topic: &str, offset: Offset) {
        if let Some((_, position)) = self.positions.iter_mut().find(|(t, _)| t == topic)
            && offset > *position
        {
            *position = offset;
        }
    }

    /// Marks `envelope` as processed.
    pub async fn commit(&mut self, envelope: &Envelope) -> Result<()> {
        let next = envelope.offset.next();
        self.bus
            .commit(&self.group, &envelope.topic, self.partition, next)
            .await?;
        if let Some((_, offset)) = self
            .positions
            .iter_mut()
            .find(|(topic, _)| *topic == envelope.topic)
        {
            *offset = next;
        }
        Ok(())
    }
}

/// What happened to one message after all retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Processed,
    /// Permanently failed; committed so the partition can move on.
    Skipped,
    /// Transient failures exhausted the retry budget; left uncommitted.
    Exhausted,
}

impl DeliveryOutcome {
    pub fn should_commit(&self) -> bool {
        !matches!(self, DeliveryOutcome::Exhausted)
    }

    fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Processed => "processed",
            DeliveryOutcome::Skipped => "skipped",
            DeliveryOutcome::Exhausted => "exhausted",
        }
    }
}

/// Hands one message to `handler`, retrying transient failures.
pub async fn deliver<H: MessageHandler + ?Sized>(
    handler: &H,
    envelope: &Envelope,
    policy: &RetryPolicy,
) -> DeliveryOutcome {
    let mut attempt = 1;
    let outcome = loop {
        match handler.handle(envelope).await {
            Ok(()) => break DeliveryOutcome::Processed,
            Err(HandlerError::Permanent(reason)) => {
                tracing::error!(
                    handler = handler.name(),
                    topic = %envelope.topic,
                    offset = %envelope.offset,
                    %reason,
                    "message cannot be processed, skipping"
                );
                break DeliveryOutcome::Skipped;
            }
            Err(HandlerError::Transient(reason)) if attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    handler = handler.name(),
                    topic = %envelope.topic,
                    offset = %envelope.offset,
                    attempt,
                    ?delay,
                    %reason,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(HandlerError::Transient(reason)) => {
                tracing::error!(
                    handler = handler.name(),
                    topic = %envelope.topic,
                    offset = %envelope.offset,
                    attempt,
                    %reason,
                    "retries exhausted, message will be redelivered"
                );
                break DeliveryOutcome::Exhausted;
            }
        }
    };

    metrics::counter!(
        "bus_messages_handled_total",
        "handler" => handler.name(),
        "outcome" => outcome.as_str()
    )
    .increment(1);
    outcome
}

/// A running set of partition workers bound to one group and channel set.
pub struct ConsumerGroup {
    name: String,
    workers: Vec<JoinHandle<()>>,
}

impl ConsumerGroup {
    /// Spawns one worker per partition of the (co-partitioned) `topics`.
    pub fn spawn<B, H>(
        bus: B,
        group: impl Into<String>,
        topics: &[&str],
        handler: Arc<H>,
        policy: RetryPolicy,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self>
    where
        B: EventBus + Clone + 'static,
        H: MessageHandler + 'static,
    {
        let name = group.into();
        let partitions = co_partitioned(&bus, topics)?;
        let topics: Vec<String> = topics.iter().map(|t| t.to_string()).collect();

        let workers = (0..partitions)
            .map(|partition| {
                let worker = PartitionWorker {
                    bus: bus.clone(),
                    group: name.clone(),
                    topics: topics.clone(),
                    partition,
                    handler: handler.clone(),
                    policy: policy.clone(),
                };
                tokio::spawn(worker.run(shutdown.clone()))
            })
            .collect();

        tracing::info!(group = %name, partitions, ?topics, "consumer group started");
        Ok(Self { name, workers })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Waits for every worker to exit.
    pub async fn join(self) {
        for result in join_all(self.workers).await {
            if let Err(e) = result {
                tracing::error!(group = %self.name, error = %e, "worker task panicked");
            }
        }
        tracing::info!(group = %self.name, "consumer group stopped");
    }
}

struct PartitionWorker<B, H> {
    bus: B,
    group: String,
    topics: Vec<String>,
    partition: u32,
    handler: Arc<H>,
    policy: RetryPolicy,
}

impl<B, H> PartitionWorker<B, H>
where
    B: EventBus + Clone + 'static,
    H: MessageHandler + 'static,
{
    #[tracing::instrument(skip_all, fields(group = %self.group, partition = self.partition))]
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let topics: Vec<&str> = self.topics.iter().map(String::as_str).collect();
        let mut cursor =
            match PartitionCursor::open(self.bus.clone(), &self.group, &topics, self.partition)
                .await
            {
                Ok(cursor) => cursor,
                Err(e) => {
                    tracing::error!(error = %e, "failed to open partition cursor");
                    return;
                }
            };
        let mut changes = self.bus.changes();

        while !*shutdown.borrow() {
            changes.borrow_and_update();

            let batch = match cursor.poll(BATCH_SIZE).await {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::warn!(error = %e, "poll failed");
                    tokio::time::sleep(POLL_ERROR_BACKOFF).await;
                    continue;
                }
            };

            if batch.is_empty() {
                tokio::select! {
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    stopped = shutdown.changed() => {
                        if stopped.is_err() {
                            break;
                        }
                    }
                }
                continue;
            }

            for envelope in &batch {
                if *shutdown.borrow() {
                    break;
                }
                let outcome = deliver(self.handler.as_ref(), envelope, &self.policy).await;
                if !outcome.should_commit() {
                    // Re-poll from the uncommitted message after a pause.
                    tokio::time::sleep(self.policy.max_delay).await;
                    break;
                }
                if let Err(e) = cursor.commit(envelope).await {
                    tracing::warn!(error = %e, offset = %envelope.offset, "commit failed");
                    break;
                }
            }
        }

        tracing::debug!("partition worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::{InMemoryEventBus, TopicSpec};
    use tokio::sync::Mutex;

    struct Recording {
        seen: Mutex<Vec<serde_json::Value>>,
        transient_failures: AtomicU32,
    }

    impl Recording {
        fn new(transient_failures: u32) -> Self {
            Self {
                seen: Mutex::new(Vec::new()),
                transient_failures: AtomicU32::new(transient_failures),
            }
        }
    }

    #[async_trait]
    impl MessageHandler for Recording {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn handle(&self, envelope: &Envelope) -> std::result::Result<(), HandlerError> {
            if envelope.payload == serde_json::json!("poison") {
                return Err(HandlerError::Permanent("poison".into()));
            }
            if self
                .transient_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(HandlerError::Transient("flaky".into()));
            }
            self.seen.lock().await.push(envelope.payload.clone());
            Ok(())
        }
    }

    fn envelope(payload: serde_json::Value) -> Envelope {
        Envelope {
            message_id: common::MessageId::new(),
            topic: "t".into(),
            key: "k".into(),
            partition: 0,
            offset: Offset::zero(),
            timestamp: chrono::Utc::now(),
            payload,
        }
    }

    #[tokio::test]
    async fn test_deliver_retries_transient_failures() {
        let handler = Recording::new(2);
        let outcome = deliver(
            &handler,
            &envelope(serde_json::json!(1)),
            &RetryPolicy::immediate(3),
        )
        .await;
        assert_eq!(outcome, DeliveryOutcome::Processed);
        assert_eq!(handler.seen.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_deliver_gives_up_after_budget() {
        let handler = Recording::new(5);
        let outcome = deliver(
            &handler,
            &envelope(serde_json::json!(1)),
            &RetryPolicy::immediate(3),
        )
        .await;
        assert_eq!(outcome, DeliveryOutcome::Exhausted);
        assert!(!outcome.should_commit());
    }

    #[tokio::test]
    async fn test_deliver_skips_permanent_failures() {
        let handler = Recording::new(0);
        let outcome = deliver(
            &handler,
            &envelope(serde_json::json!("poison")),
            &RetryPolicy::immediate(3),
        )
        .await;
        assert_eq!(outcome, DeliveryOutcome::Skipped);
        assert!(outcome.should_commit());
    }

    #[test]
    fn test_co_partitioned_requires_equal_counts() {
        let bus = InMemoryEventBus::new([
            TopicSpec::new("a", 4),
            TopicSpec::new("b", 4),
            TopicSpec::new("c", 2),
        ]);
        assert_eq!(co_partitioned(&bus, &["a", "b"]).unwrap(), 4);
        assert!(matches!(
            co_partitioned(&bus, &["a", "c"]),
            Err(BusError::PartitionMismatch(_))
        ));
        assert!(matches!(
            co_partitioned(&bus, &["a", "zzz"]),
            Err(BusError::UnknownTopic(_))
        ));
    }

    #[tokio::test]
    async fn test_cursor_resumes_from_commit() {
        let bus = InMemoryEventBus::new([TopicSpec::new("t", 1)]);
        for i in 0..3 {
            bus.publish("t", "k", serde_json::json!(i)).await.unwrap();
        }

        let mut cursor = PartitionCursor::open(bus.clone(), "g", &["t"], 0).await.unwrap();
        let batch = cursor.poll(10).await.unwrap();
        assert_eq!(batch.len(), 3);
        cursor.commit(&batch[0]).await.unwrap();

        let reopened = PartitionCursor::open(bus.clone(), "g", &["t"], 0).await.unwrap();
        let batch = reopened.poll(10).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].payload, serde_json::json!(1));
    }

    #[tokio::test]
    async fn test_group_consumes_until_shutdown() {
        let bus = InMemoryEventBus::new([TopicSpec::new("t", 2)]);
        let handler = Arc::new(Recording::new(1));
        let shutdown = Shutdown::new();

        let group = ConsumerGroup::spawn(
            bus.clone(),
            "g",
            &["t"],
            handler.clone(),
            RetryPolicy::immediate(3),
            shutdown.subscribe(),
        )
        .unwrap();
        assert_eq!(group.worker_count(), 2);

        bus.publish("t", "a", serde_json::json!("poison")).await.unwrap();
        for i in 0..4 {
            bus.publish("t", &format!("k{i}"), serde_json::json!(i)).await.unwrap();
        }

        for _ in 0..100 {
            if handler.seen.lock().await.len() == 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(handler.seen.lock().await.len(), 4);

        shutdown.trigger();
        group.join().await;
    }
}
