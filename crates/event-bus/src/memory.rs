use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use common::MessageId;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, RwLock, watch};

use crate::{
    BusError, Delivery, Envelope, Offset, Result,
    bus::{EventBus, TopicSpec, partition_for},
};

type GroupKey = (String, String, u32);

/// Injected failures for one topic or group: `skip` calls pass, then
/// `remaining` calls fail.
#[derive(Debug, Default, Clone, Copy)]
struct FailurePlan {
    skip: u32,
    remaining: u32,
}

impl FailurePlan {
    fn should_fail(&mut self) -> bool {
        if self.skip > 0 {
            self.skip -= 1;
            return false;
        }
        if self.remaining > 0 {
            self.remaining -= 1;
            return true;
        }
        false
    }
}

struct Inner {
    partition_counts: HashMap<String, u32>,
    logs: RwLock<HashMap<String, Vec<Vec<Envelope>>>>,
    offsets: RwLock<HashMap<GroupKey, Offset>>,
    failing_publishes: Mutex<HashMap<String, FailurePlan>>,
    failing_commits: Mutex<HashMap<String, FailurePlan>>,
    changes: watch::Sender<u64>,
}

/// In-memory event bus.
///
/// Topics are provisioned up front; the log and the consumer-group offsets
/// live for as long as any clone of the bus does, so a worker can be torn
/// down and restarted against the same log.
#[derive(Clone)]
pub struct InMemoryEventBus {
    inner: Arc<Inner>,
}

impl InMemoryEventBus {
    /// Creates a bus with the given topics.
    pub fn new(topics: impl IntoIterator<Item = TopicSpec>) -> Self {
        let mut partition_counts = HashMap::new();
        let mut logs = HashMap::new();
        for spec in topics {
            logs.insert(
                spec.name.clone(),
                vec![Vec::new(); spec.partitions as usize],
            );
            partition_counts.insert(spec.name, spec.partitions);
        }
        let (changes, _) = watch::channel(0);

        Self {
            inner: Arc::new(Inner {
                partition_counts,
                logs: RwLock::new(logs),
                offsets: RwLock::new(HashMap::new()),
                failing_publishes: Mutex::new(HashMap::new()),
                failing_commits: Mutex::new(HashMap::new()),
                changes,
            }),
        }
    }

    /// Makes the next `count` publishes to `topic` fail as unavailable.
    pub async fn fail_next_publishes(&self, topic: &str, count: u32) {
        self.fail_publishes_after(topic, 0, count).await;
    }

    /// Lets `skip` publishes to `topic` through, then fails the next `count`.
    pub async fn fail_publishes_after(&self, topic: &str, skip: u32, count: u32) {
        self.inner.failing_publishes.lock().await.insert(
            topic.to_string(),
            FailurePlan {
                skip,
                remaining: count,
            },
        );
    }

    /// Makes the next `count` offset commits of `group` fail as unavailable.
    pub async fn fail_next_commits(&self, group: &str, count: u32) {
        self.inner.failing_commits.lock().await.insert(
            group.to_string(),
            FailurePlan {
                skip: 0,
                remaining: count,
            },
        );
    }

    /// Returns every message on a topic, partition by partition.
    pub async fn messages(&self, topic: &str) -> Vec<Envelope> {
        let logs = self.inner.logs.read().await;
        logs.get(topic)
            .map(|partitions| partitions.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns every decodable message on a topic.
    pub async fn decoded<T: DeserializeOwned>(&self, topic: &str) -> Vec<T> {
        self.messages(topic)
            .await
            .iter()
            .filter_map(|envelope| envelope.decode().ok())
            .collect()
    }

    /// Returns the total number of messages on a topic.
    pub async fn message_count(&self, topic: &str) -> usize {
        self.messages(topic).await.len()
    }

    fn check_partition(&self, topic: &str, partition: u32) -> Result<()> {
        if partition >= self.partitions(topic)? {
            return Err(BusError::PartitionOutOfRange {
                topic: topic.to_string(),
                partition,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    fn partitions(&self, topic: &str) -> Result<u32> {
        self.inner
            .partition_counts
            .get(topic)
            .copied()
            .ok_or_else(|| BusError::UnknownTopic(topic.to_string()))
    }

    async fn publish(
        &self,
        topic: &str,
        key: &str,
        payload: serde_json::Value,
    ) -> Result<Delivery> {
        let partitions = self.partitions(topic)?;

        {
            let mut failing = self.inner.failing_publishes.lock().await;
            if failing.get_mut(topic).is_some_and(FailurePlan::should_fail) {
                return Err(BusError::Unavailable(format!(
                    "publish to {topic} rejected"
                )));
            }
        }

        let partition = partition_for(key, partitions);
        let delivery = {
            let mut logs = self.inner.logs.write().await;
            let log = logs
                .get_mut(topic)
                .and_then(|p| p.get_mut(partition as usize))
                .ok_or_else(|| BusError::UnknownTopic(topic.to_string()))?;

            let offset = Offset::new(log.len() as u64);
            log.push(Envelope {
                message_id: MessageId::new(),
                topic: topic.to_string(),
                key: key.to_string(),
                partition,
                offset,
                timestamp: Utc::now(),
                payload,
            });
            Delivery { partition, offset }
        };

        metrics::counter!("bus_messages_published_total", "topic" => topic.to_string())
            .increment(1);
        self.inner.changes.send_modify(|seq| *seq += 1);

        Ok(delivery)
    }

    async fn read(
        &self,
        topic: &str,
        partition: u32,
        from: Offset,
        max: usize,
    ) -> Result<Vec<Envelope>> {
        self.check_partition(topic, partition)?;
        let logs = self.inner.logs.read().await;
        let log = logs
            .get(topic)
            .and_then(|p| p.get(partition as usize))
            .ok_or_else(|| BusError::UnknownTopic(topic.to_string()))?;

        Ok(log
            .iter()
            .skip(from.as_u64() as usize)
            .take(max)
            .cloned()
            .collect())
    }

    async fn end_offset(&self, topic: &str, partition: u32) -> Result<Offset> {
        self.check_partition(topic, partition)?;
        let logs = self.inner.logs.read().await;
        let len = logs
            .get(topic)
            .and_then(|p| p.get(partition as usize))
            .map(Vec::len)
            .unwrap_or(0);
        Ok(Offset::new(len as u64))
    }

    async fn committed(&self, group: &str, topic: &str, partition: u32) -> Result<Offset> {
        self.check_partition(topic, partition)?;
        let offsets = self.inner.offsets.read().await;
        Ok(offsets
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
            .unwrap_or_default())
    }

    async fn commit(&self, group: &str, topic: &str, partition: u32, next: Offset) -> Result<()> {
        self.check_partition(topic, partition)?;
        if self
            .inner
            .failing_commits
            .lock()
            .await
            .get_mut(group)
            .is_some_and(FailurePlan::should_fail)
        {
            return Err(BusError::Unavailable(format!(
                "commit for {group} rejected"
            )));
        }
        let mut offsets = self.inner.offsets.write().await;
        let entry = offsets
            .entry((group.to_string(), topic.to_string(), partition))
            .or_default();
        // Commits never move backwards.
        if next > *entry {
            *entry = next;
        }
        Ok(())
    }

    fn changes(&self) -> watch::Receiver<u64> {
        self.inner.changes.subscribe()
    }
}
