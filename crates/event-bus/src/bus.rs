use std::sync::Arc;

use async_trait::async_trait;
use common::{Message, channels};
use tokio::sync::watch;

use crate::{Delivery, Envelope, Offset, Result};

/// Declaration of a topic and how many partitions it has.
#[derive(Debug, Clone)]
pub struct TopicSpec {
    pub name: String,
    pub partitions: u32,
}

impl TopicSpec {
    pub fn new(name: impl Into<String>, partitions: u32) -> Self {
        Self {
            name: name.into(),
            partitions: partitions.max(1),
        }
    }

    /// Every channel of the system, all with the same partition count.
    pub fn all(partitions: u32) -> Vec<TopicSpec> {
        channels::ALL
            .iter()
            .map(|name| TopicSpec::new(*name, partitions))
            .collect()
    }
}

/// Maps a key onto one of `partitions` partitions.
///
/// FNV-1a over the key bytes: stable across processes and builds, so every
/// producer agrees on where a key lives.
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;

    let hash = key.bytes().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(byte)).wrapping_mul(PRIME)
    });
    hash % partitions.max(1)
}

/// A durable, partitioned publish/subscribe log.
///
/// Messages with the same key land on the same partition and are read back
/// in publish order. No ordering holds across partitions.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Returns the partition count of a declared topic.
    fn partitions(&self, topic: &str) -> Result<u32>;

    /// Appends a payload to the partition owning `key`.
    async fn publish(&self, topic: &str, key: &str, payload: serde_json::Value)
    -> Result<Delivery>;

    /// Reads up to `max` messages starting at `from`, in offset order.
    async fn read(
        &self,
        topic: &str,
        partition: u32,
        from: Offset,
        max: usize,
    ) -> Result<Vec<Envelope>>;

    /// Returns the offset the next published message will get.
    async fn end_offset(&self, topic: &str, partition: u32) -> Result<Offset>;

    /// Returns the next offset a consumer group should read.
    ///
    /// A group that never committed starts at zero.
    async fn committed(&self, group: &str, topic: &str, partition: u32) -> Result<Offset>;

    /// Records that `group` has processed everything before `next`.
    async fn commit(&self, group: &str, topic: &str, partition: u32, next: Offset) -> Result<()>;

    /// A receiver that changes whenever anything is published.
    fn changes(&self) -> watch::Receiver<u64>;
}

#[async_trait]
impl<T> EventBus for Arc<T>
where
    T: EventBus + ?Sized,
{
    fn partitions(&self, topic: &str) -> Result<u32> {
        (**self).partitions(topic)
    }

    async fn publish(
        &self,
        topic: &str,
        key: &str,
        payload: serde_json::Value,
    ) -> Result<Delivery> {
        (**self).publish(topic, key, payload).await
    }

    async fn read(
        &self,
        topic: &str,
        partition: u32,
        from: Offset,
        max: usize,
    ) -> Result<Vec<Envelope>> {
        (**self).read(topic, partition, from, max).await
    }

    async fn end_offset(&self, topic: &str, partition: u32) -> Result<Offset> {
        (**self).end_offset(topic, partition).await
    }

    async fn committed(&self, group: &str, topic: &str, partition: u32) -> Result<Offset> {
        (**self).committed(group, topic, partition).await
    }

    async fn commit(&self, group: &str, topic: &str, partition: u32, next: Offset) -> Result<()> {
        (**self).commit(group, topic, partition, next).await
    }

    fn changes(&self) -> watch::Receiver<u64> {
        (**self).changes()
    }
}

/// Extension trait providing typed publishing.
#[async_trait]
pub trait EventBusExt: EventBus {
    /// Publishes a message on its own channel, keyed by its own partition key.
    async fn send(&self, message: &Message) -> Result<Delivery> {
        let payload = serde_json::to_value(message)?;
        let delivery = self
            .publish(message.channel(), message.key(), payload)
            .await?;
        tracing::debug!(
            channel = message.channel(),
            kind = message.kind(),
            key = message.key(),
            partition = delivery.partition,
            offset = %delivery.offset,
            "message published"
        );
        Ok(delivery)
    }
}

impl<T: EventBus + ?Sized> EventBusExt for T {}
