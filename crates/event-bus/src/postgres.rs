//! PostgreSQL-backed event bus.
//!
//! Every partition is a row in `bus_partitions` holding the next offset to
//! assign; publishing bumps that row and inserts the message in the same
//! transaction, so offsets are dense and ordered per partition. Publishes
//! also `NOTIFY` on [`NOTIFY_CHANNEL`], which wakes consumers running in
//! other processes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::MessageId;
use sqlx::postgres::{PgListener, PgRow};
use sqlx::{PgPool, Row};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::{
    BusError, Delivery, Envelope, Offset, Result,
    bus::{EventBus, TopicSpec, partition_for},
};

/// Postgres channel that carries publish notifications.
pub const NOTIFY_CHANNEL: &str = "bus_messages";

const LISTEN_RETRY_DELAY: Duration = Duration::from_secs(1);

struct Inner {
    pool: PgPool,
    partition_counts: HashMap<String, u32>,
    changes: Arc<watch::Sender<u64>>,
    listener: JoinHandle<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

/// Event bus stored in PostgreSQL.
///
/// Clones share one pool and one notification listener.
#[derive(Clone)]
pub struct PostgresEventBus {
    inner: Arc<Inner>,
}

impl PostgresEventBus {
    /// Provisions the topics' partitions and starts listening for publishes.
    ///
    /// Partitions that already exist keep their offsets.
    pub async fn connect(pool: PgPool, topics: impl IntoIterator<Item = TopicSpec>) -> Result<Self> {
        let mut partition_counts = HashMap::new();
        for spec in topics {
            for partition in 0..spec.partitions {
                sqlx::query(
                    r#"
                    INSERT INTO bus_partitions (topic, partition_id, next_offset)
                    VALUES ($1, $2, 0)
                    ON CONFLICT (topic, partition_id) DO NOTHING
                    "#,
                )
                .bind(&spec.name)
                .bind(partition as i32)
                .execute(&pool)
                .await?;
            }
            partition_counts.insert(spec.name, spec.partitions);
        }

        let (sender, _) = watch::channel(0);
        let changes = Arc::new(sender);
        let listener = tokio::spawn(listen(pool.clone(), changes.clone()));

        Ok(Self {
            inner: Arc::new(Inner {
                pool,
                partition_counts,
                changes,
                listener,
            }),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.inner.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(pool: &PgPool) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(pool).await
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

    fn row_to_envelope(row: PgRow) -> Result<Envelope> {
        Ok(Envelope {
            message_id: MessageId::from_uuid(row.try_get::<Uuid, _>("message_id")?),
            topic: row.try_get("topic")?,
            key: row.try_get("message_key")?,
            partition: row.try_get::<i32, _>("partition_id")? as u32,
            offset: Offset::new(row.try_get::<i64, _>("offset_id")? as u64),
            timestamp: row.try_get::<DateTime<Utc>, _>("published_at")?,
            payload: row.try_get("payload")?,
        })
    }
}

/// Forwards publish notifications into the change counter, reconnecting
/// after failures.
async fn listen(pool: PgPool, changes: Arc<watch::Sender<u64>>) {
    loop {
        let mut listener = match PgListener::connect_with(&pool).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::warn!(error = %e, "bus listener cannot connect");
                tokio::time::sleep(LISTEN_RETRY_DELAY).await;
                continue;
            }
        };
        if let Err(e) = listener.listen(NOTIFY_CHANNEL).await {
            tracing::warn!(error = %e, "bus listener cannot subscribe");
            tokio::time::sleep(LISTEN_RETRY_DELAY).await;
            continue;
        }
        tracing::debug!(channel = NOTIFY_CHANNEL, "bus listener subscribed");
        // Anything published while disconnected is picked up by this tick.
        changes.send_modify(|seq| *seq += 1);

        loop {
            match listener.recv().await {
                Ok(_) => changes.send_modify(|seq| *seq += 1),
                Err(e) => {
                    tracing::warn!(error = %e, "bus listener lost its connection");
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl EventBus for PostgresEventBus {
    fn partitions(&self, topic: &str) -> Result<u32> {
        self.inner
            .partition_counts
            .get(topic)
            .copied()
            .ok_or_else(|| BusError::UnknownTopic(topic.to_string()))
    }

    #[tracing::instrument(skip(self, payload))]
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        payload: serde_json::Value,
    ) -> Result<Delivery> {
        let partition = partition_for(key, self.partitions(topic)?);

        let mut tx = self.inner.pool.begin().await?;

        // The row lock serializes publishers of one partition.
        let next: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE bus_partitions SET next_offset = next_offset + 1
            WHERE topic = $1 AND partition_id = $2
            RETURNING next_offset
            "#,
        )
        .bind(topic)
        .bind(partition as i32)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(next) = next else {
            return Err(BusError::UnknownTopic(topic.to_string()));
        };
        let offset = next - 1;

        sqlx::query(
            r#"
            INSERT INTO bus_messages
                (topic, partition_id, offset_id, message_id, message_key, payload, published_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(topic)
        .bind(partition as i32)
        .bind(offset)
        .bind(MessageId::new().as_uuid())
        .bind(key)
        .bind(&payload)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(NOTIFY_CHANNEL)
            .bind(topic)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        metrics::counter!("bus_messages_published_total", "topic" => topic.to_string())
            .increment(1);
        self.inner.changes.send_modify(|seq| *seq += 1);

        Ok(Delivery {
            partition,
            offset: Offset::new(offset as u64),
        })
    }

    async fn read(
        &self,
        topic: &str,
        partition: u32,
        from: Offset,
        max: usize,
    ) -> Result<Vec<Envelope>> {
        self.check_partition(topic, partition)?;
        let rows = sqlx::query(
            r#"
            SELECT topic, partition_id, offset_id, message_id, message_key, payload, published_at
            FROM bus_messages
            WHERE topic = $1 AND partition_id = $2 AND offset_id >= $3
            ORDER BY offset_id ASC
            LIMIT $4
            "#,
        )
        .bind(topic)
        .bind(partition as i32)
        .bind(from.as_u64() as i64)
        .bind(max as i64)
        .fetch_all(&self.inner.pool)
        .await?;

        rows.into_iter().map(Self::row_to_envelope).collect()
    }

    async fn end_offset(&self, topic: &str, partition: u32) -> Result<Offset> {
        self.check_partition(topic, partition)?;
        let next: Option<i64> = sqlx::query_scalar(
            "SELECT next_offset FROM bus_partitions WHERE topic = $1 AND partition_id = $2",
        )
        .bind(topic)
        .bind(partition as i32)
        .fetch_optional(&self.inner.pool)
        .await?;
        Ok(Offset::new(next.unwrap_or(0) as u64))
    }

    async fn committed(&self, group: &str, topic: &str, partition: u32) -> Result<Offset> {
        self.check_partition(topic, partition)?;
        let next: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT next_offset FROM bus_consumer_offsets
            WHERE group_name = $1 AND topic = $2 AND partition_id = $3
            "#,
        )
        .bind(group)
        .bind(topic)
        .bind(partition as i32)
        .fetch_optional(&self.inner.pool)
        .await?;
        Ok(Offset::new(next.unwrap_or(0) as u64))
    }

    async fn commit(&self, group: &str, topic: &str, partition: u32, next: Offset) -> Result<()> {
        self.check_partition(topic, partition)?;
        // Commits never move backwards.
        sqlx::query(
            r#"
            INSERT INTO bus_consumer_offsets (group_name, topic, partition_id, next_offset)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (group_name, topic, partition_id) DO UPDATE SET
                next_offset = GREATEST(bus_consumer_offsets.next_offset, EXCLUDED.next_offset)
            "#,
        )
        .bind(group)
        .bind(topic)
        .bind(partition as i32)
        .bind(next.as_u64() as i64)
        .execute(&self.inner.pool)
        .await?;
        Ok(())
    }

    fn changes(&self) -> watch::Receiver<u64> {
        self.inner.changes.subscribe()
    }
}
