//! Shard snapshots.
//!
//! A snapshot holds a shard's full state together with the changelog
//! position it covers. Restoring loads the snapshot and replays only the
//! changelog records after that position.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use event_bus::Offset;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row, postgres::PgRow};
use tokio::sync::RwLock;

use crate::error::Result;
use crate::shard::LedgerShard;

/// A shard's state as of a changelog position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub partition: u32,
    /// Changelog offset of the first record not folded into `state`.
    pub changelog_offset: Offset,
    pub timestamp: DateTime<Utc>,
    pub state: serde_json::Value,
}

impl LedgerSnapshot {
    /// Captures a shard.
    pub fn from_shard(
        partition: u32,
        changelog_offset: Offset,
        shard: &LedgerShard,
    ) -> std::result::Result<Self, serde_json::Error> {
        Ok(Self {
            partition,
            changelog_offset,
            timestamp: Utc::now(),
            state: serde_json::to_value(shard)?,
        })
    }

    pub fn into_shard(self) -> std::result::Result<LedgerShard, serde_json::Error> {
        serde_json::from_value(self.state)
    }
}

/// Storage for the latest snapshot of each shard.
#[async_trait]
pub trait LedgerSnapshotStore: Send + Sync {
    /// Replaces the snapshot of the snapshot's partition.
    async fn save(&self, snapshot: &LedgerSnapshot) -> Result<()>;

    async fn load(&self, partition: u32) -> Result<Option<LedgerSnapshot>>;
}

#[async_trait]
impl<T> LedgerSnapshotStore for Arc<T>
where
    T: LedgerSnapshotStore + ?Sized,
{
    async fn save(&self, snapshot: &LedgerSnapshot) -> Result<()> {
        (**self).save(snapshot).await
    }

    async fn load(&self, partition: u32) -> Result<Option<LedgerSnapshot>> {
        (**self).load(partition).await
    }
}

/// In-memory snapshot store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLedgerSnapshotStore {
    snapshots: Arc<RwLock<HashMap<u32, LedgerSnapshot>>>,
}

impl InMemoryLedgerSnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerSnapshotStore for InMemoryLedgerSnapshotStore {
    async fn save(&self, snapshot: &LedgerSnapshot) -> Result<()> {
        self.snapshots
            .write()
            .await
            .insert(snapshot.partition, snapshot.clone());
        Ok(())
    }

    async fn load(&self, partition: u32) -> Result<Option<LedgerSnapshot>> {
        Ok(self.snapshots.read().await.get(&partition).cloned())
    }
}

/// PostgreSQL-backed snapshot store.
#[derive(Clone)]
pub struct PostgresLedgerSnapshotStore {
    pool: PgPool,
}

impl PostgresLedgerSnapshotStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_snapshot(row: PgRow) -> Result<LedgerSnapshot> {
        Ok(LedgerSnapshot {
            partition: row.try_get::<i32, _>("partition_id")? as u32,
            changelog_offset: Offset::new(row.try_get::<i64, _>("changelog_offset")? as u64),
            timestamp: row.try_get("taken_at")?,
            state: row.try_get("state")?,
        })
    }
}

#[async_trait]
impl LedgerSnapshotStore for PostgresLedgerSnapshotStore {
    async fn save(&self, snapshot: &LedgerSnapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ledger_snapshots (partition_id, changelog_offset, taken_at, state)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (partition_id) DO UPDATE SET
                changelog_offset = EXCLUDED.changelog_offset,
                taken_at = EXCLUDED.taken_at,
                state = EXCLUDED.state
            WHERE ledger_snapshots.changelog_offset <= EXCLUDED.changelog_offset
            "#,
        )
        .bind(snapshot.partition as i32)
        .bind(snapshot.changelog_offset.as_u64() as i64)
        .bind(snapshot.timestamp)
        .bind(&snapshot.state)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load(&self, partition: u32) -> Result<Option<LedgerSnapshot>> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT partition_id, changelog_offset, taken_at, state
            FROM ledger_snapshots
            WHERE partition_id = $1
            "#,
        )
        .bind(partition as i32)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_snapshot).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Sku;

    #[tokio::test]
    async fn test_snapshot_round_trips_a_shard() {
        let mut shard = LedgerShard::new();
        shard.initialize("A", 4);
        shard.mark_applied("product-created", Offset::new(0));

        let store = InMemoryLedgerSnapshotStore::new();
        let snapshot = LedgerSnapshot::from_shard(2, Offset::new(1), &shard).unwrap();
        store.save(&snapshot).await.unwrap();

        assert!(store.load(0).await.unwrap().is_none());
        let loaded = store.load(2).await.unwrap().unwrap();
        assert_eq!(loaded.changelog_offset, Offset::new(1));

        let restored = loaded.into_shard().unwrap();
        assert_eq!(restored.stock(&Sku::from("A")), Some(4));
        assert!(restored.is_applied("product-created", Offset::new(0)));
    }
}
