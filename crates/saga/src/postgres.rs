//! PostgreSQL saga state store.
//!
//! Each operation is one statement. Rows past `expires_at` are treated as
//! absent by every query and removed by [`SagaStateStore::purge_expired`].

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use common::{LineItem, OrderNumber};
use sqlx::{PgPool, Row, postgres::PgRow};

use crate::{CounterField, FlagField, Result, SagaState, SagaStateStore, state::saga_key};

/// PostgreSQL-backed saga state store.
#[derive(Clone)]
pub struct PostgresSagaStateStore {
    pool: PgPool,
}

impl PostgresSagaStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_state(row: PgRow) -> Result<SagaState> {
        let items: serde_json::Value = row.try_get("original_items")?;
        let original_items: Vec<LineItem> = serde_json::from_value(items)?;
        let seen: Vec<String> = row.try_get("seen")?;

        Ok(SagaState {
            order_number: OrderNumber::new(row.try_get::<String, _>("order_number")?),
            total_items: row.try_get("total_items")?,
            received_items: row.try_get("received_items")?,
            failed: row.try_get("failed")?,
            original_items,
            seen: seen.into_iter().collect::<BTreeSet<_>>(),
        })
    }
}

#[async_trait]
impl SagaStateStore for PostgresSagaStateStore {
    async fn create(&self, state: &SagaState, ttl: Duration) -> Result<()> {
        let items = serde_json::to_value(&state.original_items)?;
        let seen: Vec<String> = state.seen.iter().cloned().collect();

        sqlx::query(
            r#"
            INSERT INTO saga_state
                (saga_key, order_number, total_items, received_items, failed, original_items, seen, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, now() + make_interval(secs => $8))
            ON CONFLICT (saga_key) DO UPDATE SET
                order_number = EXCLUDED.order_number,
                total_items = EXCLUDED.total_items,
                received_items = EXCLUDED.received_items,
                failed = EXCLUDED.failed,
                original_items = EXCLUDED.original_items,
                seen = EXCLUDED.seen,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(state.key())
        .bind(state.order_number.as_str())
        .bind(state.total_items)
        .bind(state.received_items)
        .bind(state.failed)
        .bind(items)
        .bind(seen)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, order_number: &OrderNumber) -> Result<Option<SagaState>> {
        let row = sqlx::query(
            r#"
            SELECT order_number, total_items, received_items, failed, original_items, seen
            FROM saga_state
            WHERE saga_key = $1 AND expires_at > now()
            "#,
        )
        .bind(saga_key(order_number))
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_state).transpose()
    }

    async fn increment(
        &self,
        order_number: &OrderNumber,
        field: CounterField,
        delta: i64,
    ) -> Result<Option<i64>> {
        let sql = match field {
            CounterField::ReceivedItems => {
                r#"
                UPDATE saga_state
                SET received_items = received_items + $2
                WHERE saga_key = $1 AND expires_at > now()
                RETURNING received_items
                "#
            }
        };

        let value: Option<i64> = sqlx::query_scalar(sql)
            .bind(saga_key(order_number))
            .bind(delta)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn set_flag_if_unset(
        &self,
        order_number: &OrderNumber,
        field: FlagField,
    ) -> Result<Option<bool>> {
        // Row lock in `current` makes concurrent callers see each other's writes.
        let sql = match field {
            FlagField::Failed => {
                r#"
                WITH current AS (
                    SELECT failed FROM saga_state
                    WHERE saga_key = $1 AND expires_at > now()
                    FOR UPDATE
                ), flipped AS (
                    UPDATE saga_state SET failed = TRUE
                    FROM current
                    WHERE saga_state.saga_key = $1 AND NOT current.failed
                    RETURNING saga_state.saga_key
                )
                SELECT EXISTS (SELECT 1 FROM flipped) FROM current
                "#
            }
        };

        let flipped: Option<bool> = sqlx::query_scalar(sql)
            .bind(saga_key(order_number))
            .fetch_optional(&self.pool)
            .await?;
        Ok(flipped)
    }

    async fn mark_seen(&self, order_number: &OrderNumber, member: &str) -> Result<Option<bool>> {
        let added: Option<bool> = sqlx::query_scalar(
            r#"
            WITH current AS (
                SELECT seen FROM saga_state
                WHERE saga_key = $1 AND expires_at > now()
                FOR UPDATE
            ), added AS (
                UPDATE saga_state SET seen = array_append(saga_state.seen, $2)
                FROM current
                WHERE saga_state.saga_key = $1 AND NOT ($2 = ANY (current.seen))
                RETURNING saga_state.saga_key
            )
            SELECT EXISTS (SELECT 1 FROM added) FROM current
            "#,
        )
        .bind(saga_key(order_number))
        .bind(member)
        .fetch_optional(&self.pool)
        .await?;
        Ok(added)
    }

    async fn count_once(
        &self,
        order_number: &OrderNumber,
        member: &str,
        field: CounterField,
    ) -> Result<Option<bool>> {
        let sql = match field {
            CounterField::ReceivedItems => {
                r#"
                WITH current AS (
                    SELECT seen FROM saga_state
                    WHERE saga_key = $1 AND expires_at > now()
                    FOR UPDATE
                ), counted AS (
                    UPDATE saga_state SET
                        seen = array_append(saga_state.seen, $2),
                        received_items = saga_state.received_items + 1
                    FROM current
                    WHERE saga_state.saga_key = $1 AND NOT ($2 = ANY (current.seen))
                    RETURNING saga_state.saga_key
                )
                SELECT EXISTS (SELECT 1 FROM counted) FROM current
                "#
            }
        };

        let counted: Option<bool> = sqlx::query_scalar(sql)
            .bind(saga_key(order_number))
            .bind(member)
            .fetch_optional(&self.pool)
            .await?;
        Ok(counted)
    }

    async fn delete(&self, order_number: &OrderNumber) -> Result<()> {
        sqlx::query("DELETE FROM saga_state WHERE saga_key = $1")
            .bind(saga_key(order_number))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM saga_state WHERE expires_at <= now()")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
