//! PostgreSQL order repository.

use async_trait::async_trait;
use common::{LineItem, OrderNumber};
use sqlx::{PgPool, Row, postgres::PgRow};

use crate::{OrderError, OrderRecord, OrderRepository, OrderStatus, Result, Transition};

/// PostgreSQL-backed order repository.
#[derive(Clone)]
pub struct PostgresOrderRepository {
    pool: PgPool,
}

impl PostgresOrderRepository {
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

    fn parse_status(raw: &str) -> Result<OrderStatus> {
        raw.parse().map_err(OrderError::InvalidStatus)
    }

    fn row_to_order(row: PgRow) -> Result<OrderRecord> {
        let items: serde_json::Value = row.try_get("items")?;
        let items: Vec<LineItem> = serde_json::from_value(items)?;
        let status: String = row.try_get("status")?;

        Ok(OrderRecord {
            order_number: OrderNumber::new(row.try_get::<String, _>("order_number")?),
            items,
            status: Self::parse_status(&status)?,
            failure_reason: row.try_get("failure_reason")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl OrderRepository for PostgresOrderRepository {
    async fn save(&self, order: &OrderRecord) -> Result<()> {
        let items = serde_json::to_value(&order.items)?;

        sqlx::query(
            r#"
            INSERT INTO orders (order_number, items, status, failure_reason, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(order.order_number.as_str())
        .bind(items)
        .bind(order.status.as_str())
        .bind(&order.failure_reason)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.is_unique_violation()
            {
                return OrderError::AlreadyExists(order.order_number.clone());
            }
            OrderError::Database(e)
        })?;

        Ok(())
    }

    async fn find_by_number(&self, order_number: &OrderNumber) -> Result<Option<OrderRecord>> {
        let row = sqlx::query(
            r#"
            SELECT order_number, items, status, failure_reason, created_at, updated_at
            FROM orders
            WHERE order_number = $1
            "#,
        )
        .bind(order_number.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_order).transpose()
    }

    async fn update_status(
        &self,
        order_number: &OrderNumber,
        from: &[OrderStatus],
        to: OrderStatus,
        reason: Option<String>,
    ) -> Result<Transition> {
        let allowed: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();

        // The row lock taken by the CTE serializes concurrent updates of one order.
        let previous: Option<String> = sqlx::query_scalar(
            r#"
            WITH previous AS (
                SELECT status FROM orders WHERE order_number = $1 FOR UPDATE
            )
            UPDATE orders
            SET status = $2,
                failure_reason = COALESCE($3, orders.failure_reason),
                updated_at = now()
            FROM previous
            WHERE orders.order_number = $1 AND previous.status = ANY($4)
            RETURNING previous.status
            "#,
        )
        .bind(order_number.as_str())
        .bind(to.as_str())
        .bind(reason)
        .bind(allowed)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(previous) = previous {
            return Ok(Transition::Applied {
                from: Self::parse_status(&previous)?,
            });
        }

        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM orders WHERE order_number = $1")
                .bind(order_number.as_str())
                .fetch_optional(&self.pool)
                .await?;

        match current {
            Some(current) => Ok(Transition::Skipped {
                current: Self::parse_status(&current)?,
            }),
            None => Err(OrderError::NotFound(order_number.clone())),
        }
    }
}
