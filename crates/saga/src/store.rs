//! Saga state store contract.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::OrderNumber;

use crate::{CounterField, FlagField, Result, SagaState};

/// Shared, TTL-bounded saga progress.
///
/// Results for one order can be handled by different workers, so every
/// mutation is a single atomic operation on the store. No operation ever
/// recreates a saga that expired or was deleted; they return `None` instead.
#[async_trait]
pub trait SagaStateStore: Send + Sync {
    /// Writes a saga, replacing any previous one for the same order.
    async fn create(&self, state: &SagaState, ttl: Duration) -> Result<()>;

    async fn get(&self, order_number: &OrderNumber) -> Result<Option<SagaState>>;

    /// Adds `delta` to a counter and returns the new value.
    async fn increment(
        &self,
        order_number: &OrderNumber,
        field: CounterField,
        delta: i64,
    ) -> Result<Option<i64>>;

    /// Sets a flag. `Some(true)` only for the caller that changed it.
    async fn set_flag_if_unset(
        &self,
        order_number: &OrderNumber,
        field: FlagField,
    ) -> Result<Option<bool>>;

    /// Adds `member` to the saga's seen set. `Some(true)` when it was new.
    async fn mark_seen(&self, order_number: &OrderNumber, member: &str) -> Result<Option<bool>>;

    /// Adds `member` to the seen set and, when it was new, adds one to
    /// `field` in the same step. `Some(true)` when this call counted it.
    async fn count_once(
        &self,
        order_number: &OrderNumber,
        member: &str,
        field: CounterField,
    ) -> Result<Option<bool>>;

    async fn delete(&self, order_number: &OrderNumber) -> Result<()>;

    /// Drops expired sagas and returns how many were removed.
    async fn purge_expired(&self) -> Result<u64>;
}

#[async_trait]
impl<T> SagaStateStore for Arc<T>
where
    T: SagaStateStore + ?Sized,
{
    async fn create(&self, state: &SagaState, ttl: Duration) -> Result<()> {
        (**self).create(state, ttl).await
    }

    async fn get(&self, order_number: &OrderNumber) -> Result<Option<SagaState>> {
        (**self).get(order_number).await
    }

    async fn increment(
        &self,
        order_number: &OrderNumber,
        field: CounterField,
        delta: i64,
    ) -> Result<Option<i64>> {
        (**self).increment(order_number, field, delta).await
    }

    async fn set_flag_if_unset(
        &self,
        order_number: &OrderNumber,
        field: FlagField,
    ) -> Result<Option<bool>> {
        (**self).set_flag_if_unset(order_number, field).await
    }

    async fn mark_seen(&self, order_number: &OrderNumber, member: &str) -> Result<Option<bool>> {
        (**self).mark_seen(order_number, member).await
    }

    async fn count_once(
        &self,
        order_number: &OrderNumber,
        member: &str,
        field: CounterField,
    ) -> Result<Option<bool>> {
        (**self).count_once(order_number, member, field).await
    }

    async fn delete(&self, order_number: &OrderNumber) -> Result<()> {
        (**self).delete(order_number).await
    }

    async fn purge_expired(&self) -> Result<u64> {
        (**self).purge_expired().await
    }
}
