//! Order persistence trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use common::OrderNumber;
use tokio::sync::RwLock;

use crate::{OrderError, OrderRecord, OrderStatus, Result, Transition};

/// Stores orders and applies conditional status changes.
#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Saves a new order. Fails if the number is already taken.
    async fn save(&self, order: &OrderRecord) -> Result<()>;

    async fn find_by_number(&self, order_number: &OrderNumber) -> Result<Option<OrderRecord>>;

    /// Moves the order to `to` if it is currently in one of `from`.
    ///
    /// The check and the write are a single atomic step per order. `reason`
    /// replaces the stored failure reason when given.
    async fn update_status(
        &self,
        order_number: &OrderNumber,
        from: &[OrderStatus],
        to: OrderStatus,
        reason: Option<String>,
    ) -> Result<Transition>;
}

#[async_trait]
impl<T> OrderRepository for Arc<T>
where
    T: OrderRepository + ?Sized,
{
    async fn save(&self, order: &OrderRecord) -> Result<()> {
        (**self).save(order).await
    }

    async fn find_by_number(&self, order_number: &OrderNumber) -> Result<Option<OrderRecord>> {
        (**self).find_by_number(order_number).await
    }

    async fn update_status(
        &self,
        order_number: &OrderNumber,
        from: &[OrderStatus],
        to: OrderStatus,
        reason: Option<String>,
    ) -> Result<Transition> {
        (**self).update_status(order_number, from, to, reason).await
    }
}

#[derive(Debug, Default)]
struct InMemoryOrderState {
    orders: HashMap<OrderNumber, OrderRecord>,
    fail_on_save: bool,
    fail_on_update: bool,
}

/// In-memory order repository.
#[derive(Debug, Clone, Default)]
pub struct InMemoryOrderRepository {
    state: Arc<RwLock<InMemoryOrderState>>,
}

impl InMemoryOrderRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every save fail as unavailable until reset.
    pub async fn set_fail_on_save(&self, fail: bool) {
        self.state.write().await.fail_on_save = fail;
    }

    /// Makes every status update fail as unavailable until reset.
    pub async fn set_fail_on_update(&self, fail: bool) {
        self.state.write().await.fail_on_update = fail;
    }

    pub async fn count(&self) -> usize {
        self.state.read().await.orders.len()
    }

    /// Current status of an order, if it exists.
    pub async fn status(&self, order_number: &OrderNumber) -> Option<OrderStatus> {
        self.state
            .read()
            .await
            .orders
            .get(order_number)
            .map(|order| order.status)
    }
}

#[async_trait]
impl OrderRepository for InMemoryOrderRepository {
    async fn save(&self, order: &OrderRecord) -> Result<()> {
        let mut state = self.state.write().await;
        if state.fail_on_save {
            return Err(OrderError::Unavailable("injected save failure".into()));
        }
        if state.orders.contains_key(&order.order_number) {
            return Err(OrderError::AlreadyExists(order.order_number.clone()));
        }
        state
            .orders
            .insert(order.order_number.clone(), order.clone());
        Ok(())
    }

    async fn find_by_number(&self, order_number: &OrderNumber) -> Result<Option<OrderRecord>> {
        Ok(self.state.read().await.orders.get(order_number).cloned())
    }

    async fn update_status(
        &self,
        order_number: &OrderNumber,
        from: &[OrderStatus],
        to: OrderStatus,
        reason: Option<String>,
    ) -> Result<Transition> {
        let mut state = self.state.write().await;
        if state.fail_on_update {
            return Err(OrderError::Unavailable("injected update failure".into()));
        }
        let order = state
            .orders
            .get_mut(order_number)
            .ok_or_else(|| OrderError::NotFound(order_number.clone()))?;

        if !from.contains(&order.status) {
            return Ok(Transition::Skipped {
                current: order.status,
            });
        }

        let previous = order.status;
        order.status = to;
        if reason.is_some() {
            order.failure_reason = reason;
        }
        order.updated_at = Utc::now();
        Ok(Transition::Applied { from: previous })
    }
}
