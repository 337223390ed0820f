//! Saga coordinator: order placement and check-result aggregation.

use std::time::Duration;

use common::{
    CheckRequest, CheckResult, InventoryAdjustment, LineItem, Message, OrderFailed, OrderNumber,
    OrderValidated,
};
use event_bus::{EventBus, EventBusExt, RetryPolicy};
use orders::{OrderRecord, OrderRepository, OrderStatus, ProductCatalog};
use serde::{Deserialize, Serialize};

use crate::{
    CounterField, DEFAULT_SAGA_TTL, FlagField, Result, SagaError, SagaState, SagaStateStore,
};

/// Items of an order to place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceOrderRequest {
    pub items: Vec<LineItem>,
}

impl PlaceOrderRequest {
    pub fn new(items: Vec<LineItem>) -> Self {
        Self { items }
    }
}

/// What handling one check result led to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    /// No saga exists for the order (expired, deleted, or never created).
    Lost,
    /// The result was already handled.
    Duplicate,
    /// More results are outstanding.
    Waiting { received: i64, total: i64 },
    /// Every line was reserved; `OrderValidated` was published.
    Validated,
    /// This result failed the order; `OrderFailed` was published.
    Failed,
    /// The order had already failed; the result only triggered cleanup.
    Discarded,
}

fn counted_marker(line: u32) -> String {
    format!("line:{line}")
}

fn handled_marker(line: u32) -> String {
    format!("line:{line}:handled")
}

fn all_handled(state: &SagaState) -> bool {
    (0..state.total_items).all(|line| state.has_seen(&handled_marker(line as u32)))
}

/// Drives the order saga: fans out one inventory check per line, then
/// aggregates the results into a single outcome.
///
/// Check results are keyed by order number, so the results of one order are
/// handled one at a time by a single worker; the store operations are atomic
/// regardless.
pub struct SagaCoordinator<R, C, S, B> {
    orders: R,
    catalog: C,
    store: S,
    bus: B,
    ttl: Duration,
    retry: RetryPolicy,
}

impl<R, C, S, B> SagaCoordinator<R, C, S, B>
where
    R: OrderRepository,
    C: ProductCatalog,
    S: SagaStateStore,
    B: EventBus,
{
    /// Creates a coordinator with the default saga TTL.
    pub fn new(orders: R, catalog: C, store: S, bus: B) -> Self {
        Self {
            orders,
            catalog,
            store,
            bus,
            ttl: DEFAULT_SAGA_TTL,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Backoff for publishing check requests while placing an order.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn orders(&self) -> &R {
        &self.orders
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Places an order and starts its saga.
    ///
    /// The order row and the saga state are written before any check request
    /// is published. Returns without waiting for the checks.
    #[tracing::instrument(skip_all, fields(items = request.items.len()))]
    pub async fn place_order(&self, request: PlaceOrderRequest) -> Result<OrderNumber> {
        if request.items.is_empty() {
            return Err(SagaError::InvalidOrder("order has no items".to_string()));
        }
        if let Some(item) = request.items.iter().find(|item| item.quantity == 0) {
            return Err(SagaError::InvalidOrder(format!(
                "quantity for {} must be positive",
                item.sku
            )));
        }

        let order_number = OrderNumber::generate();
        let items = self.price(request.items).await;

        self.orders
            .save(&OrderRecord::pending(order_number.clone(), items.clone()))
            .await?;
        self.store
            .create(&SagaState::new(order_number.clone(), items.clone()), self.ttl)
            .await?;

        for (line, item) in items.iter().enumerate() {
            let request = CheckRequest {
                order_number: order_number.clone(),
                line: line as u32,
                sku: item.sku.clone(),
                quantity: item.quantity,
            };
            if let Err(e) = self.request_check(request).await {
                self.abandon(&order_number, line, &e).await;
                return Err(e);
            }
        }

        metrics::counter!("saga_started_total").increment(1);
        tracing::info!(%order_number, lines = items.len(), "order placed");
        Ok(order_number)
    }

    /// Publishes one check request, retrying transient bus failures.
    async fn request_check(&self, request: CheckRequest) -> Result<()> {
        let message = Message::CheckRequested(request);
        let mut attempt = 1;
        loop {
            match self.bus.send(&message).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(attempt, ?delay, error = %e, "check request not published, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Fails an order whose checks could not all be requested.
    ///
    /// The saga is flagged failed, so results for lines that were requested
    /// are credited back as they arrive. Lines from `published` on were never
    /// requested and hold nothing.
    async fn abandon(&self, order_number: &OrderNumber, published: usize, cause: &SagaError) {
        let reason = format!("inventory checks could not be requested: {cause}");
        tracing::error!(%order_number, published, error = %cause, "order abandoned");
        metrics::counter!("saga_failed_total").increment(1);

        if let Err(e) = self
            .store
            .set_flag_if_unset(order_number, FlagField::Failed)
            .await
        {
            tracing::error!(%order_number, error = %e, "failed to flag abandoned saga");
        }
        if let Err(e) = self
            .orders
            .update_status(
                order_number,
                &[OrderStatus::Pending],
                OrderStatus::Failed,
                Some(reason.clone()),
            )
            .await
        {
            tracing::error!(%order_number, error = %e, "failed to mark abandoned order failed");
        }
        let failed = OrderFailed {
            order_number: order_number.clone(),
            reason,
        };
        if let Err(e) = self.bus.send(&Message::OrderFailed(failed)).await {
            tracing::warn!(%order_number, error = %e, "order failure not announced");
        }
    }

    async fn price(&self, items: Vec<LineItem>) -> Vec<LineItem> {
        let mut priced = Vec::with_capacity(items.len());
        for item in items {
            match self.catalog.get_product(&item.sku).await {
                Ok(Some(product)) => priced.push(item.with_price(product.price_cents)),
                Ok(None) => priced.push(item),
                Err(e) => {
                    tracing::warn!(sku = %item.sku, error = %e, "product lookup failed");
                    priced.push(item);
                }
            }
        }
        priced
    }

    /// Folds one check result into its saga.
    ///
    /// Each result is counted once. A result whose handling was interrupted
    /// is handled again on redelivery, so the messages it publishes may be
    /// published more than once; a result that was fully handled is dropped.
    #[tracing::instrument(
        skip_all,
        fields(order_number = %result.order_number, line = result.line, success = result.success)
    )]
    pub async fn on_check_result(&self, result: &CheckResult) -> Result<Aggregation> {
        let order_number = &result.order_number;

        let Some(counted) = self
            .store
            .count_once(
                order_number,
                &counted_marker(result.line),
                CounterField::ReceivedItems,
            )
            .await?
        else {
            return Ok(self.lost(result));
        };

        let Some(state) = self.store.get(order_number).await? else {
            return Ok(self.lost(result));
        };
        let handled = handled_marker(result.line);
        if !counted && state.has_seen(&handled) {
            tracing::info!("duplicate check result dropped");
            metrics::counter!("saga_duplicate_results_total").increment(1);
            // A finished saga whose delete was interrupted is removed here.
            if state.all_received() && all_handled(&state) {
                self.store.delete(order_number).await?;
            }
            return Ok(Aggregation::Duplicate);
        }

        let outcome = if !result.success {
            self.fail(&state, result, counted).await?
        } else if state.failed {
            self.compensate_line(&state, result.line).await?;
            Aggregation::Discarded
        } else if state.all_received() {
            let validated = OrderValidated {
                order_number: order_number.clone(),
                items: state.original_items.clone(),
            };
            self.bus.send(&Message::OrderValidated(validated)).await?;
            metrics::counter!("saga_validated_total").increment(1);
            tracing::info!(lines = state.total_items, "order validated");
            Aggregation::Validated
        } else {
            tracing::debug!(
                received = state.received_items,
                total = state.total_items,
                "waiting for more check results"
            );
            Aggregation::Waiting {
                received: state.received_items,
                total: state.total_items,
            }
        };

        match outcome {
            Aggregation::Validated => {
                self.store.mark_seen(order_number, &handled).await?;
                self.store.delete(order_number).await?;
            }
            _ if state.failed || outcome == Aggregation::Failed => {
                self.store.mark_seen(order_number, &handled).await?;
                if state.all_received() {
                    self.store.delete(order_number).await?;
                }
            }
            _ => {
                self.store.mark_seen(order_number, &handled).await?;
            }
        }
        Ok(outcome)
    }

    /// Handles a failed check. The first failure announces the order as
    /// failed and releases every other line.
    async fn fail(
        &self,
        state: &SagaState,
        result: &CheckResult,
        counted: bool,
    ) -> Result<Aggregation> {
        let order_number = &result.order_number;
        let Some(flipped) = self
            .store
            .set_flag_if_unset(order_number, FlagField::Failed)
            .await?
        else {
            return Ok(self.lost(result));
        };

        // A recount means an earlier attempt at this result was interrupted
        // and may have flipped the flag itself.
        if !flipped && counted {
            tracing::debug!("order already failed, result discarded");
            return Ok(Aggregation::Discarded);
        }

        let reason = result
            .reason
            .clone()
            .unwrap_or_else(|| format!("inventory check failed for {}", result.sku));
        let failed = OrderFailed {
            order_number: order_number.clone(),
            reason: reason.clone(),
        };
        self.bus.send(&Message::OrderFailed(failed)).await?;

        let lines = state.original_items.len() as u32;
        for line in (0..lines).filter(|line| *line != result.line) {
            self.compensate_line(state, line).await?;
        }

        if flipped {
            metrics::counter!("saga_failed_total").increment(1);
        }
        tracing::warn!(%reason, "order failed");
        Ok(Aggregation::Failed)
    }

    /// Returns whatever the ledger holds for one line of a failed order.
    async fn compensate_line(&self, state: &SagaState, line: u32) -> Result<()> {
        let Some(item) = state.original_items.get(line as usize) else {
            tracing::warn!(line, "no such line to compensate");
            return Ok(());
        };
        let adjustment = InventoryAdjustment::compensation(
            state.order_number.clone(),
            line,
            item,
            format!("compensation: order {} failed", state.order_number),
        );
        self.bus.send(&Message::InventoryAdjusted(adjustment)).await?;
        metrics::counter!("saga_compensations_total", "cause" => "order_failed").increment(1);
        tracing::debug!(line, sku = %item.sku, "line compensation requested");
        Ok(())
    }

    fn lost(&self, result: &CheckResult) -> Aggregation {
        tracing::warn!(
            order_number = %result.order_number,
            line = result.line,
            sku = %result.sku,
            "check result for unknown or expired saga dropped"
        );
        metrics::counter!("saga_lost_results_total").increment(1);
        Aggregation::Lost
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{Sku, channels};
    use event_bus::{InMemoryEventBus, TopicSpec};
    use orders::{InMemoryOrderRepository, InMemoryProductCatalog, OrderStatus, Product};

    use crate::InMemorySagaStateStore;

    type TestCoordinator = SagaCoordinator<
        InMemoryOrderRepository,
        InMemoryProductCatalog,
        InMemorySagaStateStore,
        InMemoryEventBus,
    >;

    struct TestHarness {
        coordinator: TestCoordinator,
        orders: InMemoryOrderRepository,
        catalog: InMemoryProductCatalog,
        store: InMemorySagaStateStore,
        bus: InMemoryEventBus,
    }

    impl TestHarness {
        fn new() -> Self {
            let orders = InMemoryOrderRepository::new();
            let catalog = InMemoryProductCatalog::new();
            let store = InMemorySagaStateStore::new();
            let bus = InMemoryEventBus::new(TopicSpec::all(2));
            let coordinator =
                SagaCoordinator::new(orders.clone(), catalog.clone(), store.clone(), bus.clone())
                    .with_retry(RetryPolicy::immediate(3));
            Self {
                coordinator,
                orders,
                catalog,
                store,
                bus,
            }
        }

        async fn place(&self, items: &[(&str, u32)]) -> OrderNumber {
            let items = items
                .iter()
                .map(|(sku, qty)| LineItem::new(*sku, *qty))
                .collect();
            self.coordinator
                .place_order(PlaceOrderRequest::new(items))
                .await
                .unwrap()
        }

        async fn messages(&self, topic: &str) -> Vec<Message> {
            self.bus.decoded(topic).await
        }

        async fn compensated_lines(&self) -> Vec<u32> {
            let mut lines: Vec<u32> = self
                .messages(channels::INVENTORY_ADJUSTMENT)
                .await
                .into_iter()
                .filter_map(|m| match m {
                    Message::InventoryAdjusted(adj) => adj.line,
                    _ => None,
                })
                .collect();
            lines.sort();
            lines
        }
    }

    fn result(order: &OrderNumber, line: u32, sku: &str, success: bool) -> CheckResult {
        let request = CheckRequest {
            order_number: order.clone(),
            line,
            sku: Sku::from(sku),
            quantity: 1,
        };
        if success {
            CheckResult::reserved(&request)
        } else {
            CheckResult::shortage(&request, format!("insufficient stock for {sku}"))
        }
    }

    #[tokio::test]
    async fn test_place_order_fans_out_checks() {
        let h = TestHarness::new();
        h.catalog.insert(Product::new("A", "Widget", 250)).await;

        let order = h.place(&[("A", 2), ("B", 1)]).await;

        let record = h.orders.find_by_number(&order).await.unwrap().unwrap();
        assert_eq!(record.status, OrderStatus::Pending);
        assert_eq!(record.items[0].unit_price_cents, Some(250));
        assert_eq!(record.items[1].unit_price_cents, None);

        let state = h.store.get(&order).await.unwrap().unwrap();
        assert_eq!(state.total_items, 2);
        assert_eq!(state.received_items, 0);

        let requests = h.messages(channels::INVENTORY_CHECK_REQUEST).await;
        assert_eq!(requests.len(), 2);
        for message in requests {
            let Message::CheckRequested(request) = message else {
                panic!("unexpected message");
            };
            assert_eq!(request.order_number, order);
        }
    }

    #[tokio::test]
    async fn test_invalid_orders_are_rejected() {
        let h = TestHarness::new();

        let empty = h
            .coordinator
            .place_order(PlaceOrderRequest::new(vec![]))
            .await;
        assert!(matches!(empty, Err(SagaError::InvalidOrder(_))));

        let zero = h
            .coordinator
            .place_order(PlaceOrderRequest::new(vec![LineItem::new("A", 0)]))
            .await;
        assert!(matches!(zero, Err(SagaError::InvalidOrder(_))));

        assert_eq!(h.orders.count().await, 0);
        assert_eq!(h.bus.message_count(channels::INVENTORY_CHECK_REQUEST).await, 0);
    }

    #[tokio::test]
    async fn test_all_successes_validate() {
        let h = TestHarness::new();
        let order = h.place(&[("A", 1), ("B", 1)]).await;

        let first = h
            .coordinator
            .on_check_result(&result(&order, 0, "A", true))
            .await
            .unwrap();
        assert_eq!(
            first,
            Aggregation::Waiting {
                received: 1,
                total: 2
            }
        );

        let second = h
            .coordinator
            .on_check_result(&result(&order, 1, "B", true))
            .await
            .unwrap();
        assert_eq!(second, Aggregation::Validated);
        assert!(h.store.get(&order).await.unwrap().is_none());
        assert_eq!(h.messages(channels::ORDER_VALIDATED).await.len(), 1);
    }

    #[tokio::test]
    async fn test_first_failure_wins_and_compensates_siblings() {
        let h = TestHarness::new();
        let order = h.place(&[("A", 1), ("B", 1), ("C", 1)]).await;

        h.coordinator
            .on_check_result(&result(&order, 0, "A", true))
            .await
            .unwrap();
        let failed = h
            .coordinator
            .on_check_result(&result(&order, 1, "B", false))
            .await
            .unwrap();
        assert_eq!(failed, Aggregation::Failed);
        assert_eq!(h.compensated_lines().await, vec![0, 2]);

        let late = h
            .coordinator
            .on_check_result(&result(&order, 2, "C", true))
            .await
            .unwrap();
        assert_eq!(late, Aggregation::Discarded);
        assert_eq!(h.compensated_lines().await, vec![0, 2, 2]);

        assert_eq!(h.messages(channels::ORDER_FAILED).await.len(), 1);
        assert!(h.messages(channels::ORDER_VALIDATED).await.is_empty());
        assert!(h.store.get(&order).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_second_failure_is_discarded() {
        let h = TestHarness::new();
        let order = h.place(&[("A", 1), ("B", 1), ("C", 1)]).await;

        h.coordinator
            .on_check_result(&result(&order, 0, "A", false))
            .await
            .unwrap();
        let second = h
            .coordinator
            .on_check_result(&result(&order, 1, "B", false))
            .await
            .unwrap();
        assert_eq!(second, Aggregation::Discarded);
        assert_eq!(h.messages(channels::ORDER_FAILED).await.len(), 1);

        // Not every result is in yet, so the saga stays until its TTL.
        assert!(h.store.get(&order).await.unwrap().unwrap().failed);
    }

    #[tokio::test]
    async fn test_duplicate_result_is_dropped() {
        let h = TestHarness::new();
        let order = h.place(&[("A", 1), ("B", 1)]).await;
        let success = result(&order, 0, "A", true);

        h.coordinator.on_check_result(&success).await.unwrap();
        let again = h.coordinator.on_check_result(&success).await.unwrap();
        assert_eq!(again, Aggregation::Duplicate);

        let state = h.store.get(&order).await.unwrap().unwrap();
        assert_eq!(state.received_items, 1);
        assert!(h.messages(channels::ORDER_VALIDATED).await.is_empty());
    }

    #[tokio::test]
    async fn test_result_for_unknown_saga_is_lost() {
        let h = TestHarness::new();
        let outcome = h
            .coordinator
            .on_check_result(&result(&OrderNumber::from("ghost"), 0, "A", true))
            .await
            .unwrap();
        assert_eq!(outcome, Aggregation::Lost);
        assert_eq!(h.bus.message_count(channels::INVENTORY_ADJUSTMENT).await, 0);
    }

    #[tokio::test]
    async fn test_interrupted_failure_is_announced_on_retry() {
        let h = TestHarness::new();
        let order = h.place(&[("A", 1), ("B", 1)]).await;
        let failure = result(&order, 0, "A", false);

        h.bus.fail_next_publishes(channels::ORDER_FAILED, 1).await;
        let first = h.coordinator.on_check_result(&failure).await;
        assert!(first.unwrap_err().is_transient());
        assert!(h.messages(channels::ORDER_FAILED).await.is_empty());

        let retry = h.coordinator.on_check_result(&failure).await.unwrap();
        assert_eq!(retry, Aggregation::Failed);
        assert_eq!(h.messages(channels::ORDER_FAILED).await.len(), 1);
        assert_eq!(h.store.get(&order).await.unwrap().unwrap().received_items, 1);
    }

    #[tokio::test]
    async fn test_store_outage_is_transient() {
        let h = TestHarness::new();
        let order = h.place(&[("A", 1)]).await;

        h.store.set_unavailable(true).await;
        let err = h
            .coordinator
            .on_check_result(&result(&order, 0, "A", true))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_result_counted_before_interruption_is_not_recounted() {
        let h = TestHarness::new();
        let order = h.place(&[("A", 1), ("B", 1)]).await;
        let first_line = result(&order, 0, "A", true);

        h.store.fail_next_gets(1).await;
        let err = h.coordinator.on_check_result(&first_line).await.unwrap_err();
        assert!(err.is_transient());

        let retry = h.coordinator.on_check_result(&first_line).await.unwrap();
        assert_eq!(
            retry,
            Aggregation::Waiting {
                received: 1,
                total: 2
            }
        );

        let last = h
            .coordinator
            .on_check_result(&result(&order, 1, "B", true))
            .await
            .unwrap();
        assert_eq!(last, Aggregation::Validated);
        assert_eq!(h.messages(channels::ORDER_VALIDATED).await.len(), 1);
    }

    #[tokio::test]
    async fn test_validation_is_not_repeated_after_failed_cleanup() {
        let h = TestHarness::new();
        let order = h.place(&[("A", 1)]).await;
        let success = result(&order, 0, "A", true);

        h.store.fail_next_deletes(1).await;
        let err = h.coordinator.on_check_result(&success).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(h.messages(channels::ORDER_VALIDATED).await.len(), 1);

        let retry = h.coordinator.on_check_result(&success).await.unwrap();
        assert_eq!(retry, Aggregation::Duplicate);
        assert_eq!(h.messages(channels::ORDER_VALIDATED).await.len(), 1);
        assert!(h.store.get(&order).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transient_fan_out_failure_is_retried() {
        let h = TestHarness::new();
        h.bus
            .fail_publishes_after(channels::INVENTORY_CHECK_REQUEST, 1, 2)
            .await;

        let order = h.place(&[("A", 1), ("B", 1)]).await;

        assert_eq!(h.messages(channels::INVENTORY_CHECK_REQUEST).await.len(), 2);
        assert_eq!(h.orders.status(&order).await, Some(OrderStatus::Pending));
    }

    #[tokio::test]
    async fn test_abandoned_fan_out_fails_order_and_releases_requested_lines() {
        let h = TestHarness::new();
        h.bus
            .fail_publishes_after(channels::INVENTORY_CHECK_REQUEST, 1, 10)
            .await;

        let err = h
            .coordinator
            .place_order(PlaceOrderRequest::new(vec![
                LineItem::new("A", 1),
                LineItem::new("B", 1),
                LineItem::new("C", 1),
            ]))
            .await
            .unwrap_err();
        assert!(err.is_transient());

        let requests = h.messages(channels::INVENTORY_CHECK_REQUEST).await;
        assert_eq!(requests.len(), 1);
        let Message::CheckRequested(request) = &requests[0] else {
            panic!("unexpected message");
        };
        let order = request.order_number.clone();

        assert_eq!(h.orders.status(&order).await, Some(OrderStatus::Failed));
        assert_eq!(h.messages(channels::ORDER_FAILED).await.len(), 1);
        assert!(h.store.get(&order).await.unwrap().unwrap().failed);

        // The one line that was requested is credited back once reserved.
        let late = h
            .coordinator
            .on_check_result(&result(&order, 0, "A", true))
            .await
            .unwrap();
        assert_eq!(late, Aggregation::Discarded);
        assert_eq!(h.compensated_lines().await, vec![0]);
        assert!(h.messages(channels::ORDER_VALIDATED).await.is_empty());
    }
}
