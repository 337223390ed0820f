//! End-to-end tests: ledger, coordinator, projector and compensation wired
//! together over the in-memory bus.

use std::sync::Arc;
use std::time::Duration;

use common::{
    CheckResult, LineItem, Message, OrderNumber, PaymentFailed, PaymentProcessed, Sku, channels,
};
use event_bus::{ConsumerGroup, EventBusExt, InMemoryEventBus, RetryPolicy, Shutdown, TopicSpec};
use inventory::{InventoryLedger, LedgerConfig};
use orders::{
    InMemoryOrderRepository, InMemoryProductCatalog, OrderRepository, OrderStatus,
    OrderStatusProjector, PROJECTOR_CHANNELS, PROJECTOR_GROUP,
};
use saga::{
    COMPENSATION_CHANNELS, COMPENSATION_GROUP, COORDINATOR_CHANNELS, COORDINATOR_GROUP,
    CheckResultHandler, CompensationHandler, InMemorySagaStateStore, PaymentFailedHandler,
    PlaceOrderRequest, SagaCoordinator, SagaStateStore,
};

type TestCoordinator = SagaCoordinator<
    InMemoryOrderRepository,
    InMemoryProductCatalog,
    InMemorySagaStateStore,
    InMemoryEventBus,
>;

struct TestHarness {
    bus: InMemoryEventBus,
    shutdown: Shutdown,
    ledger: InventoryLedger<InMemoryEventBus>,
    orders: InMemoryOrderRepository,
    store: InMemorySagaStateStore,
    coordinator: Arc<TestCoordinator>,
    groups: Vec<ConsumerGroup>,
}

impl TestHarness {
    async fn new() -> Self {
        Self::with_ttl(saga::DEFAULT_SAGA_TTL).await
    }

    async fn with_ttl(ttl: Duration) -> Self {
        let bus = InMemoryEventBus::new(TopicSpec::all(4));
        let shutdown = Shutdown::new();
        let retry = RetryPolicy::immediate(5);

        let ledger = InventoryLedger::start(
            bus.clone(),
            LedgerConfig {
                retry: retry.clone(),
                ..LedgerConfig::default()
            },
            shutdown.subscribe(),
        )
        .await
        .unwrap();

        let orders = InMemoryOrderRepository::new();
        let store = InMemorySagaStateStore::new();
        let coordinator = Arc::new(
            SagaCoordinator::new(
                orders.clone(),
                InMemoryProductCatalog::new(),
                store.clone(),
                bus.clone(),
            )
            .with_ttl(ttl),
        );

        let groups = vec![
            ConsumerGroup::spawn(
                bus.clone(),
                COORDINATOR_GROUP,
                &COORDINATOR_CHANNELS,
                Arc::new(CheckResultHandler::new(coordinator.clone())),
                retry.clone(),
                shutdown.subscribe(),
            )
            .unwrap(),
            ConsumerGroup::spawn(
                bus.clone(),
                PROJECTOR_GROUP,
                &PROJECTOR_CHANNELS,
                Arc::new(OrderStatusProjector::new(orders.clone())),
                retry.clone(),
                shutdown.subscribe(),
            )
            .unwrap(),
            ConsumerGroup::spawn(
                bus.clone(),
                COMPENSATION_GROUP,
                &COMPENSATION_CHANNELS,
                Arc::new(PaymentFailedHandler::new(CompensationHandler::new(
                    orders.clone(),
                    bus.clone(),
                ))),
                retry,
                shutdown.subscribe(),
            )
            .unwrap(),
        ];

        Self {
            bus,
            shutdown,
            ledger,
            orders,
            store,
            coordinator,
            groups,
        }
    }

    async fn stop(self) {
        self.shutdown.trigger();
        for group in self.groups {
            group.join().await;
        }
        self.ledger.join().await;
    }

    async fn stock(&self, sku: &str, quantity: i64) {
        self.ledger.initialize(sku, quantity).await.unwrap();
        self.wait_for_stock(sku, quantity).await;
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

    async fn wait_for_status(&self, order: &OrderNumber, status: OrderStatus) {
        eventually(|| async { self.orders.status(order).await == Some(status) }).await;
    }

    async fn wait_for_stock(&self, sku: &str, expected: i64) {
        let sku = Sku::from(sku);
        eventually(|| async { self.ledger.stock(&sku).await.unwrap() == Some(expected) }).await;
    }

    async fn wait_for_saga_gone(&self, order: &OrderNumber) {
        eventually(|| async { self.store.get(order).await.unwrap().is_none() }).await;
    }

    async fn count(&self, topic: &str) -> usize {
        self.bus.message_count(topic).await
    }
}

async fn eventually<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..300 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

#[tokio::test]
async fn test_single_item_order_is_validated() {
    let h = TestHarness::new().await;
    h.stock("C", 10).await;

    let order = h.place(&[("C", 1)]).await;

    h.wait_for_status(&order, OrderStatus::Validated).await;
    h.wait_for_stock("C", 9).await;
    h.wait_for_saga_gone(&order).await;
    assert_eq!(h.count(channels::ORDER_VALIDATED).await, 1);
    assert_eq!(h.count(channels::ORDER_FAILED).await, 0);

    h.stop().await;
}

#[tokio::test]
async fn test_shortage_fails_order_and_restores_siblings() {
    let h = TestHarness::new().await;
    h.stock("A", 1).await;
    h.stock("B", 5).await;

    let order = h.place(&[("A", 2), ("B", 1)]).await;

    h.wait_for_status(&order, OrderStatus::Failed).await;
    h.wait_for_saga_gone(&order).await;
    h.wait_for_stock("A", 1).await;
    h.wait_for_stock("B", 5).await;

    let record = h.orders.find_by_number(&order).await.unwrap().unwrap();
    assert_eq!(
        record.failure_reason.as_deref(),
        Some("insufficient stock for A (need 2, have 1)")
    );
    assert_eq!(h.count(channels::ORDER_FAILED).await, 1);
    assert_eq!(h.count(channels::ORDER_VALIDATED).await, 0);

    h.stop().await;
}

#[tokio::test]
async fn test_stock_never_oversold() {
    let h = TestHarness::new().await;
    h.stock("HOT", 5).await;

    let mut placed = Vec::new();
    for _ in 0..10 {
        placed.push(h.place(&[("HOT", 1)]).await);
    }

    eventually(|| async {
        let mut settled = 0;
        for order in &placed {
            if h.orders.status(order).await != Some(OrderStatus::Pending) {
                settled += 1;
            }
        }
        settled == placed.len()
    })
    .await;

    let mut validated = 0;
    let mut failed = 0;
    for order in &placed {
        match h.orders.status(order).await {
            Some(OrderStatus::Validated) => validated += 1,
            Some(OrderStatus::Failed) => failed += 1,
            other => panic!("unexpected status {other:?}"),
        }
    }
    assert_eq!((validated, failed), (5, 5));
    h.wait_for_stock("HOT", 0).await;

    h.stop().await;
}

#[tokio::test]
async fn test_payment_failure_restores_stock_once() {
    let h = TestHarness::new().await;
    h.stock("A", 10).await;
    h.stock("B", 10).await;

    let order = h.place(&[("A", 3), ("B", 2)]).await;
    h.wait_for_status(&order, OrderStatus::Validated).await;
    h.wait_for_stock("A", 7).await;
    h.wait_for_stock("B", 8).await;

    let failure = Message::PaymentFailed(PaymentFailed {
        order_number: order.clone(),
        reason: "card declined".into(),
    });
    h.bus.send(&failure).await.unwrap();
    h.bus.send(&failure).await.unwrap();

    h.wait_for_status(&order, OrderStatus::PaymentFailed).await;
    h.wait_for_stock("A", 10).await;
    h.wait_for_stock("B", 10).await;

    // Both deliveries requested credits; only the first pair released stock.
    eventually(|| async { h.count(channels::INVENTORY_ADJUSTMENT).await == 4 }).await;
    h.ledger
        .adjust(common::InventoryAdjustment::manual("A", 0, "barrier"))
        .await
        .unwrap();
    h.ledger
        .adjust(common::InventoryAdjustment::manual("B", 0, "barrier"))
        .await
        .unwrap();
    eventually(|| async { h.count(channels::INVENTORY_ADJUSTMENT).await == 6 }).await;
    h.wait_for_stock("A", 10).await;
    h.wait_for_stock("B", 10).await;

    h.stop().await;
}

#[tokio::test]
async fn test_payment_processed_completes_order() {
    let h = TestHarness::new().await;
    h.stock("A", 1).await;

    let order = h.place(&[("A", 1)]).await;
    h.wait_for_status(&order, OrderStatus::Validated).await;

    h.bus
        .send(&Message::PaymentProcessed(PaymentProcessed {
            order_number: order.clone(),
            payment_id: "PAY-1".into(),
        }))
        .await
        .unwrap();
    h.wait_for_status(&order, OrderStatus::Completed).await;

    // A late payment failure must not touch a completed order.
    h.bus
        .send(&Message::PaymentFailed(PaymentFailed {
            order_number: order.clone(),
            reason: "late".into(),
        }))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.orders.status(&order).await, Some(OrderStatus::Completed));
    assert_eq!(h.ledger.stock(&Sku::from("A")).await.unwrap(), Some(0));

    h.stop().await;
}

#[tokio::test]
async fn test_redelivered_results_do_not_validate_twice() {
    let h = TestHarness::new().await;
    h.stock("A", 5).await;
    h.stock("B", 5).await;

    let order = h.place(&[("A", 1), ("B", 1)]).await;
    h.wait_for_status(&order, OrderStatus::Validated).await;

    let results: Vec<Message> = h.bus.decoded(channels::INVENTORY_CHECK_RESULT).await;
    for message in &results {
        h.bus.send(message).await.unwrap();
    }
    eventually(|| async { h.count(channels::INVENTORY_CHECK_RESULT).await == 4 }).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(h.count(channels::ORDER_VALIDATED).await, 1);
    assert_eq!(h.orders.status(&order).await, Some(OrderStatus::Validated));

    h.stop().await;
}

#[tokio::test]
async fn test_expired_saga_leaves_order_pending() {
    let h = TestHarness::with_ttl(Duration::ZERO).await;
    h.stock("A", 5).await;

    let order = h.place(&[("A", 1)]).await;

    eventually(|| async { h.count(channels::INVENTORY_CHECK_RESULT).await == 1 }).await;
    let results: Vec<CheckResult> = h
        .bus
        .decoded::<Message>(channels::INVENTORY_CHECK_RESULT)
        .await
        .into_iter()
        .filter_map(|m| match m {
            Message::CheckCompleted(result) => Some(result),
            _ => None,
        })
        .collect();
    assert!(results[0].success);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.orders.status(&order).await, Some(OrderStatus::Pending));
    assert_eq!(h.count(channels::ORDER_VALIDATED).await, 0);
    assert_eq!(h.count(channels::ORDER_FAILED).await, 0);

    h.stop().await;
}
