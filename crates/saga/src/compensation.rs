//! Returning reserved stock when payment fails.

use common::{InventoryAdjustment, Message, PaymentFailed};
use event_bus::{EventBus, EventBusExt};
use orders::{OrderRepository, OrderStatus, Transition};

use crate::Result;

const COMPENSABLE: &[OrderStatus] = &[OrderStatus::Pending, OrderStatus::Validated];

/// What handling a payment failure led to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompensationOutcome {
    /// The order moved to `PAYMENT_FAILED`; one credit per line was requested.
    Compensated { adjustments: usize },
    /// The order had already reached another terminal status.
    AlreadyTerminal { current: OrderStatus },
    /// No such order.
    UnknownOrder,
}

/// Reacts to `payment-failed` by failing the order and crediting back every
/// line that was reserved for it.
pub struct CompensationHandler<R, B> {
    orders: R,
    bus: B,
}

impl<R, B> CompensationHandler<R, B>
where
    R: OrderRepository,
    B: EventBus,
{
    pub fn new(orders: R, bus: B) -> Self {
        Self { orders, bus }
    }

    /// Moves the order to `PAYMENT_FAILED` and requests one credit per line.
    ///
    /// An order already in `PAYMENT_FAILED` gets its credits requested again,
    /// which covers a redelivery after a partial publish. The ledger releases
    /// each line at most once, so repeats are harmless.
    #[tracing::instrument(skip_all, fields(order_number = %event.order_number))]
    pub async fn on_payment_failed(&self, event: &PaymentFailed) -> Result<CompensationOutcome> {
        let Some(order) = self.orders.find_by_number(&event.order_number).await? else {
            tracing::warn!("payment failure for unknown order ignored");
            return Ok(CompensationOutcome::UnknownOrder);
        };

        let transition = self
            .orders
            .update_status(
                &order.order_number,
                COMPENSABLE,
                OrderStatus::PaymentFailed,
                Some(format!("payment failed: {}", event.reason)),
            )
            .await?;

        match transition {
            Transition::Applied { from } => {
                tracing::info!(%from, "order marked payment failed");
            }
            Transition::Skipped {
                current: OrderStatus::PaymentFailed,
            } => {
                tracing::info!("order already marked payment failed, repeating credits");
            }
            Transition::Skipped { current } => {
                tracing::warn!(%current, "order is terminal, compensation skipped");
                return Ok(CompensationOutcome::AlreadyTerminal { current });
            }
        }

        let reason = format!("compensation: payment failed ({})", event.reason);
        for (line, item) in order.items.iter().enumerate() {
            let adjustment = InventoryAdjustment::compensation(
                order.order_number.clone(),
                line as u32,
                item,
                reason.clone(),
            );
            self.bus
                .send(&Message::InventoryAdjusted(adjustment))
                .await?;
            metrics::counter!("saga_compensations_total", "cause" => "payment_failed")
                .increment(1);
        }

        tracing::info!(lines = order.items.len(), "compensation requested");
        Ok(CompensationOutcome::Compensated {
            adjustments: order.items.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{LineItem, OrderNumber, channels};
    use event_bus::{InMemoryEventBus, TopicSpec};
    use orders::{InMemoryOrderRepository, OrderRecord};

    async fn setup(
        status: OrderStatus,
    ) -> (
        CompensationHandler<InMemoryOrderRepository, InMemoryEventBus>,
        InMemoryOrderRepository,
        InMemoryEventBus,
    ) {
        let orders = InMemoryOrderRepository::new();
        let bus = InMemoryEventBus::new(TopicSpec::all(2));
        let mut record = OrderRecord::pending(
            OrderNumber::from("O1"),
            vec![LineItem::new("A", 2), LineItem::new("B", 1)],
        );
        record.status = status;
        orders.save(&record).await.unwrap();
        (
            CompensationHandler::new(orders.clone(), bus.clone()),
            orders,
            bus,
        )
    }

    fn payment_failed() -> PaymentFailed {
        PaymentFailed {
            order_number: OrderNumber::from("O1"),
            reason: "card declined".into(),
        }
    }

    #[tokio::test]
    async fn test_validated_order_is_compensated() {
        let (handler, orders, bus) = setup(OrderStatus::Validated).await;

        let outcome = handler.on_payment_failed(&payment_failed()).await.unwrap();
        assert_eq!(outcome, CompensationOutcome::Compensated { adjustments: 2 });
        assert_eq!(
            orders.status(&OrderNumber::from("O1")).await,
            Some(OrderStatus::PaymentFailed)
        );

        let adjustments: Vec<Message> = bus.decoded(channels::INVENTORY_ADJUSTMENT).await;
        let mut credits: Vec<(String, i64, String)> = adjustments
            .into_iter()
            .filter_map(|m| match m {
                Message::InventoryAdjusted(adj) => {
                    Some((adj.sku.to_string(), adj.delta, adj.reason))
                }
                _ => None,
            })
            .collect();
        credits.sort();
        assert_eq!(
            credits,
            vec![
                (
                    "A".to_string(),
                    2,
                    "compensation: payment failed (card declined)".to_string()
                ),
                (
                    "B".to_string(),
                    1,
                    "compensation: payment failed (card declined)".to_string()
                ),
            ]
        );
    }

    #[tokio::test]
    async fn test_terminal_order_is_not_compensated() {
        let (handler, _, bus) = setup(OrderStatus::Completed).await;

        let outcome = handler.on_payment_failed(&payment_failed()).await.unwrap();
        assert_eq!(
            outcome,
            CompensationOutcome::AlreadyTerminal {
                current: OrderStatus::Completed
            }
        );
        assert_eq!(bus.message_count(channels::INVENTORY_ADJUSTMENT).await, 0);
    }

    #[tokio::test]
    async fn test_unknown_order() {
        let (handler, _, _) = setup(OrderStatus::Pending).await;
        let event = PaymentFailed {
            order_number: OrderNumber::from("ghost"),
            reason: "declined".into(),
        };
        assert_eq!(
            handler.on_payment_failed(&event).await.unwrap(),
            CompensationOutcome::UnknownOrder
        );
    }

    #[tokio::test]
    async fn test_retry_after_publish_failure_repeats_credits() {
        let (handler, orders, bus) = setup(OrderStatus::Pending).await;

        bus.fail_next_publishes(channels::INVENTORY_ADJUSTMENT, 1)
            .await;
        let err = handler.on_payment_failed(&payment_failed()).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(
            orders.status(&OrderNumber::from("O1")).await,
            Some(OrderStatus::PaymentFailed)
        );

        let outcome = handler.on_payment_failed(&payment_failed()).await.unwrap();
        assert_eq!(outcome, CompensationOutcome::Compensated { adjustments: 2 });
        assert_eq!(bus.message_count(channels::INVENTORY_ADJUSTMENT).await, 2);
    }
}
