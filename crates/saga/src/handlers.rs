//! Bus bindings for the coordinator and the compensation handler.

use std::sync::Arc;

use async_trait::async_trait;
use common::{Message, channels};
use event_bus::{Envelope, EventBus, HandlerError, MessageHandler};
use orders::{OrderRepository, ProductCatalog};

use crate::{CompensationHandler, PaymentProcessor, SagaCoordinator, SagaStateStore};

/// Consumer group aggregating check results.
pub const COORDINATOR_GROUP: &str = "saga-coordinator";
pub const COORDINATOR_CHANNELS: [&str; 1] = [channels::INVENTORY_CHECK_RESULT];

/// Consumer group reacting to payment failures.
pub const COMPENSATION_GROUP: &str = "saga-compensation";
pub const COMPENSATION_CHANNELS: [&str; 1] = [channels::PAYMENT_FAILED];

/// Feeds `inventory-check-result` into the coordinator.
pub struct CheckResultHandler<R, C, S, B> {
    coordinator: Arc<SagaCoordinator<R, C, S, B>>,
}

impl<R, C, S, B> CheckResultHandler<R, C, S, B> {
    pub fn new(coordinator: Arc<SagaCoordinator<R, C, S, B>>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl<R, C, S, B> MessageHandler for CheckResultHandler<R, C, S, B>
where
    R: OrderRepository,
    C: ProductCatalog,
    S: SagaStateStore,
    B: EventBus,
{
    fn name(&self) -> &'static str {
        "saga_check_results"
    }

    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        match envelope.decode::<Message>()? {
            Message::CheckCompleted(result) => {
                self.coordinator.on_check_result(&result).await?;
            }
            other => {
                tracing::warn!(kind = other.kind(), "unexpected message on check results");
            }
        }
        Ok(())
    }
}

/// Feeds `payment-failed` into the compensation handler.
pub struct PaymentFailedHandler<R, B> {
    compensation: CompensationHandler<R, B>,
}

impl<R, B> PaymentFailedHandler<R, B> {
    pub fn new(compensation: CompensationHandler<R, B>) -> Self {
        Self { compensation }
    }
}

#[async_trait]
impl<R, B> MessageHandler for PaymentFailedHandler<R, B>
where
    R: OrderRepository,
    B: EventBus,
{
    fn name(&self) -> &'static str {
        "saga_payment_failed"
    }

    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        match envelope.decode::<Message>()? {
            Message::PaymentFailed(event) => {
                self.compensation.on_payment_failed(&event).await?;
            }
            other => {
                tracing::warn!(kind = other.kind(), "unexpected message on payment failures");
            }
        }
        Ok(())
    }
}

/// Consumer group settling validated orders.
pub const PAYMENT_GROUP: &str = "payment";
pub const PAYMENT_CHANNELS: [&str; 1] = [channels::ORDER_VALIDATED];

/// Feeds `order-validated` into the payment processor.
pub struct OrderValidatedHandler<B> {
    payments: Arc<PaymentProcessor<B>>,
}

impl<B> OrderValidatedHandler<B> {
    pub fn new(payments: Arc<PaymentProcessor<B>>) -> Self {
        Self { payments }
    }
}

#[async_trait]
impl<B: EventBus> MessageHandler for OrderValidatedHandler<B> {
    fn name(&self) -> &'static str {
        "payment_order_validated"
    }

    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        match envelope.decode::<Message>()? {
            Message::OrderValidated(event) => {
                self.payments.on_order_validated(&event).await?;
            }
            other => {
                tracing::warn!(kind = other.kind(), "unexpected message on validated orders");
            }
        }
        Ok(())
    }
}
