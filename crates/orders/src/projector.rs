//! Projects saga and payment outcomes onto order status.

use async_trait::async_trait;
use common::{Message, channels};
use event_bus::{Envelope, HandlerError, MessageHandler};

use crate::{OrderError, OrderRepository, OrderStatus, Transition};

/// Consumer group of the projector.
pub const PROJECTOR_GROUP: &str = "order-status-projector";

/// Channels the projector consumes. All keyed by order number.
pub const PROJECTOR_CHANNELS: [&str; 3] = [
    channels::ORDER_VALIDATED,
    channels::ORDER_FAILED,
    channels::PAYMENT_PROCESSED,
];

const FROM_PENDING: &[OrderStatus] = &[OrderStatus::Pending];
const FROM_OPEN: &[OrderStatus] = &[OrderStatus::Pending, OrderStatus::Validated];

/// Applies order status transitions driven by bus messages.
///
/// Transitions that are not allowed from the current status are logged and
/// ignored, which also absorbs redeliveries.
pub struct OrderStatusProjector<R> {
    repository: R,
}

impl<R: OrderRepository> OrderStatusProjector<R> {
    pub fn new(repository: R) -> Self {
        Self { repository }
    }

    /// Applies the status change a message implies. Returns `None` for
    /// messages the projector does not track.
    #[tracing::instrument(skip_all, fields(kind = message.kind()))]
    pub async fn project(&self, message: &Message) -> crate::Result<Option<Transition>> {
        let (order_number, from, to, reason) = match message {
            Message::OrderValidated(event) => (
                &event.order_number,
                FROM_PENDING,
                OrderStatus::Validated,
                None,
            ),
            Message::OrderFailed(event) => (
                &event.order_number,
                FROM_PENDING,
                OrderStatus::Failed,
                Some(event.reason.clone()),
            ),
            Message::PaymentProcessed(event) => (
                &event.order_number,
                FROM_OPEN,
                OrderStatus::Completed,
                None,
            ),
            _ => return Ok(None),
        };

        let transition = self
            .repository
            .update_status(order_number, from, to, reason)
            .await?;

        match transition {
            Transition::Applied { from } => {
                tracing::info!(%order_number, %from, %to, "order status updated");
                metrics::counter!("order_status_transitions_total", "to" => to.as_str())
                    .increment(1);
            }
            Transition::Skipped { current } => {
                tracing::warn!(
                    %order_number,
                    %current,
                    requested = %to,
                    "order status transition ignored"
                );
            }
        }
        Ok(Some(transition))
    }
}

#[async_trait]
impl<R: OrderRepository> MessageHandler for OrderStatusProjector<R> {
    fn name(&self) -> &'static str {
        "order_status_projector"
    }

    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        let message: Message = envelope.decode()?;
        match self.project(&message).await {
            Ok(_) => Ok(()),
            Err(OrderError::NotFound(order_number)) => {
                tracing::warn!(%order_number, "status update for unknown order dropped");
                Ok(())
            }
            Err(e) => {
                let transient = e.is_transient();
                Err(HandlerError::classify(e, transient))
            }
        }
    }
}
