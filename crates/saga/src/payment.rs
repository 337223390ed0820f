//! Simulated payment for validated orders.
//!
//! No real gateway is called. The configured [`PaymentMode`] decides the
//! outcome of every validated order; `Manual` leaves each order waiting for
//! an explicit [`PaymentProcessor::settle`].

use common::{Message, OrderNumber, OrderValidated, PaymentFailed, PaymentProcessed};
use event_bus::{EventBus, EventBusExt};
use uuid::Uuid;

use crate::Result;

/// Reason announced for declined payments.
pub const DECLINE_REASON: &str = "Payment gateway declined.";

/// How validated orders are settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PaymentMode {
    /// Every payment succeeds.
    #[default]
    Approve,
    /// Every payment is declined.
    Decline,
    /// Nothing happens until a payment is settled explicitly.
    Manual,
}

impl PaymentMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "approve" => Some(PaymentMode::Approve),
            "decline" => Some(PaymentMode::Decline),
            "manual" => Some(PaymentMode::Manual),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMode::Approve => "approve",
            PaymentMode::Decline => "decline",
            PaymentMode::Manual => "manual",
        }
    }
}

/// The announced result of one payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentOutcome {
    Processed { payment_id: String },
    Declined { reason: String },
}

/// Settles orders and announces the result on the bus.
pub struct PaymentProcessor<B> {
    bus: B,
    mode: PaymentMode,
}

impl<B: EventBus> PaymentProcessor<B> {
    pub fn new(bus: B, mode: PaymentMode) -> Self {
        Self { bus, mode }
    }

    pub fn mode(&self) -> PaymentMode {
        self.mode
    }

    /// Settles a freshly validated order according to the mode. Returns
    /// `None` in manual mode.
    #[tracing::instrument(skip_all, fields(order_number = %event.order_number, mode = self.mode.as_str()))]
    pub async fn on_order_validated(&self, event: &OrderValidated) -> Result<Option<PaymentOutcome>> {
        let outcome = match self.mode {
            PaymentMode::Approve => self.settle(&event.order_number, true, None).await?,
            PaymentMode::Decline => self.settle(&event.order_number, false, None).await?,
            PaymentMode::Manual => {
                tracing::debug!("payment left for manual settlement");
                return Ok(None);
            }
        };
        Ok(Some(outcome))
    }

    /// Charges or declines an order and publishes `PaymentProcessed` or
    /// `PaymentFailed`.
    ///
    /// Settling the same order twice publishes twice; the order status
    /// projection and the ledger absorb repeats.
    pub async fn settle(
        &self,
        order_number: &OrderNumber,
        approve: bool,
        reason: Option<String>,
    ) -> Result<PaymentOutcome> {
        if approve {
            let payment_id = Uuid::new_v4().to_string();
            let processed = PaymentProcessed {
                order_number: order_number.clone(),
                payment_id: payment_id.clone(),
            };
            self.bus.send(&Message::PaymentProcessed(processed)).await?;
            metrics::counter!("payments_total", "outcome" => "processed").increment(1);
            tracing::info!(%order_number, %payment_id, "payment processed");
            Ok(PaymentOutcome::Processed { payment_id })
        } else {
            let reason = reason.unwrap_or_else(|| DECLINE_REASON.to_string());
            let failed = PaymentFailed {
                order_number: order_number.clone(),
                reason: reason.clone(),
            };
            self.bus.send(&Message::PaymentFailed(failed)).await?;
            metrics::counter!("payments_total", "outcome" => "declined").increment(1);
            tracing::warn!(%order_number, %reason, "payment declined");
            Ok(PaymentOutcome::Declined { reason })
        }
    }
}
