//! Order status state machine.

use serde::{Deserialize, Serialize};

/// The status of an order as seen by customers.
///
/// State transitions:
/// ```text
/// Pending ──┬──► Validated ──┬──► Completed
///           │                └──► PaymentFailed
///           ├──► Completed
///           └──► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Saved, inventory checks outstanding.
    #[default]
    Pending,

    /// Every line was reserved, awaiting payment.
    Validated,

    /// Payment went through (terminal state).
    Completed,

    /// At least one line could not be reserved (terminal state).
    Failed,

    /// Payment was declined; reserved stock is returned (terminal state).
    PaymentFailed,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 5] = [
        OrderStatus::Pending,
        OrderStatus::Validated,
        OrderStatus::Completed,
        OrderStatus::Failed,
        OrderStatus::PaymentFailed,
    ];

    /// Returns true if an order in this status may move to `next`.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Pending, Validated)
                | (Pending, Failed)
                | (Pending, Completed)
                | (Pending, PaymentFailed)
                | (Validated, Completed)
                | (Validated, PaymentFailed)
        )
    }

    /// Returns true if this is a terminal status (no further transitions possible).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Completed | OrderStatus::Failed | OrderStatus::PaymentFailed
        )
    }

    /// Returns the status name as stored and serialized.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Validated => "VALIDATED",
            OrderStatus::Completed => "COMPLETED",
            OrderStatus::Failed => "FAILED",
            OrderStatus::PaymentFailed => "PAYMENT_FAILED",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OrderStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown order status: {s}"))
    }
}
