//! The persisted order row.

use chrono::{DateTime, Utc};
use common::{LineItem, OrderNumber};
use serde::{Deserialize, Serialize};

use crate::OrderStatus;

/// An order as stored by the order repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_number: OrderNumber,
    pub items: Vec<LineItem>,
    pub status: OrderStatus,
    /// Why the order failed, when it did.
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderRecord {
    /// Creates a new pending order.
    pub fn pending(order_number: OrderNumber, items: Vec<LineItem>) -> Self {
        let now = Utc::now();
        Self {
            order_number,
            items,
            status: OrderStatus::Pending,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Order total in cents, or `None` if any line has no known price.
    pub fn total_cents(&self) -> Option<i64> {
        self.items.iter().try_fold(0i64, |total, item| {
            let price = item.unit_price_cents?;
            Some(total.saturating_add(price.saturating_mul(i64::from(item.quantity))))
        })
    }
}

/// Outcome of a conditional status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The status changed from `from`.
    Applied { from: OrderStatus },
    /// The order was in `current`, which is not an allowed source; nothing changed.
    Skipped { current: OrderStatus },
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied { .. })
    }
}
