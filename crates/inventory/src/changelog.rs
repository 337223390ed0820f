//! Durable record of every ledger mutation.
//!
//! Each processed input message produces at most one [`LedgerRecord`],
//! published as a single message so a shard never observes half of an
//! input's effects. Records carry absolute values, so replaying a record
//! twice leaves the shard unchanged.

use common::{OrderNumber, Sku};
use event_bus::Offset;
use serde::{Deserialize, Serialize};

/// What the ledger decided about one order line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReservationState {
    /// Stock was taken out and is still held for the order.
    Held { quantity: u32 },
    /// Stock was taken out and later credited back.
    Released { quantity: u32 },
    /// The check failed; nothing was taken.
    Rejected { reason: String },
    /// A compensation arrived before the check; the line must never reserve.
    Cancelled,
}

/// A single state change on a shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum LedgerChange {
    /// The SKU's stock is now exactly `quantity`.
    Stock { sku: Sku, quantity: i64 },
    /// The order line's reservation is now in `state`.
    Reservation {
        order_number: OrderNumber,
        line: u32,
        sku: Sku,
        state: ReservationState,
    },
}

impl LedgerChange {
    pub fn sku(&self) -> &Sku {
        match self {
            LedgerChange::Stock { sku, .. } => sku,
            LedgerChange::Reservation { sku, .. } => sku,
        }
    }
}

/// All changes caused by one input message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRecord {
    /// Input topic the changes came from.
    pub source_topic: String,
    /// Input offset the changes came from.
    pub source_offset: Offset,
    pub changes: Vec<LedgerChange>,
}
