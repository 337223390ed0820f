//! Per-order saga progress.

use std::collections::BTreeSet;

use common::{LineItem, OrderNumber};
use serde::{Deserialize, Serialize};

/// Lifetime of a saga that never completes.
pub const DEFAULT_SAGA_TTL: std::time::Duration = std::time::Duration::from_secs(600);

/// Progress of one order's inventory checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaState {
    pub order_number: OrderNumber,
    pub total_items: i64,
    pub received_items: i64,
    pub failed: bool,
    pub original_items: Vec<LineItem>,
    /// Deduplication markers recorded with `mark_seen`.
    #[serde(default)]
    pub seen: BTreeSet<String>,
}

impl SagaState {
    /// A fresh saga expecting one result per item.
    pub fn new(order_number: OrderNumber, items: Vec<LineItem>) -> Self {
        Self {
            order_number,
            total_items: items.len() as i64,
            received_items: 0,
            failed: false,
            original_items: items,
            seen: BTreeSet::new(),
        }
    }

    /// Store key of this saga.
    pub fn key(&self) -> String {
        saga_key(&self.order_number)
    }

    /// True once every expected result has been counted.
    pub fn all_received(&self) -> bool {
        self.received_items >= self.total_items
    }

    pub fn has_seen(&self, member: &str) -> bool {
        self.seen.contains(member)
    }
}

/// Store key of an order's saga.
pub fn saga_key(order_number: &OrderNumber) -> String {
    format!("saga:{order_number}")
}

/// Counters that can be incremented atomically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterField {
    ReceivedItems,
}

impl CounterField {
    pub fn as_str(&self) -> &'static str {
        match self {
            CounterField::ReceivedItems => "received_items",
        }
    }
}

/// Flags that can be set at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagField {
    Failed,
}

impl FlagField {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlagField::Failed => "failed",
        }
    }
}
