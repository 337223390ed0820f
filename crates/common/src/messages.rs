//! Payloads exchanged between the saga participants.
//!
//! Every channel carries a [`Message`]. The variant decides both the channel
//! and the partition key, so a check request can never be published keyed by
//! anything but its SKU.

use serde::{Deserialize, Serialize};

use crate::types::{LineItem, OrderNumber, Sku};

/// Logical channel names. Stable integration contracts.
pub mod channels {
    pub const PRODUCT_CREATED: &str = "product-created";
    pub const INVENTORY_CHECK_REQUEST: &str = "inventory-check-request";
    pub const INVENTORY_CHECK_RESULT: &str = "inventory-check-result";
    pub const INVENTORY_ADJUSTMENT: &str = "inventory-adjustment";
    pub const INVENTORY_CHANGELOG: &str = "inventory-changelog";
    pub const ORDER_VALIDATED: &str = "order-validated";
    pub const ORDER_FAILED: &str = "order-failed";
    pub const PAYMENT_FAILED: &str = "payment-failed";
    pub const PAYMENT_PROCESSED: &str = "payment-processed";

    /// Channels consumed by the inventory ledger. All keyed by SKU.
    pub const LEDGER_INPUTS: [&str; 3] = [
        PRODUCT_CREATED,
        INVENTORY_CHECK_REQUEST,
        INVENTORY_ADJUSTMENT,
    ];

    /// Every channel of the system.
    pub const ALL: [&str; 9] = [
        PRODUCT_CREATED,
        INVENTORY_CHECK_REQUEST,
        INVENTORY_CHECK_RESULT,
        INVENTORY_ADJUSTMENT,
        INVENTORY_CHANGELOG,
        ORDER_VALIDATED,
        ORDER_FAILED,
        PAYMENT_FAILED,
        PAYMENT_PROCESSED,
    ];
}

/// A request to reserve stock for one order line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRequest {
    pub order_number: OrderNumber,
    /// Index of the line within the order.
    pub line: u32,
    pub sku: Sku,
    pub quantity: u32,
}

/// The ledger's verdict on a [`CheckRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub order_number: OrderNumber,
    pub line: u32,
    pub sku: Sku,
    pub quantity: u32,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CheckResult {
    pub fn reserved(request: &CheckRequest) -> Self {
        Self {
            order_number: request.order_number.clone(),
            line: request.line,
            sku: request.sku.clone(),
            quantity: request.quantity,
            success: true,
            reason: None,
        }
    }

    pub fn shortage(request: &CheckRequest, reason: impl Into<String>) -> Self {
        Self {
            success: false,
            reason: Some(reason.into()),
            ..Self::reserved(request)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductCreated {
    pub sku: Sku,
    pub initial_quantity: i64,
}

/// A stock change that does not come from a reservation.
///
/// When `order_number` and `line` are present the adjustment is a
/// compensation: it releases exactly the reservation recorded for that line.
/// Otherwise `delta` is applied as a manual correction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryAdjustment {
    pub sku: Sku,
    pub delta: i64,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_number: Option<OrderNumber>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

impl InventoryAdjustment {
    /// A manual stock correction.
    pub fn manual(sku: impl Into<Sku>, delta: i64, reason: impl Into<String>) -> Self {
        Self {
            sku: sku.into(),
            delta,
            reason: reason.into(),
            order_number: None,
            line: None,
        }
    }

    /// A credit returning the stock reserved for one order line.
    pub fn compensation(
        order_number: OrderNumber,
        line: u32,
        item: &LineItem,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            sku: item.sku.clone(),
            delta: i64::from(item.quantity),
            reason: reason.into(),
            order_number: Some(order_number),
            line: Some(line),
        }
    }

    /// Returns the reservation this adjustment releases, if it is a compensation.
    pub fn reservation(&self) -> Option<(&OrderNumber, u32)> {
        match (&self.order_number, self.line) {
            (Some(order), Some(line)) => Some((order, line)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderValidated {
    pub order_number: OrderNumber,
    pub items: Vec<LineItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderFailed {
    pub order_number: OrderNumber,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentFailed {
    pub order_number: OrderNumber,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentProcessed {
    pub order_number: OrderNumber,
    pub payment_id: String,
}

/// Every message kind that flows through the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Message {
    ProductCreated(ProductCreated),
    CheckRequested(CheckRequest),
    CheckCompleted(CheckResult),
    InventoryAdjusted(InventoryAdjustment),
    OrderValidated(OrderValidated),
    OrderFailed(OrderFailed),
    PaymentFailed(PaymentFailed),
    PaymentProcessed(PaymentProcessed),
}

impl Message {
    /// The channel this message is published on.
    pub fn channel(&self) -> &'static str {
        match self {
            Message::ProductCreated(_) => channels::PRODUCT_CREATED,
            Message::CheckRequested(_) => channels::INVENTORY_CHECK_REQUEST,
            Message::CheckCompleted(_) => channels::INVENTORY_CHECK_RESULT,
            Message::InventoryAdjusted(_) => channels::INVENTORY_ADJUSTMENT,
            Message::OrderValidated(_) => channels::ORDER_VALIDATED,
            Message::OrderFailed(_) => channels::ORDER_FAILED,
            Message::PaymentFailed(_) => channels::PAYMENT_FAILED,
            Message::PaymentProcessed(_) => channels::PAYMENT_PROCESSED,
        }
    }

    /// The partition key: SKU for ledger inputs, order number for everything else.
    pub fn key(&self) -> &str {
        match self {
            Message::ProductCreated(m) => m.sku.as_str(),
            Message::CheckRequested(m) => m.sku.as_str(),
            Message::InventoryAdjusted(m) => m.sku.as_str(),
            Message::CheckCompleted(m) => m.order_number.as_str(),
            Message::OrderValidated(m) => m.order_number.as_str(),
            Message::OrderFailed(m) => m.order_number.as_str(),
            Message::PaymentFailed(m) => m.order_number.as_str(),
            Message::PaymentProcessed(m) => m.order_number.as_str(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::ProductCreated(_) => "ProductCreated",
            Message::CheckRequested(_) => "CheckRequested",
            Message::CheckCompleted(_) => "CheckCompleted",
            Message::InventoryAdjusted(_) => "InventoryAdjusted",
            Message::OrderValidated(_) => "OrderValidated",
            Message::OrderFailed(_) => "OrderFailed",
            Message::PaymentFailed(_) => "PaymentFailed",
            Message::PaymentProcessed(_) => "PaymentProcessed",
        }
    }
}
