//! Shared identifiers and message contracts for the distributed order saga.

pub mod messages;
pub mod types;

pub use messages::{
    CheckRequest, CheckResult, InventoryAdjustment, Message, OrderFailed, OrderValidated,
    PaymentFailed, PaymentProcessed, ProductCreated, channels,
};
pub use types::{LineItem, MessageId, OrderNumber, Sku};
