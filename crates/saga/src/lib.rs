//! Order saga.
//!
//! Placing an order fans out one inventory check per line. Check results are
//! folded into a shared, TTL-bounded [`SagaState`] until the order is either
//! validated or failed. Validated orders are then paid by a simulated
//! [`PaymentProcessor`]; a failed payment returns the reserved stock.
//!
//! Sibling policy: lines are reserved optimistically. When one line fails,
//! every other line of the order is credited back, including lines whose
//! reservation has not happened yet.

pub mod compensation;
pub mod coordinator;
pub mod error;
pub mod handlers;
pub mod memory;
pub mod payment;
pub mod postgres;
pub mod state;
pub mod store;

pub use compensation::{CompensationHandler, CompensationOutcome};
pub use coordinator::{Aggregation, PlaceOrderRequest, SagaCoordinator};
pub use error::{Result, SagaError};
pub use handlers::{
    COMPENSATION_CHANNELS, COMPENSATION_GROUP, COORDINATOR_CHANNELS, COORDINATOR_GROUP,
    CheckResultHandler, OrderValidatedHandler, PAYMENT_CHANNELS, PAYMENT_GROUP,
    PaymentFailedHandler,
};
pub use memory::InMemorySagaStateStore;
pub use payment::{DECLINE_REASON, PaymentMode, PaymentOutcome, PaymentProcessor};
pub use postgres::PostgresSagaStateStore;
pub use state::{CounterField, DEFAULT_SAGA_TTL, FlagField, SagaState};
pub use store::SagaStateStore;
