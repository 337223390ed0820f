//! Saga error types.

use common::OrderNumber;
use event_bus::{BusError, HandlerError};
use orders::OrderError;
use thiserror::Error;

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The order request cannot be placed as given.
    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    /// No order with this number exists.
    #[error("Order not found: {0}")]
    OrderNotFound(OrderNumber),

    /// Order persistence failed.
    #[error("Order error: {0}")]
    Order(#[from] OrderError),

    /// Publishing to the bus failed.
    #[error("Event bus error: {0}")]
    Bus(#[from] BusError),

    /// The saga state store is unreachable.
    #[error("Saga state store unavailable: {0}")]
    StoreUnavailable(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SagaError {
    /// Returns true if retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            SagaError::Order(e) => e.is_transient(),
            SagaError::Bus(e) => e.is_transient(),
            SagaError::StoreUnavailable(_) => true,
            SagaError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            SagaError::InvalidOrder(_)
            | SagaError::OrderNotFound(_)
            | SagaError::Serialization(_) => false,
        }
    }
}

impl From<SagaError> for HandlerError {
    fn from(err: SagaError) -> Self {
        let transient = err.is_transient();
        HandlerError::classify(err, transient)
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
