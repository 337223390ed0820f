//! Order error types.

use common::OrderNumber;
use thiserror::Error;

/// Errors that can occur in order persistence.
#[derive(Debug, Error)]
pub enum OrderError {
    /// No order with this number exists.
    #[error("Order not found: {0}")]
    NotFound(OrderNumber),

    /// An order with this number was already saved.
    #[error("Order already exists: {0}")]
    AlreadyExists(OrderNumber),

    /// The backing store is unreachable or failed.
    #[error("Order store unavailable: {0}")]
    Unavailable(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored row could not be decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored status is not one we know.
    #[error("Invalid stored status: {0}")]
    InvalidStatus(String),
}

impl OrderError {
    /// Returns true if retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            OrderError::Unavailable(_) => true,
            OrderError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }
}

/// Result type for order operations.
pub type Result<T> = std::result::Result<T, OrderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(OrderError::Unavailable("down".into()).is_transient());
        assert!(OrderError::Database(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!OrderError::NotFound(OrderNumber::from("O1")).is_transient());
        assert!(!OrderError::InvalidStatus("X".into()).is_transient());
    }
}
