//! Ledger error types.

use event_bus::BusError;
use thiserror::Error;

/// Errors that can occur in the inventory ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The bus rejected a publish or read.
    #[error("Event bus error: {0}")]
    Bus(#[from] BusError),

    /// The worker owning a shard is not running.
    #[error("Shard {0} is unavailable")]
    ShardUnavailable(u32),

    /// A changelog record or snapshot could not be decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The snapshot store failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl LedgerError {
    /// Returns true if retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            LedgerError::Bus(e) => e.is_transient(),
            LedgerError::ShardUnavailable(_) => true,
            LedgerError::Serialization(_) => false,
            LedgerError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
        }
    }
}

/// Convenience type alias for ledger results.
pub type Result<T> = std::result::Result<T, LedgerError>;
