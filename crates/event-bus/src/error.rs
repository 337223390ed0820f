use thiserror::Error;

/// Errors that can occur when interacting with the event bus.
#[derive(Debug, Error)]
pub enum BusError {
    /// The topic was never declared.
    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    /// A partition index outside the topic's partition count.
    #[error("Partition {partition} out of range for topic {topic}")]
    PartitionOutOfRange { topic: String, partition: u32 },

    /// Topics consumed together must be co-partitioned.
    #[error("Topics {0:?} do not share a partition count")]
    PartitionMismatch(Vec<String>),

    /// The bus is temporarily unable to accept or serve messages.
    #[error("Bus unavailable: {0}")]
    Unavailable(String),

    /// A payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The backing database failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl BusError {
    /// Returns true if retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            BusError::Unavailable(_) => true,
            BusError::Database(e) => matches!(
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

/// Outcome classification for a failed message handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Infrastructure hiccup; the message is redelivered.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The message can never be processed; it is logged and skipped.
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl HandlerError {
    /// Classifies an error by its transience.
    pub fn classify(err: impl std::fmt::Display, transient: bool) -> Self {
        if transient {
            HandlerError::Transient(err.to_string())
        } else {
            HandlerError::Permanent(err.to_string())
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, HandlerError::Transient(_))
    }
}

impl From<BusError> for HandlerError {
    fn from(err: BusError) -> Self {
        let transient = err.is_transient();
        HandlerError::classify(err, transient)
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::Permanent(err.to_string())
    }
}

/// Result type for event bus operations.
pub type Result<T> = std::result::Result<T, BusError>;
