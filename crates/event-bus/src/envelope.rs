use chrono::{DateTime, Utc};
use common::MessageId;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// Position of a message within one partition.
///
/// Offsets start at 0 and increase by 1 for every message appended to the
/// partition. A committed offset names the next message to be consumed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Offset(u64);

impl Offset {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// The offset of the first message in a partition.
    pub fn zero() -> Self {
        Self(0)
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Offset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Offset {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// A message as stored in the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Assigned at publish time; identical across redeliveries.
    pub message_id: MessageId,

    pub topic: String,

    /// The partition key the producer supplied.
    pub key: String,

    pub partition: u32,

    pub offset: Offset,

    pub timestamp: DateTime<Utc>,

    pub payload: serde_json::Value,
}

impl Envelope {
    /// Decodes the payload into a concrete message type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Where a published message landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub partition: u32,
    pub offset: Offset,
}
