//! Partitioned, ordered-per-key message log.
//!
//! Provides the [`EventBus`] contract, in-memory and PostgreSQL
//! implementations, and the consumer-group runtime that binds long-lived
//! worker tasks to partitions.

pub mod bus;
pub mod consumer;
pub mod envelope;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod retry;

pub use bus::{EventBus, EventBusExt, TopicSpec, partition_for};
pub use consumer::{
    ConsumerGroup, DeliveryOutcome, MessageHandler, PartitionCursor, Shutdown, co_partitioned,
    deliver,
};
pub use envelope::{Delivery, Envelope, Offset};
pub use error::{BusError, HandlerError, Result};
pub use memory::InMemoryEventBus;
pub use postgres::{NOTIFY_CHANNEL, PostgresEventBus};
pub use retry::RetryPolicy;
