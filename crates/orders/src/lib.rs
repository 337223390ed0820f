//! Orders: persisted order records and their status.
//!
//! The saga coordinator saves orders as `PENDING`; everything after that is
//! driven by bus messages through [`OrderStatusProjector`].

pub mod catalog;
pub mod error;
pub mod postgres;
pub mod projector;
pub mod record;
pub mod repository;
pub mod status;

pub use catalog::{InMemoryProductCatalog, Product, ProductCatalog};
pub use error::{OrderError, Result};
pub use postgres::PostgresOrderRepository;
pub use projector::{OrderStatusProjector, PROJECTOR_CHANNELS, PROJECTOR_GROUP};
pub use record::{OrderRecord, Transition};
pub use repository::{InMemoryOrderRepository, OrderRepository};
pub use status::OrderStatus;
