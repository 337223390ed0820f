//! Inventory ledger: per-SKU stock, sharded by partition.
//!
//! Every SKU is owned by the worker of the partition its key hashes to. The
//! worker is the only writer of that SKU's stock and persists each change to
//! the `inventory-changelog` topic before it becomes visible.

pub mod changelog;
pub mod error;
pub mod ledger;
pub mod shard;
pub mod snapshot;

pub use changelog::{LedgerChange, LedgerRecord, ReservationState};
pub use error::{LedgerError, Result};
pub use ledger::{InventoryLedger, LEDGER_GROUP, LedgerConfig};
pub use shard::{Decision, LedgerShard};
pub use snapshot::{
    InMemoryLedgerSnapshotStore, LedgerSnapshot, LedgerSnapshotStore, PostgresLedgerSnapshotStore,
};
