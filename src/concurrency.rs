//! Concurrency control module.
//!
//! This module implements concurrency control mechanisms for VibeTxn:
//! - Logical timestamps for snapshot and commit ordering
//! - Isolation levels and their visibility rules
//! - Version chains and the MVCC version store
//! - Per-transaction snapshots, validation and write-skew detection
//! - An explicit shared/exclusive lock table

pub mod isolation;
pub mod lock;
pub mod mvcc;
pub mod snapshot;
pub mod timestamp;
pub mod version;

pub use isolation::IsolationLevel;
pub use lock::{LockHolder, LockId, LockMode, LockTable};
pub use mvcc::{MvccStats, VacuumReport, VersionStore};
pub use snapshot::{Snapshot, SnapshotRegistry};
pub use timestamp::{Timestamp, TimestampOracle};
pub use version::{VersionChain, VersionedRecord};
