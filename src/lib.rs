//! VibeTxn: multi-version concurrency control for an in-memory key/value
//! space.
//!
//! [`transaction::TransactionManager`] is the entry point. It hands out
//! transactions at one of five isolation levels, serves reads and writes
//! from the [`concurrency::VersionStore`] and grants explicit locks from
//! the [`concurrency::LockTable`].

pub mod concurrency;
pub mod transaction;
