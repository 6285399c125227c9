//! Transaction management module.
//!
//! This module provides transaction support for VibeTxn, including:
//! - Transaction lifecycle management (begin, commit, abort)
//! - Per-transaction state and statistics
//! - Error types shared with the concurrency layer
//! - An RAII guard that aborts unfinished transactions

pub mod config;
pub mod error;
pub mod id;
pub mod manager;
pub mod state;

// Re-export commonly used types
pub use config::TransactionManagerConfig;
pub use error::{Result, TransactionError, ValidationFailure};
pub use id::{TransactionId, TransactionIdGenerator};
pub use manager::{ManagerStats, TransactionGuard, TransactionHandle, TransactionManager};
pub use state::{Transaction, TransactionState, TransactionStats};
