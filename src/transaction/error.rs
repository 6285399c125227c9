//! Error types for transaction operations.

use thiserror::Error;

use super::id::TransactionId;
use super::state::TransactionState;
use crate::concurrency::lock::{LockId, LockMode};

/// Why commit-time validation rejected a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationFailure {
    /// A key read by the transaction was changed by a later committer.
    StaleRead { key: String },
    /// Committing would close a read/write cycle with an overlapping
    /// SERIALIZABLE transaction that already committed.
    WriteSkew { with: TransactionId },
}

impl std::fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StaleRead { key } => write!(f, "key '{}' changed since it was read", key),
            Self::WriteSkew { with } => write!(f, "write skew with {}", with),
        }
    }
}

/// Errors returned by the transaction subsystem.
///
/// None of these are fatal: the engine stays consistent and the caller
/// decides whether to retry, abort or give up.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("Transaction {0} not found")]
    NotFound(TransactionId),

    #[error("No visible version of key '{key}'")]
    NotVisible { key: String },

    #[error("Write conflict for {id} on key '{key}'")]
    Conflict { id: TransactionId, key: String },

    #[error("Validation failed for {id}: {reason}")]
    ValidationFailed {
        id: TransactionId,
        reason: ValidationFailure,
    },

    #[error("{mode} lock on {resource} denied to {id}")]
    Denied {
        id: TransactionId,
        resource: LockId,
        mode: LockMode,
    },

    #[error("Transaction {0} is in invalid state: {1}")]
    InvalidState(TransactionId, TransactionState),
}

impl TransactionError {
    /// Whether retrying the whole transaction may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. } | Self::ValidationFailed { .. } | Self::Denied { .. }
        )
    }
}

/// Result type for transaction operations.
pub type Result<T> = std::result::Result<T, TransactionError>;
