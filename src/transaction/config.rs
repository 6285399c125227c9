//! Transaction manager configuration.

use serde::{Deserialize, Serialize};

use crate::concurrency::IsolationLevel;

/// Configuration for [`TransactionManager`](super::TransactionManager).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionManagerConfig {
    /// Level used by `begin_default`.
    pub default_isolation: IsolationLevel,
    /// Reject SERIALIZABLE commits that would close a read/write cycle.
    pub detect_write_skew: bool,
    /// Reject reads, writes and lock requests on finished transactions.
    pub enforce_terminal_state: bool,
}

impl Default for TransactionManagerConfig {
    fn default() -> Self {
        Self {
            default_isolation: IsolationLevel::ReadCommitted,
            detect_write_skew: true,
            enforce_terminal_state: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TransactionManagerConfig::default();
        assert_eq!(config.default_isolation, IsolationLevel::ReadCommitted);
        assert!(config.detect_write_skew);
        assert!(config.enforce_terminal_state);
    }
}
