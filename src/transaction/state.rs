//! Transaction state and the transaction value object.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::error::{Result, TransactionError};
use super::id::TransactionId;
use crate::concurrency::{IsolationLevel, Timestamp};

/// The possible states of a transaction.
///
/// `Active` is initial; `Committed` and `Aborted` are terminal.
/// `Committing` is held while the version store validates and commits, so
/// nothing else can move the transaction in the meantime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionState {
    Active,
    Committing,
    Committed,
    Aborted,
}

impl TransactionState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    pub fn is_committing(&self) -> bool {
        matches!(self, Self::Committing)
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed)
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }

    /// Returns true if the transaction is finished (committed or aborted).
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "Active"),
            Self::Committing => write!(f, "Committing"),
            Self::Committed => write!(f, "Committed"),
            Self::Aborted => write!(f, "Aborted"),
        }
    }
}

/// Per-transaction operation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransactionStats {
    pub reads: usize,
    pub writes: usize,
    pub conflicts: usize,
}

/// A transaction as tracked by the manager.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: TransactionId,
    /// Fixed for the transaction's lifetime.
    pub isolation: IsolationLevel,
    pub state: TransactionState,
    /// Snapshot timestamp for levels that take one.
    pub start_ts: Timestamp,
    pub commit_ts: Option<Timestamp>,
    pub stats: TransactionStats,
    started_at: Instant,
    ended_at: Option<Instant>,
}

impl Transaction {
    /// Creates an active transaction.
    pub fn new(id: TransactionId, isolation: IsolationLevel, start_ts: Timestamp) -> Self {
        Self {
            id,
            isolation,
            state: TransactionState::Active,
            start_ts,
            commit_ts: None,
            stats: TransactionStats::default(),
            started_at: Instant::now(),
            ended_at: None,
        }
    }

    /// Wall-clock time spent so far, or until the transaction finished.
    pub fn duration(&self) -> Duration {
        match self.ended_at {
            Some(end) => end.duration_since(self.started_at),
            None => self.started_at.elapsed(),
        }
    }

    /// Fails with `InvalidState` unless the transaction is active.
    pub fn ensure_active(&self) -> Result<()> {
        if self.state.is_active() {
            Ok(())
        } else {
            Err(TransactionError::InvalidState(self.id, self.state))
        }
    }

    /// Active -> Committing. Only one caller can win this.
    pub fn begin_commit(&mut self) -> Result<()> {
        self.ensure_active()?;
        self.state = TransactionState::Committing;
        Ok(())
    }

    /// Committing -> Committed.
    pub fn mark_committed(&mut self, commit_ts: Timestamp) -> Result<()> {
        if !self.state.is_committing() {
            return Err(TransactionError::InvalidState(self.id, self.state));
        }
        self.state = TransactionState::Committed;
        self.commit_ts = Some(commit_ts);
        self.ended_at = Some(Instant::now());
        Ok(())
    }

    /// Committing -> Aborted, after the version store rejected the commit.
    pub fn fail_commit(&mut self) -> Result<()> {
        if !self.state.is_committing() {
            return Err(TransactionError::InvalidState(self.id, self.state));
        }
        self.state = TransactionState::Aborted;
        self.ended_at = Some(Instant::now());
        Ok(())
    }

    /// Active -> Aborted. Aborting an aborted transaction is accepted; a
    /// committing or committed one is not.
    pub fn mark_aborted(&mut self) -> Result<()> {
        match self.state {
            TransactionState::Active => {
                self.state = TransactionState::Aborted;
                self.ended_at = Some(Instant::now());
                Ok(())
            }
            TransactionState::Aborted => Ok(()),
            TransactionState::Committing | TransactionState::Committed => {
                Err(TransactionError::InvalidState(self.id, self.state))
            }
        }
    }
}
