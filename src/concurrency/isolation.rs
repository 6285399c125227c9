//! Isolation levels and the visibility/conflict policy attached to each.
//!
//! The policy is a pair of pure functions over a candidate record so the
//! per-level rules can be tested without a running store:
//!
//! | Level            | A record is visible when                                  |
//! |------------------|-----------------------------------------------------------|
//! | ReadUncommitted  | it is not aborted                                         |
//! | ReadCommitted    | it is committed and not aborted                           |
//! | RepeatableRead   | as ReadCommitted (repeat reads are served from snapshot)  |
//! | Serializable     | as RepeatableRead, plus phantom tracking                  |
//! | Snapshot         | it is our own, or committed at or before our snapshot     |

use crate::concurrency::timestamp::Timestamp;
use crate::concurrency::version::VersionedRecord;
use crate::transaction::TransactionId;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Isolation levels supported by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IsolationLevel {
    /// Sees uncommitted writes of other transactions.
    ReadUncommitted,
    /// Sees the latest committed value on every read.
    #[default]
    ReadCommitted,
    /// First read of a key is pinned for the rest of the transaction.
    RepeatableRead,
    /// Repeatable reads plus first-committer-wins, validation and write-skew checks.
    Serializable,
    /// Reads a fixed point-in-time view taken at begin.
    Snapshot,
}

impl IsolationLevel {
    pub const ALL: [IsolationLevel; 5] = [
        IsolationLevel::ReadUncommitted,
        IsolationLevel::ReadCommitted,
        IsolationLevel::RepeatableRead,
        IsolationLevel::Serializable,
        IsolationLevel::Snapshot,
    ];

    /// Whether a snapshot is created at begin.
    pub fn uses_snapshot(&self) -> bool {
        matches!(
            self,
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable | IsolationLevel::Snapshot
        )
    }

    /// Whether writes are checked against concurrently committed versions.
    pub fn checks_write_conflicts(&self) -> bool {
        matches!(self, IsolationLevel::Serializable | IsolationLevel::Snapshot)
    }

    /// Whether commit runs snapshot validation over the recorded reads.
    pub fn validates_at_commit(&self) -> bool {
        self.checks_write_conflicts()
    }

    /// Whether read keys are registered for phantom tracking.
    pub fn tracks_phantoms(&self) -> bool {
        matches!(self, IsolationLevel::Serializable)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ_UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ_COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE_READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
            IsolationLevel::Snapshot => "SNAPSHOT",
        }
    }
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IsolationLevel {
    type Err = String;

    /// Accepts `READ_COMMITTED`, `read-committed`, `read committed` and so on.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .map(|c| match c {
                '-' | ' ' => '_',
                c => c.to_ascii_uppercase(),
            })
            .collect();

        IsolationLevel::ALL
            .into_iter()
            .find(|level| level.as_str() == normalized)
            .ok_or_else(|| format!("unknown isolation level: {}", s))
    }
}

/// Decides whether `record` is visible to `reader` under `level`.
///
/// `snapshot_ts` is the reader's snapshot timestamp; it only matters for
/// `Snapshot`, which falls back to read-committed rules when it is absent.
pub fn visible(
    level: IsolationLevel,
    reader: TransactionId,
    snapshot_ts: Option<Timestamp>,
    record: &VersionedRecord,
) -> bool {
    match level {
        IsolationLevel::ReadUncommitted => !record.aborted,
        IsolationLevel::ReadCommitted
        | IsolationLevel::RepeatableRead
        | IsolationLevel::Serializable => record.committed && !record.aborted,
        IsolationLevel::Snapshot => match snapshot_ts {
            Some(ts) => {
                (record.owner == reader && !record.aborted)
                    || (record.committed && record.commit_ts <= ts)
            }
            None => record.committed && !record.aborted,
        },
    }
}

/// Decides whether an existing `record` makes a write by `writer` conflict.
///
/// Only levels with first-committer-wins semantics conflict: another
/// transaction committed this key after the writer's snapshot was taken.
pub fn conflicts(
    level: IsolationLevel,
    writer: TransactionId,
    snapshot_ts: Timestamp,
    record: &VersionedRecord,
) -> bool {
    level.checks_write_conflicts() && committed_after(writer, snapshot_ts, record)
}

/// Whether `record` belongs to someone other than `reader` and committed after `ts`.
pub(crate) fn committed_after(reader: TransactionId, ts: Timestamp, record: &VersionedRecord) -> bool {
    record.owner != reader && record.committed && record.commit_ts > ts
}
