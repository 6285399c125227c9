//! Multi-Version Concurrency Control (MVCC) core.
//!
//! [`VersionStore`] owns one [`VersionChain`] per key behind a single
//! reader-writer lock. Reads take the shared side; writes, commits, aborts
//! and vacuum take the exclusive side, so commit timestamps are assigned in
//! a total order relative to every visibility decision.
//!
//! Lock order is always store, then snapshot registry. The lock table is
//! never touched from here.

use crate::concurrency::isolation::{self, IsolationLevel};
use crate::concurrency::snapshot::{Snapshot, SnapshotRegistry};
use crate::concurrency::timestamp::{Timestamp, TimestampOracle};
use crate::concurrency::version::{VersionChain, VersionedRecord};
use crate::transaction::{Result, TransactionError, TransactionId, ValidationFailure};
use bytes::Bytes;
use log::{debug, info, warn};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
struct StoreState {
    chains: HashMap<String, VersionChain>,
    /// Keys each unfinished transaction has written to.
    written: HashMap<TransactionId, HashSet<String>>,
}

/// Version chains plus the snapshots that read them.
#[derive(Debug)]
pub struct VersionStore {
    state: RwLock<StoreState>,
    snapshots: SnapshotRegistry,
    oracle: TimestampOracle,
    detect_write_skew: bool,
}

impl VersionStore {
    /// Creates an empty store with write-skew detection enabled.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            snapshots: SnapshotRegistry::new(),
            oracle: TimestampOracle::new(),
            detect_write_skew: true,
        }
    }

    pub fn with_write_skew_detection(mut self, enabled: bool) -> Self {
        self.detect_write_skew = enabled;
        self
    }

    /// Registers the start of `tid` and returns its start timestamp.
    ///
    /// Levels that need one get a snapshot pinned at that timestamp.
    pub fn begin(&self, tid: TransactionId, isolation: IsolationLevel) -> Timestamp {
        // Shared lock keeps vacuum from computing its horizon between the
        // timestamp and the snapshot becoming visible.
        let _guard = self.state.read();
        let start_ts = self.oracle.generate();
        if isolation.uses_snapshot() {
            self.snapshots.create(tid, isolation, start_ts);
        }
        debug!("{} began at {} ({})", tid, start_ts, isolation);
        start_ts
    }

    /// Returns the payload of `key` visible to `tid`, if any.
    pub fn read(&self, tid: TransactionId, key: &str, isolation: IsolationLevel) -> Option<Bytes> {
        if isolation.tracks_phantoms() {
            self.snapshots.register_predicate(tid, key);
        }

        // Snapshot readers see their own writes, which must not be masked
        // by an earlier cached read.
        let use_cache = isolation.uses_snapshot()
            && !(isolation == IsolationLevel::Snapshot && self.snapshots.has_written(tid, key));
        if use_cache {
            if let Some(cached) = self.snapshots.cached_read(tid, key) {
                debug!("{} read {} from snapshot", tid, key);
                return Some(cached.payload);
            }
        }

        let snapshot_ts = if isolation.uses_snapshot() {
            self.snapshots.timestamp(tid)
        } else {
            None
        };

        let record = {
            let state = self.state.read();
            let found = state
                .chains
                .get(key)?
                .newest_first()
                .find(|record| isolation::visible(isolation, tid, snapshot_ts, record))?
                .clone();
            found
        };

        if isolation.uses_snapshot() {
            if let Some(first) = self.snapshots.record_read(tid, key, &record) {
                if use_cache {
                    return Some(first.payload);
                }
            }
        }
        Some(record.payload)
    }

    /// Appends a pending version of `key` owned by `tid`.
    ///
    /// Under SERIALIZABLE and SNAPSHOT the write fails with `Conflict`, and
    /// changes nothing, if another transaction committed `key` after this
    /// transaction's snapshot was taken.
    pub fn write(
        &self,
        tid: TransactionId,
        key: &str,
        payload: Bytes,
        isolation: IsolationLevel,
    ) -> Result<()> {
        let mut state = self.state.write();

        if isolation.checks_write_conflicts() {
            if let (Some(snapshot_ts), Some(chain)) =
                (self.snapshots.timestamp(tid), state.chains.get(key))
            {
                if chain
                    .newest_first()
                    .any(|record| isolation::conflicts(isolation, tid, snapshot_ts, record))
                {
                    warn!("Write conflict detected for {} on key {}", tid, key);
                    return Err(TransactionError::Conflict {
                        id: tid,
                        key: key.to_string(),
                    });
                }
            }
        }

        let created_at = self.oracle.generate();
        state
            .chains
            .entry(key.to_string())
            .or_default()
            .append(tid, created_at, payload);
        state
            .written
            .entry(tid)
            .or_default()
            .insert(key.to_string());
        self.snapshots.record_write(tid, key);

        debug!("{} wrote {} at {}", tid, key, created_at);
        Ok(())
    }

    /// Validates and commits every pending version owned by `tid`.
    ///
    /// On failure nothing changes; the caller is expected to abort.
    pub fn commit(&self, tid: TransactionId, isolation: IsolationLevel) -> Result<Timestamp> {
        let mut state = self.state.write();

        if isolation.validates_at_commit() {
            self.validate_reads(&state, tid)?;
        }

        if isolation == IsolationLevel::Serializable && self.detect_write_skew {
            if let Some(other) = self.snapshots.find_write_skew(tid) {
                warn!(
                    "Write skew detected for {} against {} (ran {}..{})",
                    tid, other.transaction_id, other.start_ts, other.commit_ts
                );
                return Err(TransactionError::ValidationFailed {
                    id: tid,
                    reason: ValidationFailure::WriteSkew {
                        with: other.transaction_id,
                    },
                });
            }
        }

        let commit_ts = self.oracle.generate();
        let keys = state.written.remove(&tid).unwrap_or_default();
        let mut committed = 0;
        for key in &keys {
            if let Some(chain) = state.chains.get_mut(key) {
                committed += chain.commit(tid, commit_ts);
            }
        }
        self.snapshots.record_footprint(tid, commit_ts);

        info!(
            "Committed {} versions for {} at {}",
            committed, tid, commit_ts
        );
        Ok(commit_ts)
    }

    /// Fails if a key `tid` read was since committed with a different value.
    fn validate_reads(&self, state: &StoreState, tid: TransactionId) -> Result<()> {
        let Some((snapshot_ts, reads)) = self.snapshots.read_versions(tid) else {
            return Ok(());
        };

        for (key, read) in reads {
            let Some(chain) = state.chains.get(&key) else {
                continue;
            };
            let stale = chain.newest_first().any(|record| {
                isolation::committed_after(tid, snapshot_ts, record) && record.payload != read.payload
            });
            if stale {
                warn!("Snapshot validation failed for {} on key {}", tid, key);
                return Err(TransactionError::ValidationFailed {
                    id: tid,
                    reason: ValidationFailure::StaleRead { key },
                });
            }
        }
        Ok(())
    }

    /// Flags every pending version owned by `tid` as aborted.
    ///
    /// Records stay in their chains until vacuumed. Safe to call repeatedly.
    pub fn abort(&self, tid: TransactionId) -> usize {
        let mut state = self.state.write();
        let keys = state.written.remove(&tid).unwrap_or_default();
        let mut aborted = 0;
        for key in &keys {
            if let Some(chain) = state.chains.get_mut(key) {
                aborted += chain.abort(tid);
            }
        }
        info!("Aborted {} versions for {}", aborted, tid);
        aborted
    }

    /// Destroys the snapshot of a finished transaction.
    pub fn release_snapshot(&self, tid: TransactionId) -> Option<Snapshot> {
        self.snapshots.remove(tid)
    }

    pub fn snapshot(&self, tid: TransactionId) -> Option<Snapshot> {
        self.snapshots.get(tid)
    }

    /// All versions of `key`, newest first.
    pub fn versions(&self, key: &str) -> Vec<VersionedRecord> {
        self.state
            .read()
            .chains
            .get(key)
            .map(|chain| chain.newest_first().cloned().collect())
            .unwrap_or_default()
    }

    pub fn current_timestamp(&self) -> Timestamp {
        self.oracle.current()
    }

    /// Removes versions and footprints no live snapshot can observe.
    ///
    /// The horizon is the oldest active snapshot, or the current timestamp
    /// when no snapshot is live.
    pub fn vacuum(&self) -> VacuumReport {
        let mut state = self.state.write();
        let horizon = self
            .snapshots
            .oldest_active()
            .unwrap_or_else(|| self.oracle.current());

        let mut versions_removed = 0;
        for chain in state.chains.values_mut() {
            versions_removed += chain.prune(horizon);
        }
        let chains_before = state.chains.len();
        state.chains.retain(|_, chain| !chain.is_empty());
        let chains_removed = chains_before - state.chains.len();
        let footprints_removed = self.snapshots.prune_footprints(horizon);

        let report = VacuumReport {
            horizon,
            versions_removed,
            chains_removed,
            footprints_removed,
            transactions_purged: 0,
        };
        info!("Vacuum finished: {:?}", report);
        report
    }

    pub fn stats(&self) -> MvccStats {
        let state = self.state.read();
        let mut stats = MvccStats {
            version_chains: state.chains.len(),
            active_snapshots: self.snapshots.active_count(),
            retained_footprints: self.snapshots.footprint_count(),
            ..MvccStats::default()
        };
        for record in state.chains.values().flat_map(|chain| chain.newest_first()) {
            stats.total_versions += 1;
            if record.committed {
                stats.committed_versions += 1;
            } else if record.aborted {
                stats.aborted_versions += 1;
            } else {
                stats.pending_versions += 1;
            }
        }
        stats
    }
}

impl Default for VersionStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of a vacuum pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VacuumReport {
    pub horizon: Timestamp,
    pub versions_removed: usize,
    pub chains_removed: usize,
    pub footprints_removed: usize,
    /// Filled in by the transaction manager.
    pub transactions_purged: usize,
}

/// Statistics about the version store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MvccStats {
    pub version_chains: usize,
    pub total_versions: usize,
    pub committed_versions: usize,
    pub aborted_versions: usize,
    pub pending_versions: usize,
    pub active_snapshots: usize,
    pub retained_footprints: usize,
}
