//! Per-transaction snapshots and serializable commit footprints.
//!
//! A [`Snapshot`] pins the start timestamp of a REPEATABLE_READ,
//! SERIALIZABLE or SNAPSHOT transaction and remembers what it read and
//! wrote. When a SERIALIZABLE transaction commits, its read and write keys
//! are kept as a [`CommitFootprint`] so later committers that overlapped
//! with it can be checked for write skew.

use crate::concurrency::isolation::IsolationLevel;
use crate::concurrency::timestamp::Timestamp;
use crate::concurrency::version::VersionedRecord;
use crate::transaction::TransactionId;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

/// Point-in-time view held by one transaction.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub transaction_id: TransactionId,
    pub isolation: IsolationLevel,
    /// Transaction start time.
    pub timestamp: Timestamp,
    /// First version returned for each key read.
    pub read_versions: HashMap<String, VersionedRecord>,
    /// Keys written.
    pub write_set: HashSet<String>,
    /// Every key read under SERIALIZABLE, whether or not a version was found.
    pub predicate_reads: HashSet<String>,
}

impl Snapshot {
    pub fn new(transaction_id: TransactionId, isolation: IsolationLevel, timestamp: Timestamp) -> Self {
        Self {
            transaction_id,
            isolation,
            timestamp,
            read_versions: HashMap::new(),
            write_set: HashSet::new(),
            predicate_reads: HashSet::new(),
        }
    }

    /// All keys this transaction depends on having read.
    fn read_keys(&self) -> HashSet<String> {
        self.read_versions
            .keys()
            .chain(self.predicate_reads.iter())
            .cloned()
            .collect()
    }
}

/// Read/write keys of a committed SERIALIZABLE transaction.
#[derive(Debug, Clone)]
pub struct CommitFootprint {
    pub transaction_id: TransactionId,
    pub start_ts: Timestamp,
    pub commit_ts: Timestamp,
    pub read_keys: HashSet<String>,
    pub write_keys: HashSet<String>,
}

impl CommitFootprint {
    /// Whether this footprint and a committing transaction form a
    /// rw-antidependency cycle: each read something the other wrote.
    fn forms_cycle_with(&self, reads: &HashSet<String>, writes: &HashSet<String>) -> bool {
        !reads.is_disjoint(&self.write_keys) && !self.read_keys.is_disjoint(writes)
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    snapshots: HashMap<TransactionId, Snapshot>,
    footprints: Vec<CommitFootprint>,
}

/// Owns the snapshot of every active transaction that needs one.
#[derive(Debug, Default)]
pub struct SnapshotRegistry {
    state: Mutex<RegistryState>,
}

impl SnapshotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the snapshot for `tid`, replacing any previous one.
    pub fn create(&self, tid: TransactionId, isolation: IsolationLevel, timestamp: Timestamp) {
        self.state
            .lock()
            .snapshots
            .insert(tid, Snapshot::new(tid, isolation, timestamp));
    }

    /// Destroys the snapshot of `tid`, returning it.
    pub fn remove(&self, tid: TransactionId) -> Option<Snapshot> {
        self.state.lock().snapshots.remove(&tid)
    }

    pub fn get(&self, tid: TransactionId) -> Option<Snapshot> {
        self.state.lock().snapshots.get(&tid).cloned()
    }

    /// Start timestamp of `tid`'s snapshot.
    pub fn timestamp(&self, tid: TransactionId) -> Option<Timestamp> {
        self.state.lock().snapshots.get(&tid).map(|s| s.timestamp)
    }

    /// Version `tid` already read for `key`, if any.
    pub fn cached_read(&self, tid: TransactionId, key: &str) -> Option<VersionedRecord> {
        self.state
            .lock()
            .snapshots
            .get(&tid)
            .and_then(|s| s.read_versions.get(key).cloned())
    }

    /// Records a read; the first version recorded for a key wins.
    ///
    /// Returns the version now cached for the key, or `None` when `tid`
    /// has no snapshot.
    pub fn record_read(
        &self,
        tid: TransactionId,
        key: &str,
        record: &VersionedRecord,
    ) -> Option<VersionedRecord> {
        let mut state = self.state.lock();
        let snapshot = state.snapshots.get_mut(&tid)?;
        Some(
            snapshot
                .read_versions
                .entry(key.to_string())
                .or_insert_with(|| record.clone())
                .clone(),
        )
    }

    /// Registers `key` in the phantom-tracking predicate set.
    pub fn register_predicate(&self, tid: TransactionId, key: &str) {
        if let Some(snapshot) = self.state.lock().snapshots.get_mut(&tid) {
            snapshot.predicate_reads.insert(key.to_string());
        }
    }

    pub fn record_write(&self, tid: TransactionId, key: &str) {
        if let Some(snapshot) = self.state.lock().snapshots.get_mut(&tid) {
            snapshot.write_set.insert(key.to_string());
        }
    }

    pub fn has_written(&self, tid: TransactionId, key: &str) -> bool {
        self.state
            .lock()
            .snapshots
            .get(&tid)
            .is_some_and(|s| s.write_set.contains(key))
    }

    /// Snapshot timestamp plus a copy of the recorded reads, for validation.
    pub fn read_versions(&self, tid: TransactionId) -> Option<(Timestamp, Vec<(String, VersionedRecord)>)> {
        let state = self.state.lock();
        let snapshot = state.snapshots.get(&tid)?;
        let reads = snapshot
            .read_versions
            .iter()
            .map(|(key, record)| (key.clone(), record.clone()))
            .collect();
        Some((snapshot.timestamp, reads))
    }

    /// Finds a committed SERIALIZABLE transaction that overlapped with `tid`
    /// and forms a read/write cycle with it.
    pub fn find_write_skew(&self, tid: TransactionId) -> Option<CommitFootprint> {
        let state = self.state.lock();
        let snapshot = state.snapshots.get(&tid)?;
        if snapshot.write_set.is_empty() {
            return None;
        }
        let reads = snapshot.read_keys();

        state
            .footprints
            .iter()
            .filter(|f| f.transaction_id != tid && f.commit_ts > snapshot.timestamp)
            .find(|f| f.forms_cycle_with(&reads, &snapshot.write_set))
            .cloned()
    }

    /// Keeps the read/write keys of a committed SERIALIZABLE transaction.
    pub fn record_footprint(&self, tid: TransactionId, commit_ts: Timestamp) {
        let mut state = self.state.lock();
        let Some(snapshot) = state.snapshots.get(&tid) else {
            return;
        };
        if snapshot.isolation != IsolationLevel::Serializable {
            return;
        }
        let footprint = CommitFootprint {
            transaction_id: tid,
            start_ts: snapshot.timestamp,
            commit_ts,
            read_keys: snapshot.read_keys(),
            write_keys: snapshot.write_set.clone(),
        };
        state.footprints.push(footprint);
    }

    /// Oldest start timestamp among live snapshots.
    pub fn oldest_active(&self) -> Option<Timestamp> {
        self.state
            .lock()
            .snapshots
            .values()
            .map(|s| s.timestamp)
            .min()
    }

    /// Drops footprints no live snapshot can overlap with.
    pub fn prune_footprints(&self, horizon: Timestamp) -> usize {
        let mut state = self.state.lock();
        let before = state.footprints.len();
        state.footprints.retain(|f| f.commit_ts > horizon);
        before - state.footprints.len()
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().snapshots.len()
    }

    pub fn footprint_count(&self) -> usize {
        self.state.lock().footprints.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn tid(id: u64) -> TransactionId {
        TransactionId::new(id)
    }

    fn committed(owner: u64, payload: &'static [u8], commit_ts: u64) -> VersionedRecord {
        let mut record = VersionedRecord::new(tid(owner), Timestamp::new(1), Bytes::from_static(payload));
        record.committed = true;
        record.commit_ts = Timestamp::new(commit_ts);
        record
    }

    #[test]
    fn test_snapshot_lifecycle() {
        let registry = SnapshotRegistry::new();
        registry.create(tid(1), IsolationLevel::Snapshot, Timestamp::new(5));

        assert!(registry.get(tid(1)).is_some());
        assert_eq!(registry.timestamp(tid(1)), Some(Timestamp::new(5)));
        assert_eq!(registry.active_count(), 1);

        let removed = registry.remove(tid(1)).unwrap();
        assert_eq!(removed.timestamp, Timestamp::new(5));
        assert!(registry.get(tid(1)).is_none());
        assert_eq!(registry.timestamp(tid(1)), None);
    }

    #[test]
    fn test_first_read_wins() {
        let registry = SnapshotRegistry::new();
        registry.create(tid(1), IsolationLevel::RepeatableRead, Timestamp::new(5));

        let first = committed(7, b"100", 3);
        let second = committed(8, b"90", 6);

        assert_eq!(registry.record_read(tid(1), "bal", &first), Some(first.clone()));
        assert_eq!(registry.record_read(tid(1), "bal", &second), Some(first.clone()));
        assert_eq!(registry.cached_read(tid(1), "bal"), Some(first));
    }

    #[test]
    fn test_record_read_without_snapshot() {
        let registry = SnapshotRegistry::new();
        assert_eq!(registry.record_read(tid(1), "k", &committed(2, b"v", 1)), None);
        assert_eq!(registry.cached_read(tid(1), "k"), None);
    }

    #[test]
    fn test_write_skew_cycle_detected() {
        let registry = SnapshotRegistry::new();
        registry.create(tid(1), IsolationLevel::Serializable, Timestamp::new(1));
        registry.create(tid(2), IsolationLevel::Serializable, Timestamp::new(2));

        // T1 reads x, writes y. T2 reads y, writes x.
        registry.register_predicate(tid(1), "x");
        registry.record_write(tid(1), "y");
        registry.register_predicate(tid(2), "y");
        registry.record_write(tid(2), "x");

        assert!(registry.find_write_skew(tid(1)).is_none());
        registry.record_footprint(tid(1), Timestamp::new(3));
        registry.remove(tid(1));

        let footprint = registry.find_write_skew(tid(2)).unwrap();
        assert_eq!(footprint.transaction_id, tid(1));
        assert_eq!(footprint.start_ts, Timestamp::new(1));
        assert_eq!(footprint.commit_ts, Timestamp::new(3));
    }

    #[test]
    fn test_no_skew_without_cycle_or_overlap() {
        let registry = SnapshotRegistry::new();
        registry.create(tid(1), IsolationLevel::Serializable, Timestamp::new(1));
        registry.register_predicate(tid(1), "x");
        registry.record_write(tid(1), "y");
        registry.record_footprint(tid(1), Timestamp::new(3));
        registry.remove(tid(1));

        // Started after T1 committed: not concurrent.
        registry.create(tid(2), IsolationLevel::Serializable, Timestamp::new(4));
        registry.register_predicate(tid(2), "y");
        registry.record_write(tid(2), "x");
        assert!(registry.find_write_skew(tid(2)).is_none());

        // Concurrent, but only one direction of dependency.
        registry.create(tid(3), IsolationLevel::Serializable, Timestamp::new(2));
        registry.register_predicate(tid(3), "y");
        registry.record_write(tid(3), "z");
        assert!(registry.find_write_skew(tid(3)).is_none());
    }

    #[test]
    fn test_footprints_only_for_serializable() {
        let registry = SnapshotRegistry::new();
        registry.create(tid(1), IsolationLevel::Snapshot, Timestamp::new(1));
        registry.record_write(tid(1), "x");
        registry.record_footprint(tid(1), Timestamp::new(2));
        assert_eq!(registry.footprint_count(), 0);

        registry.create(tid(2), IsolationLevel::Serializable, Timestamp::new(3));
        registry.record_write(tid(2), "x");
        registry.record_footprint(tid(2), Timestamp::new(4));
        assert_eq!(registry.footprint_count(), 1);

        assert_eq!(registry.prune_footprints(Timestamp::new(3)), 0);
        assert_eq!(registry.prune_footprints(Timestamp::new(4)), 1);
        assert_eq!(registry.footprint_count(), 0);
    }

    #[test]
    fn test_oldest_active() {
        let registry = SnapshotRegistry::new();
        assert_eq!(registry.oldest_active(), None);

        registry.create(tid(1), IsolationLevel::Snapshot, Timestamp::new(9));
        registry.create(tid(2), IsolationLevel::RepeatableRead, Timestamp::new(4));
        assert_eq!(registry.oldest_active(), Some(Timestamp::new(4)));
    }
}
