//! Versioned records and per-key version chains.
//!
//! A [`VersionChain`] is append-only in creation order; readers scan it from
//! the newest record backwards. Records are never removed while a
//! transaction that might observe them is alive, only flagged
//! committed/aborted (see [`VersionChain::prune`] for the one exception).

use crate::concurrency::timestamp::Timestamp;
use crate::transaction::TransactionId;
use bytes::Bytes;

/// One immutable version of a key's value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedRecord {
    /// Transaction that wrote this version.
    pub owner: TransactionId,
    /// When the write happened.
    pub created_at: Timestamp,
    /// When the owner committed; equals `created_at` until then.
    pub commit_ts: Timestamp,
    /// Opaque value.
    pub payload: Bytes,
    pub committed: bool,
    pub aborted: bool,
}

impl VersionedRecord {
    /// Creates a pending (uncommitted) record.
    pub fn new(owner: TransactionId, created_at: Timestamp, payload: Bytes) -> Self {
        Self {
            owner,
            created_at,
            commit_ts: created_at,
            payload,
            committed: false,
            aborted: false,
        }
    }

    /// Neither committed nor aborted yet.
    pub fn is_pending(&self) -> bool {
        !self.committed && !self.aborted
    }

    pub fn created_by(&self, tid: TransactionId) -> bool {
        self.owner == tid
    }
}

/// All versions of one key, oldest first.
#[derive(Debug, Clone, Default)]
pub struct VersionChain {
    records: Vec<VersionedRecord>,
}

impl VersionChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a new pending record for `owner`.
    ///
    /// Any earlier pending record of the same owner is flagged aborted first,
    /// so at most one record per transaction takes part in commit.
    pub fn append(&mut self, owner: TransactionId, created_at: Timestamp, payload: Bytes) {
        for record in self.records.iter_mut() {
            if record.created_by(owner) && record.is_pending() {
                record.aborted = true;
            }
        }
        self.records
            .push(VersionedRecord::new(owner, created_at, payload));
    }

    /// Iterates from the newest record to the oldest.
    pub fn newest_first(&self) -> impl Iterator<Item = &VersionedRecord> {
        self.records.iter().rev()
    }

    /// Flips every pending record of `owner` to committed at `commit_ts`.
    ///
    /// Returns the number of records committed.
    pub fn commit(&mut self, owner: TransactionId, commit_ts: Timestamp) -> usize {
        let mut count = 0;
        for record in self.records.iter_mut() {
            if record.created_by(owner) && record.is_pending() {
                record.committed = true;
                record.commit_ts = commit_ts;
                count += 1;
            }
        }
        count
    }

    /// Flags every not-yet-committed record of `owner` as aborted.
    ///
    /// Returns the number of records newly aborted.
    pub fn abort(&mut self, owner: TransactionId) -> usize {
        let mut count = 0;
        for record in self.records.iter_mut() {
            if record.created_by(owner) && record.is_pending() {
                record.aborted = true;
                count += 1;
            }
        }
        count
    }

    /// Drops records no live transaction can observe.
    ///
    /// Removes every aborted record, and every committed record that is
    /// shadowed by a newer committed record whose `commit_ts <= horizon`.
    /// Pending records and everything committed after the horizon stay.
    pub fn prune(&mut self, horizon: Timestamp) -> usize {
        let keep_from = self
            .records
            .iter()
            .filter(|record| record.committed && record.commit_ts <= horizon)
            .map(|record| record.commit_ts)
            .max();

        let before = self.records.len();
        self.records.retain(|record| {
            if record.aborted {
                return false;
            }
            match keep_from {
                Some(floor) if record.committed => record.commit_ts >= floor,
                _ => true,
            }
        });
        before - self.records.len()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tid(id: u64) -> TransactionId {
        TransactionId::new(id)
    }

    fn payloads(chain: &VersionChain) -> Vec<&[u8]> {
        chain.newest_first().map(|r| r.payload.as_ref()).collect()
    }

    #[test]
    fn test_record_starts_pending() {
        let record = VersionedRecord::new(tid(1), Timestamp::new(10), Bytes::from_static(b"a"));
        assert!(record.is_pending());
        assert_eq!(record.commit_ts, record.created_at);
        assert!(record.created_by(tid(1)));
    }

    #[test]
    fn test_chain_newest_first() {
        let mut chain = VersionChain::new();
        chain.append(tid(1), Timestamp::new(1), Bytes::from_static(b"1"));
        chain.append(tid(2), Timestamp::new(2), Bytes::from_static(b"2"));
        chain.append(tid(3), Timestamp::new(3), Bytes::from_static(b"3"));

        assert_eq!(payloads(&chain), vec![&b"3"[..], &b"2"[..], &b"1"[..]]);
        assert_eq!(chain.len(), 3);
    }

    #[test]
    fn test_rewrite_supersedes_own_pending_record() {
        let mut chain = VersionChain::new();
        chain.append(tid(1), Timestamp::new(1), Bytes::from_static(b"first"));
        chain.append(tid(1), Timestamp::new(2), Bytes::from_static(b"second"));

        assert_eq!(chain.len(), 2);
        let pending: Vec<_> = chain.newest_first().filter(|r| r.is_pending()).collect();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload, Bytes::from_static(b"second"));

        assert_eq!(chain.commit(tid(1), Timestamp::new(5)), 1);
        let committed: Vec<_> = chain.newest_first().filter(|r| r.committed).collect();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].payload, Bytes::from_static(b"second"));
    }

    #[test]
    fn test_commit_and_abort_only_touch_owner() {
        let mut chain = VersionChain::new();
        chain.append(tid(1), Timestamp::new(1), Bytes::from_static(b"a"));
        chain.append(tid(2), Timestamp::new(2), Bytes::from_static(b"b"));

        assert_eq!(chain.commit(tid(1), Timestamp::new(3)), 1);
        assert_eq!(chain.abort(tid(2)), 1);
        // Committed records are not aborted afterwards.
        assert_eq!(chain.abort(tid(1)), 0);

        let latest = chain.newest_first().find(|r| r.committed).unwrap();
        assert_eq!(latest.owner, tid(1));
        assert_eq!(latest.commit_ts, Timestamp::new(3));
        assert!(chain.newest_first().next().unwrap().aborted);
    }

    #[test]
    fn test_prune_keeps_visible_versions() {
        let mut chain = VersionChain::new();
        chain.append(tid(1), Timestamp::new(1), Bytes::from_static(b"1"));
        chain.commit(tid(1), Timestamp::new(2));
        chain.append(tid(2), Timestamp::new(3), Bytes::from_static(b"2"));
        chain.commit(tid(2), Timestamp::new(4));
        chain.append(tid(3), Timestamp::new(5), Bytes::from_static(b"x"));
        chain.abort(tid(3));
        chain.append(tid(4), Timestamp::new(6), Bytes::from_static(b"3"));
        chain.commit(tid(4), Timestamp::new(7));
        chain.append(tid(5), Timestamp::new(8), Bytes::from_static(b"p"));

        // Horizon 5: version "2" (ts4) is the newest visible at the horizon.
        let removed = chain.prune(Timestamp::new(5));

        assert_eq!(removed, 2);
        assert_eq!(payloads(&chain), vec![&b"p"[..], &b"3"[..], &b"2"[..]]);
    }

    #[test]
    fn test_prune_without_committed_history() {
        let mut chain = VersionChain::new();
        chain.append(tid(1), Timestamp::new(1), Bytes::from_static(b"p"));

        assert_eq!(chain.prune(Timestamp::new(10)), 0);
        assert_eq!(chain.len(), 1);
    }
}
