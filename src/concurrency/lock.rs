//! Explicit shared/exclusive locking.
//!
//! The lock table is independent of the version store: callers take locks
//! on resources that need mutual exclusion beyond value-level versioning,
//! such as structural changes to a table. Requests never wait. A request
//! that cannot be granted immediately is denied and the caller retries.

use crate::transaction::{Result, TransactionError, TransactionId};
use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Lock modes supported by the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    /// Checks if this lock mode is compatible with another.
    pub fn is_compatible_with(&self, other: &LockMode) -> bool {
        matches!((self, other), (LockMode::Shared, LockMode::Shared))
    }
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockMode::Shared => write!(f, "Shared"),
            LockMode::Exclusive => write!(f, "Exclusive"),
        }
    }
}

/// Identifier of a lockable resource, e.g. `table:users`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockId(String);

impl LockId {
    pub fn new(resource: impl Into<String>) -> Self {
        Self(resource.into())
    }

    /// Lock on a whole table.
    pub fn table(name: &str) -> Self {
        Self(format!("table:{}", name))
    }

    /// Lock on a single key.
    pub fn key(key: &str) -> Self {
        Self(format!("key:{}", key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LockId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for LockId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A granted lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockHolder {
    pub tid: TransactionId,
    pub mode: LockMode,
}

#[derive(Debug, Default)]
struct LockState {
    /// Holders per resource. Invariant: an Exclusive holder is the only one.
    resources: HashMap<LockId, Vec<LockHolder>>,
    /// Reverse index used for bulk release.
    held: HashMap<TransactionId, HashSet<LockId>>,
}

/// Table of granted locks.
#[derive(Debug, Default)]
pub struct LockTable {
    state: Mutex<LockState>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grants `mode` on `resource` to `tid`, or fails with `Denied`.
    ///
    /// Holding any lock on the resource already satisfies the request; a
    /// Shared holder asking for Exclusive is not escalated.
    pub fn acquire(&self, tid: TransactionId, resource: impl Into<LockId>, mode: LockMode) -> Result<()> {
        let resource = resource.into();
        let mut state = self.state.lock();

        if state
            .held
            .get(&tid)
            .is_some_and(|resources| resources.contains(&resource))
        {
            debug!("{} already holds a lock on {}", tid, resource);
            return Ok(());
        }

        let blocked = state.resources.get(&resource).is_some_and(|holders| {
            holders
                .iter()
                .any(|holder| holder.tid != tid && !holder.mode.is_compatible_with(&mode))
        });
        if blocked {
            warn!("{} denied {} lock on {}", tid, mode, resource);
            return Err(TransactionError::Denied { id: tid, resource, mode });
        }

        state
            .resources
            .entry(resource.clone())
            .or_default()
            .push(LockHolder { tid, mode });
        debug!("{} acquired {} lock on {}", tid, mode, resource);
        state.held.entry(tid).or_default().insert(resource);
        Ok(())
    }

    /// Releases `tid`'s lock on `resource`. Returns whether a lock was held.
    pub fn release(&self, tid: TransactionId, resource: &LockId) -> bool {
        let mut state = self.state.lock();

        if let Some(resources) = state.held.get_mut(&tid) {
            resources.remove(resource);
            if resources.is_empty() {
                state.held.remove(&tid);
            }
        }

        let released = Self::remove_holder(&mut state.resources, tid, resource);
        if released {
            debug!("{} released lock on {}", tid, resource);
        }
        released
    }

    /// Releases every lock `tid` holds. Returns how many were released.
    pub fn release_all(&self, tid: TransactionId) -> usize {
        let mut state = self.state.lock();
        let Some(resources) = state.held.remove(&tid) else {
            return 0;
        };

        let mut released = 0;
        for resource in &resources {
            if Self::remove_holder(&mut state.resources, tid, resource) {
                released += 1;
            }
        }
        debug!("{} released {} locks", tid, released);
        released
    }

    fn remove_holder(
        resources: &mut HashMap<LockId, Vec<LockHolder>>,
        tid: TransactionId,
        resource: &LockId,
    ) -> bool {
        let Some(holders) = resources.get_mut(resource) else {
            return false;
        };
        let before = holders.len();
        holders.retain(|holder| holder.tid != tid);
        let removed = holders.len() != before;
        if holders.is_empty() {
            resources.remove(resource);
        }
        removed
    }

    /// Resources currently locked by `tid`.
    pub fn held_locks(&self, tid: TransactionId) -> Vec<LockId> {
        let mut locks: Vec<LockId> = self
            .state
            .lock()
            .held
            .get(&tid)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        locks.sort();
        locks
    }

    /// Current holders of `resource`.
    pub fn holders(&self, resource: &LockId) -> Vec<LockHolder> {
        self.state
            .lock()
            .resources
            .get(resource)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether `tid` holds `resource` in a mode covering `mode`.
    pub fn has_lock(&self, tid: TransactionId, resource: &LockId, mode: LockMode) -> bool {
        self.state
            .lock()
            .resources
            .get(resource)
            .is_some_and(|holders| {
                holders.iter().any(|h| {
                    h.tid == tid && (h.mode == mode || h.mode == LockMode::Exclusive)
                })
            })
    }

    /// Number of resources with at least one holder.
    pub fn locked_resources(&self) -> usize {
        self.state.lock().resources.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn tid(id: u64) -> TransactionId {
        TransactionId::new(id)
    }

    #[test]
    fn test_lock_compatibility() {
        assert!(LockMode::Shared.is_compatible_with(&LockMode::Shared));
        assert!(!LockMode::Shared.is_compatible_with(&LockMode::Exclusive));
        assert!(!LockMode::Exclusive.is_compatible_with(&LockMode::Shared));
        assert!(!LockMode::Exclusive.is_compatible_with(&LockMode::Exclusive));
    }

    #[test]
    fn test_lock_id_constructors() {
        assert_eq!(LockId::table("users").as_str(), "table:users");
        assert_eq!(LockId::key("x").to_string(), "key:x");
        assert_eq!(LockId::from("table:users"), LockId::table("users"));
    }

    #[test]
    fn test_basic_acquire_release() {
        let table = LockTable::new();
        let users = LockId::table("users");

        table.acquire(tid(1), users.clone(), LockMode::Shared).unwrap();
        assert!(table.has_lock(tid(1), &users, LockMode::Shared));
        assert!(!table.has_lock(tid(1), &users, LockMode::Exclusive));

        assert!(table.release(tid(1), &users));
        assert!(!table.has_lock(tid(1), &users, LockMode::Shared));
        assert_eq!(table.locked_resources(), 0);
        assert!(!table.release(tid(1), &users));
    }

    #[test]
    fn test_multiple_shared_locks() {
        let table = LockTable::new();
        let users = LockId::table("users");

        for id in 1..=3 {
            table.acquire(tid(id), users.clone(), LockMode::Shared).unwrap();
        }
        assert_eq!(table.holders(&users).len(), 3);

        // Exclusive is denied while others share.
        let err = table.acquire(tid(4), users.clone(), LockMode::Exclusive).unwrap_err();
        assert!(matches!(err, TransactionError::Denied { mode: LockMode::Exclusive, .. }));
    }

    #[test]
    fn test_exclusive_denies_others_without_waiting() {
        let table = LockTable::new();
        let users = LockId::table("users");

        table.acquire(tid(1), users.clone(), LockMode::Exclusive).unwrap();
        assert!(table.acquire(tid(2), users.clone(), LockMode::Shared).is_err());
        assert!(table.acquire(tid(2), users.clone(), LockMode::Exclusive).is_err());

        table.release(tid(1), &users);
        table.acquire(tid(2), users.clone(), LockMode::Shared).unwrap();
    }

    #[test]
    fn test_reacquire_is_already_satisfied() {
        let table = LockTable::new();
        let users = LockId::table("users");

        table.acquire(tid(1), users.clone(), LockMode::Shared).unwrap();
        table.acquire(tid(1), users.clone(), LockMode::Exclusive).unwrap();

        // Mode is not escalated.
        let holders = table.holders(&users);
        assert_eq!(holders, vec![LockHolder { tid: tid(1), mode: LockMode::Shared }]);
        assert!(table.acquire(tid(2), users.clone(), LockMode::Shared).is_ok());
    }

    #[test]
    fn test_sole_shared_holder_may_take_exclusive_elsewhere() {
        let table = LockTable::new();
        table.acquire(tid(1), "a", LockMode::Shared).unwrap();
        table.acquire(tid(1), "b", LockMode::Exclusive).unwrap();
        assert_eq!(table.held_locks(tid(1)), vec![LockId::from("a"), LockId::from("b")]);
    }

    #[test]
    fn test_release_all() {
        let table = LockTable::new();
        table.acquire(tid(1), LockId::table("users"), LockMode::Shared).unwrap();
        table.acquire(tid(1), LockId::key("x"), LockMode::Exclusive).unwrap();
        table.acquire(tid(2), LockId::table("users"), LockMode::Shared).unwrap();

        assert_eq!(table.release_all(tid(1)), 2);
        assert!(table.held_locks(tid(1)).is_empty());
        assert_eq!(table.holders(&LockId::table("users")).len(), 1);
        assert_eq!(table.locked_resources(), 1);

        // No locks: a no-op.
        assert_eq!(table.release_all(tid(1)), 0);
        assert_eq!(table.release_all(tid(42)), 0);
    }

    #[test]
    fn test_exclusive_mutual_exclusion_under_contention() {
        let table = Arc::new(LockTable::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|i| {
                let table = Arc::clone(&table);
                let inside = Arc::clone(&inside);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let me = tid(i as u64 + 1);
                    let resource = LockId::table("users");
                    barrier.wait();
                    let mut granted = 0;
                    for _ in 0..200 {
                        if table.acquire(me, resource.clone(), LockMode::Exclusive).is_ok() {
                            assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                            granted += 1;
                            inside.fetch_sub(1, Ordering::SeqCst);
                            table.release(me, &resource);
                        }
                    }
                    granted
                })
            })
            .collect();

        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert!(total > 0);
        assert_eq!(table.locked_resources(), 0);
    }
}
