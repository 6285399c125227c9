//! Transaction manager: the facade over the version store and lock table.
//!
//! The manager allocates transaction ids, routes reads and writes to the
//! [`VersionStore`], routes explicit lock requests to the [`LockTable`] and
//! drives commit/abort across both. It never holds a transaction-table
//! entry while calling into either structure.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use log::{debug, info, warn};

use super::config::TransactionManagerConfig;
use super::error::{Result, TransactionError};
use super::id::{TransactionId, TransactionIdGenerator};
use super::state::{Transaction, TransactionState};
use crate::concurrency::{
    IsolationLevel, LockId, LockMode, LockTable, MvccStats, VacuumReport, VersionStore,
};

/// What callers hold between `begin` and `commit`/`abort`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionHandle {
    pub id: TransactionId,
    pub isolation: IsolationLevel,
}

impl std::fmt::Display for TransactionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.id, self.isolation)
    }
}

/// Statistics across the whole manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerStats {
    pub active_transactions: usize,
    pub total_transactions: usize,
    pub locked_resources: usize,
    pub mvcc: MvccStats,
}

/// The transaction manager handles the lifecycle of all transactions.
pub struct TransactionManager {
    config: TransactionManagerConfig,
    id_generator: TransactionIdGenerator,
    /// Active and finished transactions. Finished ones stay until purged.
    transactions: DashMap<TransactionId, Transaction>,
    versions: VersionStore,
    locks: LockTable,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self::with_config(TransactionManagerConfig::default())
    }

    pub fn with_config(config: TransactionManagerConfig) -> Self {
        let versions = VersionStore::new().with_write_skew_detection(config.detect_write_skew);
        Self {
            config,
            id_generator: TransactionIdGenerator::new(),
            transactions: DashMap::new(),
            versions,
            locks: LockTable::new(),
        }
    }

    pub fn config(&self) -> &TransactionManagerConfig {
        &self.config
    }

    /// Begins a new transaction. Never fails.
    pub fn begin(&self, isolation: IsolationLevel) -> TransactionHandle {
        let id = self.id_generator.next();
        let start_ts = self.versions.begin(id, isolation);
        self.transactions
            .insert(id, Transaction::new(id, isolation, start_ts));
        debug!("Started transaction {} with isolation level {}", id, isolation);
        TransactionHandle { id, isolation }
    }

    /// Begins a transaction at the configured default isolation level.
    pub fn begin_default(&self) -> TransactionHandle {
        self.begin(self.config.default_isolation)
    }

    /// Returns a copy of the transaction's current record.
    pub fn get(&self, id: TransactionId) -> Result<Transaction> {
        self.transactions
            .get(&id)
            .map(|txn| txn.value().clone())
            .ok_or(TransactionError::NotFound(id))
    }

    pub fn state(&self, id: TransactionId) -> Result<TransactionState> {
        self.transactions
            .get(&id)
            .map(|txn| txn.state)
            .ok_or(TransactionError::NotFound(id))
    }

    pub fn is_active(&self, id: TransactionId) -> bool {
        self.state(id).map(|state| state.is_active()).unwrap_or(false)
    }

    /// Isolation level of a transaction that may still operate.
    fn operable(&self, id: TransactionId) -> Result<IsolationLevel> {
        let txn = self
            .transactions
            .get(&id)
            .ok_or(TransactionError::NotFound(id))?;
        if self.config.enforce_terminal_state {
            txn.ensure_active()?;
        }
        Ok(txn.isolation)
    }

    /// Runs `f` while holding the transaction's entry.
    fn update<T, F>(&self, id: TransactionId, f: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction) -> Result<T>,
    {
        let mut txn = self
            .transactions
            .get_mut(&id)
            .ok_or(TransactionError::NotFound(id))?;
        f(&mut txn)
    }

    /// Reads `key` as seen by the transaction.
    ///
    /// Fails with `NotVisible` when no version satisfies the isolation
    /// level, whether or not the key ever existed.
    pub fn read(&self, handle: TransactionHandle, key: &str) -> Result<Bytes> {
        let isolation = self.operable(handle.id)?;
        let value = self.versions.read(handle.id, key, isolation);
        self.update(handle.id, |txn| {
            txn.stats.reads += 1;
            Ok(())
        })?;
        value.ok_or_else(|| TransactionError::NotVisible {
            key: key.to_string(),
        })
    }

    /// Writes a new version of `key`.
    pub fn write(&self, handle: TransactionHandle, key: &str, payload: impl Into<Bytes>) -> Result<()> {
        let isolation = self.operable(handle.id)?;
        let result = self.versions.write(handle.id, key, payload.into(), isolation);
        self.update(handle.id, |txn| {
            match &result {
                Ok(()) => txn.stats.writes += 1,
                Err(_) => txn.stats.conflicts += 1,
            }
            Ok(())
        })?;
        result
    }

    /// Commits the transaction.
    ///
    /// The transaction is moved to `Committing` before the version store is
    /// touched, so a concurrent `abort` is rejected rather than racing it.
    /// On validation failure the transaction becomes `Aborted`, but its
    /// versions and locks are left in place until [`abort`](Self::abort)
    /// is called.
    pub fn commit(&self, handle: TransactionHandle) -> Result<()> {
        let id = handle.id;
        let isolation = self.update(id, |txn| {
            txn.begin_commit()?;
            Ok(txn.isolation)
        })?;

        match self.versions.commit(id, isolation) {
            Ok(commit_ts) => {
                self.locks.release_all(id);
                self.versions.release_snapshot(id);
                let elapsed = self.update(id, |txn| {
                    txn.mark_committed(commit_ts)?;
                    Ok(txn.duration())
                })?;
                info!("Committed transaction {} at {} after {:?}", id, commit_ts, elapsed);
                Ok(())
            }
            Err(err) => {
                self.versions.release_snapshot(id);
                self.update(id, |txn| {
                    txn.stats.conflicts += 1;
                    txn.fail_commit()
                })?;
                warn!("Failed to commit transaction {}: {}", id, err);
                Err(err)
            }
        }
    }

    /// Aborts the transaction: its versions are flagged aborted and its
    /// locks released. Accepted again after a failed commit; rejected while
    /// a commit is in flight or after it succeeded.
    pub fn abort(&self, handle: TransactionHandle) -> Result<()> {
        let id = handle.id;
        let elapsed = self.update(id, |txn| {
            txn.mark_aborted()?;
            Ok(txn.duration())
        })?;

        let aborted = self.versions.abort(id);
        let released = self.locks.release_all(id);
        self.versions.release_snapshot(id);
        info!(
            "Rolled back transaction {} after {:?} ({} versions, {} locks)",
            id, elapsed, aborted, released
        );
        Ok(())
    }

    /// Acquires an explicit lock on behalf of the transaction.
    pub fn lock(&self, handle: TransactionHandle, resource: impl Into<LockId>, mode: LockMode) -> Result<()> {
        self.operable(handle.id)?;
        self.locks.acquire(handle.id, resource, mode)
    }

    /// Releases one explicit lock. Returns whether it was held.
    pub fn unlock(&self, handle: TransactionHandle, resource: &LockId) -> bool {
        self.locks.release(handle.id, resource)
    }

    pub fn lock_table(&self) -> &LockTable {
        &self.locks
    }

    pub fn version_store(&self) -> &VersionStore {
        &self.versions
    }

    /// Ids of all active transactions, ascending.
    pub fn active_transactions(&self) -> Vec<TransactionId> {
        let mut ids: Vec<TransactionId> = self
            .transactions
            .iter()
            .filter(|entry| entry.state.is_active())
            .map(|entry| *entry.key())
            .collect();
        ids.sort();
        ids
    }

    /// Total number of transactions tracked (active and finished).
    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    /// Forgets finished transactions. Returns how many were removed.
    pub fn purge_finished(&self) -> usize {
        let before = self.transactions.len();
        self.transactions.retain(|_, txn| !txn.state.is_finished());
        before - self.transactions.len()
    }

    /// Removes versions no active snapshot can see, then purges finished
    /// transactions.
    pub fn vacuum(&self) -> VacuumReport {
        let mut report = self.versions.vacuum();
        report.transactions_purged = self.purge_finished();
        report
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            active_transactions: self.active_transactions().len(),
            total_transactions: self.transaction_count(),
            locked_resources: self.locks.locked_resources(),
            mvcc: self.versions.stats(),
        }
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// A transaction that aborts itself on drop unless it was finished.
pub struct TransactionGuard {
    handle: TransactionHandle,
    manager: Arc<TransactionManager>,
    finished: bool,
}

impl TransactionGuard {
    pub fn begin(manager: Arc<TransactionManager>, isolation: IsolationLevel) -> Self {
        let handle = manager.begin(isolation);
        Self {
            handle,
            manager,
            finished: false,
        }
    }

    pub fn handle(&self) -> TransactionHandle {
        self.handle
    }

    pub fn id(&self) -> TransactionId {
        self.handle.id
    }

    pub fn read(&self, key: &str) -> Result<Bytes> {
        self.manager.read(self.handle, key)
    }

    pub fn write(&self, key: &str, payload: impl Into<Bytes>) -> Result<()> {
        self.manager.write(self.handle, key, payload)
    }

    pub fn lock(&self, resource: impl Into<LockId>, mode: LockMode) -> Result<()> {
        self.manager.lock(self.handle, resource, mode)
    }

    /// Commits. On failure the guard still aborts when dropped.
    pub fn commit(mut self) -> Result<()> {
        self.manager.commit(self.handle)?;
        self.finished = true;
        Ok(())
    }

    pub fn abort(mut self) -> Result<()> {
        self.finished = true;
        self.manager.abort(self.handle)
    }
}

impl Drop for TransactionGuard {
    fn drop(&mut self) {
        if !self.finished {
            // Best effort abort - ignore errors
            let _ = self.manager.abort(self.handle);
        }
    }
}
