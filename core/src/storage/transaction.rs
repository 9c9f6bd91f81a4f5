//! Transaction management
//!
//! A [`Transaction`] carries a change log. Code that mutates non-durable state
//! while a transaction is open registers a [`Change`] describing how to finalize
//! or undo that mutation; the change fires exactly once, when the transaction
//! commits or rolls back.

use crate::error::{CatalogError, CatalogResult};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};
use tracing::debug;

/// Transaction identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxnId(pub u64);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

/// Transaction states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    Aborted,
}

/// Database lock modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Commit/rollback callback registered against a transaction.
///
/// Exactly one of the two entry points runs, and the change is consumed by it.
pub trait Change: Send {
    fn commit(self: Box<Self>);
    fn rollback(self: Box<Self>);
}

/// A database transaction
pub struct Transaction {
    pub id: TxnId,
    state: RwLock<TransactionState>,
    changes: Mutex<Vec<Box<dyn Change>>>,
    held_locks: RwLock<HashMap<String, LockMode>>,
    lock_manager: Arc<LockManager>,
    active_count: Arc<AtomicUsize>,
}

impl Transaction {
    fn new(id: TxnId, lock_manager: Arc<LockManager>, active_count: Arc<AtomicUsize>) -> Self {
        active_count.fetch_add(1, Ordering::SeqCst);
        Self {
            id,
            state: RwLock::new(TransactionState::Active),
            changes: Mutex::new(Vec::new()),
            held_locks: RwLock::new(HashMap::new()),
            lock_manager,
            active_count,
        }
    }

    pub fn state(&self) -> TransactionState {
        *self.state.read()
    }

    /// Check if transaction is active
    pub fn is_active(&self) -> bool {
        self.state() == TransactionState::Active
    }

    pub fn ensure_active(&self) -> CatalogResult<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(CatalogError::Transaction(format!(
                "{} is not active ({:?})",
                self.id,
                self.state()
            )))
        }
    }

    /// Add a change to the log. Fails once the transaction has finished.
    pub fn register_change(&self, change: Box<dyn Change>) -> CatalogResult<()> {
        self.ensure_active()?;
        self.changes.lock().push(change);
        Ok(())
    }

    /// Number of changes waiting for commit or rollback.
    pub fn pending_changes(&self) -> usize {
        self.changes.lock().len()
    }

    /// Lock a database for the rest of this transaction.
    pub fn lock_database(&self, db: &str, mode: LockMode) -> CatalogResult<()> {
        self.ensure_active()?;
        match mode {
            LockMode::Shared => self.lock_manager.acquire_shared(self.id, db)?,
            LockMode::Exclusive => self.lock_manager.acquire_exclusive(self.id, db)?,
        }

        let mut held = self.held_locks.write();
        let entry = held.entry(db.to_string()).or_insert(mode);
        if mode == LockMode::Exclusive {
            *entry = LockMode::Exclusive;
        }
        Ok(())
    }

    pub fn is_db_locked_exclusive(&self, db: &str) -> bool {
        self.held_locks.read().get(db) == Some(&LockMode::Exclusive)
    }

    /// Commit: fire every change's commit in registration order.
    pub fn commit(self) -> CatalogResult<()> {
        self.finish(TransactionState::Committed)
    }

    /// Abort: fire every change's rollback, newest first.
    pub fn abort(self) -> CatalogResult<()> {
        self.finish(TransactionState::Aborted)
    }

    fn finish(&self, outcome: TransactionState) -> CatalogResult<()> {
        {
            let mut state = self.state.write();
            if *state != TransactionState::Active {
                return Err(CatalogError::Transaction(format!(
                    "{} already finished ({:?})",
                    self.id, *state
                )));
            }
            *state = outcome;
        }

        let changes = std::mem::take(&mut *self.changes.lock());
        debug!(txn = %self.id, ?outcome, changes = changes.len(), "finishing transaction");

        match outcome {
            TransactionState::Committed => {
                for change in changes {
                    change.commit();
                }
            }
            _ => {
                for change in changes.into_iter().rev() {
                    change.rollback();
                }
            }
        }

        self.lock_manager.release_all(self.id);
        self.held_locks.write().clear();
        self.active_count.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.is_active() {
            debug!(txn = %self.id, "transaction dropped while active, rolling back");
            let _ = self.finish(TransactionState::Aborted);
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("pending_changes", &self.pending_changes())
            .finish()
    }
}

/// Database-level lock manager. Conflicting requests fail immediately.
pub struct LockManager {
    locks: RwLock<HashMap<String, LockInfo>>,
}

#[derive(Debug)]
struct LockInfo {
    exclusive_holder: Option<TxnId>,
    shared_holders: HashSet<TxnId>,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            locks: RwLock::new(HashMap::new()),
        }
    }

    /// Acquire a shared lock
    pub fn acquire_shared(&self, txn_id: TxnId, db: &str) -> CatalogResult<()> {
        let mut locks = self.locks.write();
        let lock_info = locks.entry(db.to_string()).or_insert_with(|| LockInfo {
            exclusive_holder: None,
            shared_holders: HashSet::new(),
        });

        if let Some(holder) = lock_info.exclusive_holder {
            if holder == txn_id {
                return Ok(());
            }
            return Err(CatalogError::Transaction(format!(
                "database '{}' is exclusively locked by {}",
                db, holder
            )));
        }

        lock_info.shared_holders.insert(txn_id);
        Ok(())
    }

    /// Acquire an exclusive lock
    pub fn acquire_exclusive(&self, txn_id: TxnId, db: &str) -> CatalogResult<()> {
        let mut locks = self.locks.write();
        let lock_info = locks.entry(db.to_string()).or_insert_with(|| LockInfo {
            exclusive_holder: None,
            shared_holders: HashSet::new(),
        });

        if let Some(holder) = lock_info.exclusive_holder
            && holder != txn_id
        {
            return Err(CatalogError::Transaction(format!(
                "database '{}' is already exclusively locked by {}",
                db, holder
            )));
        }

        if !lock_info.shared_holders.is_empty()
            && !(lock_info.shared_holders.len() == 1 && lock_info.shared_holders.contains(&txn_id))
        {
            return Err(CatalogError::Transaction(format!(
                "database '{}' has other shared lock holders",
                db
            )));
        }

        lock_info.exclusive_holder = Some(txn_id);
        lock_info.shared_holders.remove(&txn_id);
        Ok(())
    }

    /// Release all locks held by a transaction
    pub fn release_all(&self, txn_id: TxnId) {
        let mut locks = self.locks.write();

        locks.retain(|_, lock_info| {
            lock_info.shared_holders.remove(&txn_id);
            if lock_info.exclusive_holder == Some(txn_id) {
                lock_info.exclusive_holder = None;
            }

            !lock_info.shared_holders.is_empty() || lock_info.exclusive_holder.is_some()
        });
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Transaction manager
pub struct TransactionManager {
    next_txn_id: AtomicU64,
    active_transactions: Arc<AtomicUsize>,
    lock_manager: Arc<LockManager>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            next_txn_id: AtomicU64::new(1),
            active_transactions: Arc::new(AtomicUsize::new(0)),
            lock_manager: Arc::new(LockManager::new()),
        }
    }

    /// Begin a new transaction
    pub fn begin(&self) -> Transaction {
        let txn_id = TxnId(self.next_txn_id.fetch_add(1, Ordering::SeqCst));
        Transaction::new(
            txn_id,
            Arc::clone(&self.lock_manager),
            Arc::clone(&self.active_transactions),
        )
    }

    /// Commit a transaction
    pub fn commit(&self, txn: Transaction) -> CatalogResult<()> {
        txn.commit()
    }

    /// Abort a transaction
    pub fn abort(&self, txn: Transaction) -> CatalogResult<()> {
        txn.abort()
    }

    /// Get active transaction count
    pub fn active_transaction_count(&self) -> usize {
        self.active_transactions.load(Ordering::SeqCst)
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}
