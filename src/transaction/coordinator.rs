//! Transaction lifecycle: Active → Committed | RolledBack, with Poisoned for
//! a rollback that could not restore consistency.
//!
//! Committed and rolled-back transactions stay inspectable until the oldest
//! are evicted past the retention limit. Poisoned ones are kept for the life
//! of the coordinator.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::error::{CoordError, Result};
use crate::lock::{LockManager, RetryConfig};
use crate::snapshot::SnapshotStore;
use crate::store::{BatchWrite, DocumentStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
    /// Rollback itself failed; the touched entities may be inconsistent.
    Poisoned,
}

impl TransactionState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TransactionState::Active)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionState::Active => write!(f, "ACTIVE"),
            TransactionState::Committed => write!(f, "COMMITTED"),
            TransactionState::RolledBack => write!(f, "ROLLED_BACK"),
            TransactionState::Poisoned => write!(f, "POISONED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRef {
    pub entity_type: String,
    pub entity_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub transaction_id: String,
    pub state: TransactionState,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    /// Entities that did not exist before this transaction.
    pub created: Vec<EntityRef>,
    /// Number of entity writes performed so far.
    pub writes: u32,
}

/// Finished transactions kept for inspection by default.
pub const DEFAULT_RETAINED_TRANSACTIONS: usize = 1024;

#[derive(Default)]
struct Registry {
    entries: HashMap<String, Transaction>,
    /// Committed and rolled-back ids, oldest first.
    finished: VecDeque<String>,
}

impl Registry {
    fn retire(&mut self, transaction_id: &str, limit: usize) {
        self.finished.push_back(transaction_id.to_string());
        while self.finished.len() > limit {
            let Some(oldest) = self.finished.pop_front() else {
                break;
            };
            let poisoned = self
                .entries
                .get(&oldest)
                .is_some_and(|t| t.state == TransactionState::Poisoned);
            if !poisoned {
                self.entries.remove(&oldest);
            }
        }
    }
}

/// Owns the lock manager and snapshot store and tracks every transaction
/// opened through it.
pub struct TransactionCoordinator {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    locks: LockManager,
    snapshots: SnapshotStore,
    transactions: Mutex<Registry>,
    retained: usize,
}

impl TransactionCoordinator {
    pub fn new(store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>, backoff: RetryConfig) -> Self {
        Self {
            locks: LockManager::new(Arc::clone(&store), Arc::clone(&clock), backoff),
            snapshots: SnapshotStore::new(Arc::clone(&store), Arc::clone(&clock)),
            store,
            clock,
            transactions: Mutex::new(Registry::default()),
            retained: DEFAULT_RETAINED_TRANSACTIONS,
        }
    }

    /// Keep at most `limit` committed or rolled-back transactions (at least one).
    pub fn with_retention(mut self, limit: usize) -> Self {
        self.retained = limit.max(1);
        self
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    /// `None` for unknown ids and for finished transactions already evicted.
    pub fn transaction(&self, transaction_id: &str) -> Option<Transaction> {
        self.transactions.lock().entries.get(transaction_id).cloned()
    }

    /// Poisoned transactions still held by the registry.
    pub fn poisoned_transactions(&self) -> Vec<Transaction> {
        let mut poisoned: Vec<Transaction> = self
            .transactions
            .lock()
            .entries
            .values()
            .filter(|t| t.state == TransactionState::Poisoned)
            .cloned()
            .collect();
        poisoned.sort_by_key(|t| t.started_at);
        poisoned
    }

    pub fn begin_transaction(&self, transaction_id: &str) -> Result<()> {
        let mut transactions = self.transactions.lock();
        if transactions.entries.contains_key(transaction_id) {
            return Err(CoordError::Transaction(format!(
                "transaction {transaction_id} already exists"
            )));
        }
        transactions.entries.insert(
            transaction_id.to_string(),
            Transaction {
                transaction_id: transaction_id.to_string(),
                state: TransactionState::Active,
                started_at: self.clock.now_ms(),
                finished_at: None,
                created: Vec::new(),
                writes: 0,
            },
        );
        Ok(())
    }

    /// Note that `entity` was created by this transaction; rollback deletes it.
    pub fn record_created(&self, transaction_id: &str, entity_type: &str, entity_id: &str) -> Result<()> {
        self.with_active(transaction_id, |txn| {
            txn.created.push(EntityRef {
                entity_type: entity_type.to_string(),
                entity_id: entity_id.to_string(),
            });
            txn.writes += 1;
        })
    }

    pub fn record_write(&self, transaction_id: &str) -> Result<()> {
        self.with_active(transaction_id, |txn| txn.writes += 1)
    }

    pub fn commit_transaction(&self, transaction_id: &str) -> Result<()> {
        let now = self.clock.now_ms();
        self.with_active(transaction_id, |txn| {
            txn.state = TransactionState::Committed;
            txn.finished_at = Some(now);
        })?;
        self.transactions.lock().retire(transaction_id, self.retained);
        info!(transaction_id, "transaction committed");
        Ok(())
    }

    /// Undo everything the transaction wrote: restore its snapshots newest
    /// first and delete the entities it created, in one batch.
    ///
    /// If the undo itself fails the transaction is poisoned and the failure
    /// is returned as [`CoordError::RollbackFailed`].
    pub async fn rollback_transaction(&self, transaction_id: &str) -> Result<()> {
        self.rollback_into(transaction_id, TransactionState::RolledBack)
            .await
    }

    /// Undo the transaction and finish it in `undone` (rolled back, or
    /// poisoned when an upstream compensation already failed).
    async fn rollback_into(&self, transaction_id: &str, undone: TransactionState) -> Result<()> {
        let txn = self
            .transaction(transaction_id)
            .ok_or_else(|| CoordError::not_found("transaction", transaction_id))?;
        if txn.state.is_terminal() {
            return Err(CoordError::Transaction(format!(
                "transaction {transaction_id} is already {}",
                txn.state
            )));
        }

        match self.undo(&txn).await {
            Ok(()) => {
                self.finish(transaction_id, undone);
                warn!(transaction_id, "transaction rolled back");
                Ok(())
            }
            Err(e) => {
                self.finish(transaction_id, TransactionState::Poisoned);
                error!(transaction_id, error = %e, "rollback failed, transaction poisoned");
                Err(CoordError::RollbackFailed {
                    transaction_id: transaction_id.to_string(),
                    original: "explicit rollback".to_string(),
                    source: Box::new(e),
                })
            }
        }
    }

    /// Roll back after `cause` and return the error the caller should see:
    /// `cause` itself when the rollback succeeded, `RollbackFailed` otherwise.
    ///
    /// A cause that is already a `RollbackFailed` (a compensating action
    /// failed upstream) still gets its snapshots restored, but the
    /// transaction ends up poisoned.
    pub async fn abort(&self, transaction_id: &str, cause: CoordError) -> CoordError {
        let poisoned_upstream = matches!(cause, CoordError::RollbackFailed { .. });
        let undone = if poisoned_upstream {
            TransactionState::Poisoned
        } else {
            TransactionState::RolledBack
        };
        match self.rollback_into(transaction_id, undone).await {
            Ok(()) if poisoned_upstream => {
                error!(transaction_id, error = %cause, "transaction poisoned by failed compensation");
                cause
            }
            Ok(()) => cause,
            Err(CoordError::RollbackFailed {
                transaction_id,
                source,
                ..
            }) => CoordError::RollbackFailed {
                transaction_id,
                original: cause.to_string(),
                source,
            },
            Err(other) => {
                error!(transaction_id, error = %other, "could not roll back transaction");
                cause
            }
        }
    }

    /// Close a transaction whose work was undone by its caller.
    pub fn mark_rolled_back(&self, transaction_id: &str) {
        self.finish(transaction_id, TransactionState::RolledBack);
    }

    pub fn mark_poisoned(&self, transaction_id: &str) {
        self.finish(transaction_id, TransactionState::Poisoned);
    }

    async fn undo(&self, txn: &Transaction) -> Result<()> {
        if txn.writes == 0 {
            return Ok(());
        }
        let mut writes = self.snapshots.rollback_writes(&txn.transaction_id).await?;
        writes.extend(
            txn.created
                .iter()
                .map(|e| BatchWrite::delete(&e.entity_type, &e.entity_id)),
        );
        if !writes.is_empty() {
            self.store.write_batch(writes).await?;
        }
        Ok(())
    }

    fn with_active(&self, transaction_id: &str, f: impl FnOnce(&mut Transaction)) -> Result<()> {
        let mut transactions = self.transactions.lock();
        let txn = transactions
            .entries
            .get_mut(transaction_id)
            .ok_or_else(|| CoordError::not_found("transaction", transaction_id))?;
        if txn.state.is_terminal() {
            return Err(CoordError::Transaction(format!(
                "transaction {transaction_id} is already {}",
                txn.state
            )));
        }
        f(txn);
        Ok(())
    }

    fn finish(&self, transaction_id: &str, state: TransactionState) {
        let now = self.clock.now_ms();
        let mut transactions = self.transactions.lock();
        let Some(txn) = transactions.entries.get_mut(transaction_id) else {
            return;
        };
        let was_retired = txn.state.is_terminal() && txn.state != TransactionState::Poisoned;
        txn.state = state;
        txn.finished_at = Some(now);
        if state == TransactionState::RolledBack && !was_retired {
            transactions.retire(transaction_id, self.retained);
        }
    }
}
