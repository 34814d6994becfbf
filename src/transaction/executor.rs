//! The lock → begin → snapshot → validate → write → commit envelope around
//! every role mutation.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use serde_json::{Map, Value};
use tracing::{debug, error, warn};

use super::coordinator::{DEFAULT_RETAINED_TRANSACTIONS, TransactionCoordinator, TransactionState};
use super::new_transaction_id;
use crate::clock::Clock;
use crate::error::{CoordError, Result};
use crate::lock::{LockRequest, RetryConfig, role_lock_key};
use crate::snapshot::Snapshot;
use crate::state_machine::{Role, RoleState, RoleUpdate};
use crate::store::{DocumentStore, ROLES};

/// Lock key guarding a collaboration's role list.
pub fn collaboration_lock_key(collaboration_id: &str) -> String {
    format!("collaboration:{collaboration_id}")
}

#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// Lease length of every lock taken by the handler.
    pub lock_timeout_ms: u64,
    /// Retry budget and backoff for lock acquisition.
    pub retry: RetryConfig,
    /// Committed or rolled-back transactions kept for inspection.
    pub retained_transactions: usize,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 30_000,
            retry: RetryConfig::default(),
            retained_transactions: DEFAULT_RETAINED_TRANSACTIONS,
        }
    }
}

/// An open transaction together with the locks it holds.
#[derive(Debug)]
pub struct RoleScope {
    pub transaction_id: String,
    lock_ids: Vec<String>,
}

/// Executes role updates under the transaction envelope.
///
/// One handler is built per process and shared (`Arc`) by the monitored
/// operations and the state machine.
pub struct RoleTransactionHandler {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    coordinator: TransactionCoordinator,
    config: HandlerConfig,
    last_stamp: AtomicI64,
}

impl RoleTransactionHandler {
    pub fn new(store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>, config: HandlerConfig) -> Self {
        Self {
            coordinator: TransactionCoordinator::new(
                Arc::clone(&store),
                Arc::clone(&clock),
                config.retry.clone(),
            )
            .with_retention(config.retained_transactions),
            store,
            clock,
            config,
            last_stamp: AtomicI64::new(0),
        }
    }

    pub fn coordinator(&self) -> &TransactionCoordinator {
        &self.coordinator
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Update one role. On any failure the role is left exactly as it was.
    pub async fn execute_role_update(&self, role_id: &str, update: RoleUpdate) -> Result<Role> {
        self.execute_role_update_as(&new_transaction_id(), role_id, update)
            .await
    }

    /// [`execute_role_update`](Self::execute_role_update) under a caller-chosen
    /// transaction id.
    pub async fn execute_role_update_as(
        &self,
        transaction_id: &str,
        role_id: &str,
        update: RoleUpdate,
    ) -> Result<Role> {
        let scope = self
            .open_with_id(transaction_id, vec![role_lock_key(role_id)])
            .await?;
        let outcome = async {
            let (doc, role) = self.capture(transaction_id, role_id).await?;
            self.write_role(transaction_id, &doc, &role, &update).await
        }
        .await;
        self.close(scope, outcome).await
    }

    /// Apply several role updates as one unit: either all land or none do.
    ///
    /// Every role involved is locked up front, in sorted key order, under a
    /// single transaction. Updates run in the order given; if one fails, the
    /// ones already applied are restored from their snapshots in reverse.
    pub async fn execute_batch_role_updates(
        &self,
        updates: Vec<(String, RoleUpdate)>,
    ) -> Result<Vec<Role>> {
        let keys = updates.iter().map(|(id, _)| role_lock_key(id)).collect();
        let scope = self.open(keys).await?;
        let outcome = self.apply_batch(&scope.transaction_id, updates).await;
        self.close(scope, outcome).await
    }

    async fn apply_batch(
        &self,
        transaction_id: &str,
        updates: Vec<(String, RoleUpdate)>,
    ) -> Result<Vec<Role>> {
        let mut executed: Vec<Snapshot> = Vec::new();
        let mut results = Vec::with_capacity(updates.len());

        for (role_id, update) in &updates {
            let step = async {
                let (doc, role) = self.load_role(role_id).await?;
                let snapshot = self
                    .coordinator
                    .snapshots()
                    .create_snapshot(role_id, ROLES, &doc, transaction_id)
                    .await?;
                let updated = self.write_role(transaction_id, &doc, &role, update).await;
                Ok::<_, CoordError>((snapshot, updated))
            }
            .await;

            match step {
                Ok((snapshot, Ok(role))) => {
                    executed.push(snapshot);
                    results.push(role);
                }
                Ok((snapshot, Err(cause))) => {
                    // Rejected updates never reach the store; anything else might have.
                    if !cause.is_expected() {
                        executed.push(snapshot);
                    }
                    return Err(self.compensate(transaction_id, &executed, cause).await);
                }
                Err(cause) => return Err(self.compensate(transaction_id, &executed, cause).await),
            }
        }
        Ok(results)
    }

    /// Restore executed batch steps newest first, continuing past failures.
    async fn compensate(
        &self,
        transaction_id: &str,
        executed: &[Snapshot],
        cause: CoordError,
    ) -> CoordError {
        warn!(
            transaction_id,
            steps = executed.len(),
            error = %cause,
            "batch update failed, undoing applied steps"
        );
        let mut first_failure = None;
        for snapshot in executed.iter().rev() {
            if let Err(e) = self.coordinator.snapshots().restore_snapshot(&snapshot.id).await {
                error!(
                    transaction_id,
                    snapshot_id = %snapshot.id,
                    entity_id = %snapshot.entity_id,
                    error = %e,
                    "could not restore batch step"
                );
                first_failure.get_or_insert(e);
            }
        }

        match first_failure {
            None => {
                self.coordinator.mark_rolled_back(transaction_id);
                cause
            }
            Some(source) => {
                self.coordinator.mark_poisoned(transaction_id);
                CoordError::RollbackFailed {
                    transaction_id: transaction_id.to_string(),
                    original: cause.to_string(),
                    source: Box::new(source),
                }
            }
        }
    }

    /// Restore a role from its newest valid snapshot while holding the
    /// role's lock, so no transaction on the role is in flight meanwhile.
    pub async fn restore_role(&self, role_id: &str) -> Result<Snapshot> {
        let scope = self.open(vec![role_lock_key(role_id)]).await?;
        let outcome = async {
            let snapshots = self.coordinator.snapshots();
            let snapshot = snapshots
                .get_last_valid_snapshot(role_id, ROLES)
                .await?
                .ok_or_else(|| CoordError::not_found("role snapshot", role_id))?;
            snapshots.restore_snapshot(&snapshot.id).await?;
            Ok(snapshot)
        }
        .await;
        self.close(scope, outcome).await
    }

    /// Lock `lock_ids` and begin a fresh transaction.
    pub async fn open(&self, lock_ids: Vec<String>) -> Result<RoleScope> {
        self.open_with_id(&new_transaction_id(), lock_ids).await
    }

    /// Lock `lock_ids` (sorted, deduplicated) on behalf of `transaction_id`
    /// and begin it. Nothing is held when this returns an error.
    pub async fn open_with_id(&self, transaction_id: &str, mut lock_ids: Vec<String>) -> Result<RoleScope> {
        lock_ids.sort();
        lock_ids.dedup();

        let mut scope = RoleScope {
            transaction_id: transaction_id.to_string(),
            lock_ids: Vec::with_capacity(lock_ids.len()),
        };
        for lock_id in lock_ids {
            let request = LockRequest {
                lock_id: lock_id.clone(),
                owner_id: transaction_id.to_string(),
                timeout_ms: self.config.lock_timeout_ms,
                retry_count: self.config.retry.max_retries,
            };
            let granted = match self.coordinator.locks().acquire_lock(&request).await {
                Ok(granted) => granted,
                Err(e) => {
                    self.release(&scope).await;
                    return Err(e.into());
                }
            };
            if !granted {
                self.release(&scope).await;
                return Err(CoordError::LockAcquisitionFailed {
                    lock_id,
                    attempts: request.retry_count + 1,
                });
            }
            scope.lock_ids.push(lock_id);
        }

        if let Err(e) = self.coordinator.begin_transaction(transaction_id) {
            self.release(&scope).await;
            return Err(e);
        }
        Ok(scope)
    }

    /// Commit on success, roll back on failure, and release the locks either way.
    pub async fn close<T>(&self, scope: RoleScope, outcome: Result<T>) -> Result<T> {
        let id = scope.transaction_id.as_str();
        let result = match outcome {
            Ok(value) => match self.coordinator.commit_transaction(id) {
                Ok(()) => Ok(value),
                Err(e) => Err(self.coordinator.abort(id, e).await),
            },
            Err(cause) if self.is_active(id) => Err(self.coordinator.abort(id, cause).await),
            Err(cause) => Err(cause),
        };
        self.release(&scope).await;

        if let Err(e) = &result {
            if e.is_expected() {
                debug!(transaction_id = id, error = %e, "role operation rejected");
            } else {
                warn!(transaction_id = id, error = %e, "role operation failed");
            }
        }
        result
    }

    fn is_active(&self, transaction_id: &str) -> bool {
        self.coordinator
            .transaction(transaction_id)
            .is_some_and(|t| t.state == TransactionState::Active)
    }

    async fn release(&self, scope: &RoleScope) {
        for lock_id in scope.lock_ids.iter().rev() {
            if let Err(e) = self
                .coordinator
                .locks()
                .release_lock(lock_id, &scope.transaction_id)
                .await
            {
                warn!(lock_id, transaction_id = %scope.transaction_id, error = %e, "lock release failed; lease will expire");
            }
        }
    }

    /// The stored role document and its typed view.
    pub async fn load_role(&self, role_id: &str) -> Result<(Value, Role)> {
        let doc = self
            .store
            .get(ROLES, role_id)
            .await?
            .ok_or_else(|| CoordError::not_found("role", role_id))?;
        let role = Role::from_document(&doc)
            .map_err(|e| CoordError::Validation(format!("stored role {role_id} is malformed: {e}")))?;
        Ok((doc, role))
    }

    /// Load a role and snapshot it under `transaction_id`.
    pub async fn capture(&self, transaction_id: &str, role_id: &str) -> Result<(Value, Role)> {
        let (doc, role) = self.load_role(role_id).await?;
        self.coordinator
            .snapshots()
            .create_snapshot(role_id, ROLES, &doc, transaction_id)
            .await?;
        Ok((doc, role))
    }

    /// Validate `update` against the role as loaded, merge it, stamp it, and
    /// write it. The caller must already have snapshotted `doc`.
    pub async fn write_role(
        &self,
        transaction_id: &str,
        doc: &Value,
        role: &Role,
        update: &RoleUpdate,
    ) -> Result<Role> {
        let mut merged = validate_update(role, doc, update)?;
        let stamp = self.next_stamp(role.updated_at);
        if let Some(obj) = merged.as_object_mut() {
            obj.insert("updatedAt".into(), Value::from(stamp));
            obj.insert("lastTransactionId".into(), Value::String(transaction_id.to_string()));
        }
        let updated = Role::from_document(&merged)?;

        self.coordinator.record_write(transaction_id)?;
        self.store.set(ROLES, &role.id, merged).await?;
        debug!(role_id = %role.id, transaction_id, status = %updated.status, "role written");
        Ok(updated)
    }

    /// A millisecond timestamp greater than every one handed out before and
    /// greater than `floor`.
    pub fn next_stamp(&self, floor: i64) -> i64 {
        let now = self.clock.now_ms();
        let next = |last: i64| now.max(last + 1).max(floor + 1);
        let (Ok(prev) | Err(prev)) =
            self.last_stamp
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(next(last)));
        next(prev)
    }
}

/// Check `update` against the domain rules and return the merged document.
///
/// A `null` value removes the field.
pub fn validate_update(role: &Role, doc: &Value, update: &RoleUpdate) -> Result<Value> {
    if let Some(id) = update.get("id")
        && id.as_str() != Some(role.id.as_str())
    {
        return Err(CoordError::Validation("role id cannot be changed".into()));
    }

    let mut status_change = None;
    if let Some(status) = update.get("status") {
        let next: RoleState = status
            .as_str()
            .ok_or_else(|| CoordError::Validation(format!("status must be a string, got {status}")))?
            .parse()
            .map_err(CoordError::Validation)?;
        if role.status.is_terminal() && next != role.status {
            return Err(CoordError::Validation(format!(
                "role is {} and its status can no longer change",
                role.status
            )));
        }
        status_change = Some(next);
    }

    if let Some(max) = update.get("maxParticipants")
        && !max.as_u64().is_some_and(|n| n > 0 && n <= u64::from(u32::MAX))
    {
        return Err(CoordError::Validation(format!(
            "maxParticipants must be a positive integer, got {max}"
        )));
    }

    if let Some(skills) = update.get("requiredSkills") {
        let all_strings = skills
            .as_array()
            .is_some_and(|items| items.iter().all(Value::is_string));
        if !all_strings {
            return Err(CoordError::Validation(
                "requiredSkills must be a list of strings".into(),
            ));
        }
    }

    let mut merged: Map<String, Value> = doc.as_object().cloned().unwrap_or_default();
    for (key, value) in update {
        if value.is_null() {
            merged.remove(key);
        } else {
            merged.insert(key.clone(), value.clone());
        }
    }
    if let Some(next) = status_change {
        merged.insert("status".into(), Value::String(next.as_str().into()));
    }
    let merged = Value::Object(merged);

    let candidate = Role::from_document(&merged)
        .map_err(|e| CoordError::Validation(format!("update produces an invalid role: {e}")))?;
    if candidate.assigned_user_ids.len() > candidate.max_participants as usize {
        return Err(CoordError::Validation(format!(
            "{} users assigned but maxParticipants is {}",
            candidate.assigned_user_ids.len(),
            candidate.max_participants
        )));
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::testing::FlakyStore;
    use crate::store::{LOCKS, MemoryStore, SNAPSHOTS};
    use serde_json::json;

    fn update(value: Value) -> RoleUpdate {
        value.as_object().cloned().unwrap()
    }

    fn handler(store: Arc<dyn DocumentStore>, clock: Arc<ManualClock>) -> RoleTransactionHandler {
        RoleTransactionHandler::new(
            store,
            clock,
            HandlerConfig {
                lock_timeout_ms: 5_000,
                retry: RetryConfig {
                    max_retries: 2,
                    base_delay_ms: 10,
                    max_delay_ms: 50,
                },
                ..Default::default()
            },
        )
    }

    async fn seed(store: &dyn DocumentStore, id: &str, doc: Value) {
        store.set(ROLES, id, doc).await.unwrap();
    }

    fn open_role(id: &str) -> Value {
        json!({
            "id": id,
            "title": "Illustrator",
            "status": "open",
            "requiredSkills": ["drawing"],
            "maxParticipants": 2,
            "updatedAt": 5
        })
    }

    #[tokio::test]
    async fn update_applies_and_stamps() {
        let store = Arc::new(MemoryStore::new());
        let handler = handler(store.clone(), Arc::new(ManualClock::new(100)));
        seed(store.as_ref(), "r1", open_role("r1")).await;

        let role = handler
            .execute_role_update("r1", update(json!({"title": "Lead illustrator"})))
            .await
            .unwrap();
        assert_eq!(role.title, "Lead illustrator");
        assert_eq!(role.updated_at, 100);

        let txn_id = role.last_transaction_id.clone().unwrap();
        let txn = handler.coordinator().transaction(&txn_id).unwrap();
        assert_eq!(txn.state, TransactionState::Committed);

        // Snapshot holds the pre-update state; lock is gone.
        let snaps = handler
            .coordinator()
            .snapshots()
            .snapshots_for_transaction(&txn_id)
            .await
            .unwrap();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].data["title"], "Illustrator");
        assert!(store.list(LOCKS).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn timestamps_strictly_increase() {
        let store = Arc::new(MemoryStore::new());
        let handler = handler(store.clone(), Arc::new(ManualClock::new(100)));
        seed(store.as_ref(), "r1", open_role("r1")).await;

        let first = handler
            .execute_role_update("r1", update(json!({"title": "a"})))
            .await
            .unwrap();
        let second = handler
            .execute_role_update("r1", update(json!({"title": "b"})))
            .await
            .unwrap();
        assert!(second.updated_at > first.updated_at);

        // A stored stamp ahead of the clock is still exceeded.
        seed(store.as_ref(), "r2", json!({"id": "r2", "maxParticipants": 1, "updatedAt": 9_000})).await;
        let r2 = handler
            .execute_role_update("r2", update(json!({"title": "c"})))
            .await
            .unwrap();
        assert_eq!(r2.updated_at, 9_001);
    }

    #[tokio::test]
    async fn invalid_update_leaves_role_untouched() {
        let store = Arc::new(MemoryStore::new());
        let handler = handler(store.clone(), Arc::new(ManualClock::new(100)));
        seed(store.as_ref(), "r1", open_role("r1")).await;

        let cases = [
            json!({"status": "finished"}),
            json!({"id": "r2"}),
            json!({"maxParticipants": 0}),
            json!({"requiredSkills": ["rust", 3]}),
            json!({"assignedUserIds": ["a", "b", "c"]}),
        ];
        for case in cases {
            let err = handler
                .execute_role_update("r1", update(case.clone()))
                .await
                .unwrap_err();
            assert!(matches!(err, CoordError::Validation(_)), "{case}: {err}");
        }

        assert_eq!(store.get(ROLES, "r1").await.unwrap(), Some(open_role("r1")));
        assert!(store.list(LOCKS).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn terminal_status_cannot_change() {
        let store = Arc::new(MemoryStore::new());
        let handler = handler(store.clone(), Arc::new(ManualClock::new(100)));
        seed(store.as_ref(), "r1", json!({"id": "r1", "status": "completed", "maxParticipants": 1})).await;

        let err = handler
            .execute_role_update("r1", update(json!({"status": "open"})))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "validation failed: role is COMPLETED and its status can no longer change"
        );

        // Non-status fields may still change.
        handler
            .execute_role_update("r1", update(json!({"title": "Archived"})))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn null_removes_field() {
        let store = Arc::new(MemoryStore::new());
        let handler = handler(store.clone(), Arc::new(ManualClock::new(100)));
        seed(store.as_ref(), "r1", json!({"id": "r1", "maxParticipants": 1, "participantId": "u1"})).await;

        let role = handler
            .execute_role_update("r1", update(json!({"participantId": null})))
            .await
            .unwrap();
        assert!(role.participant_id.is_none());
        let doc = store.get(ROLES, "r1").await.unwrap().unwrap();
        assert!(doc.get("participantId").is_none());
    }

    #[tokio::test]
    async fn missing_role_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let handler = handler(store.clone(), Arc::new(ManualClock::new(100)));
        let err = handler
            .execute_role_update("ghost", update(json!({"title": "x"})))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordError::NotFound { .. }));
        assert!(store.list(LOCKS).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_write_is_rolled_back_and_lock_released() {
        let store = FlakyStore::new();
        let handler = handler(store.clone(), Arc::new(ManualClock::new(100)));
        seed(store.as_ref(), "r1", open_role("r1")).await;
        store.fail_writes_to(ROLES);

        let err = handler
            .execute_role_update("r1", update(json!({"title": "x"})))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordError::Store(_)));

        let doc = store.get(ROLES, "r1").await.unwrap().unwrap();
        assert_eq!(doc["title"], "Illustrator");
        assert!(store.list(LOCKS).await.unwrap().is_empty());
        let snapshots = store.list(SNAPSHOTS).await.unwrap();
        let txn_id = snapshots[0].1["metadata"]["transactionId"].as_str().unwrap();
        assert_eq!(
            handler.coordinator().transaction(txn_id).unwrap().state,
            TransactionState::RolledBack
        );
    }

    #[tokio::test]
    async fn restore_role_brings_back_last_snapshot() {
        let store = Arc::new(MemoryStore::new());
        let handler = handler(store.clone(), Arc::new(ManualClock::new(100)));
        seed(store.as_ref(), "r1", open_role("r1")).await;
        handler
            .execute_role_update("r1", update(json!({"title": "Renamed"})))
            .await
            .unwrap();

        let snapshot = handler.restore_role("r1").await.unwrap();
        let doc = store.get(ROLES, "r1").await.unwrap().unwrap();
        assert_eq!(doc["title"], "Illustrator");
        assert_eq!(doc["restoredFromSnapshot"], json!(snapshot.id));
        assert!(store.list(LOCKS).await.unwrap().is_empty());

        let err = handler.restore_role("r9").await.unwrap_err();
        assert!(matches!(err, CoordError::NotFound { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn restore_role_waits_for_the_role_lock() {
        let store = Arc::new(MemoryStore::new());
        let handler = handler(store.clone(), Arc::new(ManualClock::new(100)));
        seed(store.as_ref(), "r1", open_role("r1")).await;
        handler
            .execute_role_update("r1", update(json!({"title": "Renamed"})))
            .await
            .unwrap();

        let in_flight = LockRequest {
            lock_id: role_lock_key("r1"),
            owner_id: "tx-in-flight".into(),
            timeout_ms: 60_000,
            retry_count: 0,
        };
        assert!(handler.coordinator().locks().acquire_lock(&in_flight).await.unwrap());

        let err = handler.restore_role("r1").await.unwrap_err();
        assert!(matches!(err, CoordError::LockAcquisitionFailed { .. }));
        let doc = store.get(ROLES, "r1").await.unwrap().unwrap();
        assert_eq!(doc["title"], "Renamed");
    }

    #[tokio::test(start_paused = true)]
    async fn held_lock_fails_with_lock_acquisition_error() {
        let store = Arc::new(MemoryStore::new());
        let handler = handler(store.clone(), Arc::new(ManualClock::new(100)));
        seed(store.as_ref(), "r1", open_role("r1")).await;

        let foreign = LockRequest {
            lock_id: role_lock_key("r1"),
            owner_id: "someone-else".into(),
            timeout_ms: 60_000,
            retry_count: 0,
        };
        assert!(handler.coordinator().locks().acquire_lock(&foreign).await.unwrap());

        let err = handler
            .execute_role_update("r1", update(json!({"title": "x"})))
            .await
            .unwrap_err();
        match err {
            CoordError::LockAcquisitionFailed { lock_id, attempts } => {
                assert_eq!(lock_id, "role:r1");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected LockAcquisitionFailed, got {other:?}"),
        }
        // Nothing touched, no snapshot taken.
        assert_eq!(store.get(ROLES, "r1").await.unwrap(), Some(open_role("r1")));
        assert!(store.list(SNAPSHOTS).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_updates_never_overlap() {
        let store = FlakyStore::new();
        store.slow_role_writes(20);
        let handler = Arc::new(RoleTransactionHandler::new(
            store.clone(),
            Arc::new(ManualClock::new(100)),
            HandlerConfig {
                lock_timeout_ms: 60_000,
                retry: RetryConfig {
                    max_retries: 20,
                    base_delay_ms: 5,
                    max_delay_ms: 20,
                },
                ..Default::default()
            },
        ));
        store.inner.set(ROLES, "r1", open_role("r1")).await.unwrap();

        let tasks: Vec<_> = (0..4)
            .map(|i| {
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    handler
                        .execute_role_update("r1", update(json!({ "title": format!("t{i}") })))
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(store.max_concurrent_role_writes(), 1);
    }

    #[tokio::test]
    async fn batch_applies_all() {
        let store = Arc::new(MemoryStore::new());
        let handler = handler(store.clone(), Arc::new(ManualClock::new(100)));
        seed(store.as_ref(), "r1", open_role("r1")).await;
        seed(store.as_ref(), "r2", open_role("r2")).await;

        let roles = handler
            .execute_batch_role_updates(vec![
                ("r2".into(), update(json!({"title": "two"}))),
                ("r1".into(), update(json!({"title": "one"}))),
            ])
            .await
            .unwrap();
        assert_eq!(roles[0].title, "two");
        assert_eq!(roles[1].title, "one");
        assert_eq!(roles[0].last_transaction_id, roles[1].last_transaction_id);
    }

    #[tokio::test]
    async fn batch_failure_restores_earlier_steps() {
        let store = Arc::new(MemoryStore::new());
        let handler = handler(store.clone(), Arc::new(ManualClock::new(100)));
        seed(store.as_ref(), "r1", open_role("r1")).await;
        seed(store.as_ref(), "r2", open_role("r2")).await;

        let err = handler
            .execute_batch_role_updates(vec![
                ("r1".into(), update(json!({"title": "one"}))),
                ("r2".into(), update(json!({"maxParticipants": -1}))),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, CoordError::Validation(_)));

        let r1 = store.get(ROLES, "r1").await.unwrap().unwrap();
        assert_eq!(r1["title"], "Illustrator");
        assert!(r1.get("restoredFromSnapshot").is_some());
        assert_eq!(store.get(ROLES, "r2").await.unwrap(), Some(open_role("r2")));
        assert!(store.list(LOCKS).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn batch_touching_same_role_twice_restores_original() {
        let store = Arc::new(MemoryStore::new());
        let handler = handler(store.clone(), Arc::new(ManualClock::new(100)));
        seed(store.as_ref(), "r1", open_role("r1")).await;

        let err = handler
            .execute_batch_role_updates(vec![
                ("r1".into(), update(json!({"title": "first"}))),
                ("r1".into(), update(json!({"title": "second"}))),
                ("missing".into(), update(json!({"title": "x"}))),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, CoordError::NotFound { .. }));
        let r1 = store.get(ROLES, "r1").await.unwrap().unwrap();
        assert_eq!(r1["title"], "Illustrator");
    }

    #[tokio::test]
    async fn failed_compensation_poisons_batch() {
        let store = FlakyStore::new();
        let handler = handler(store.clone(), Arc::new(ManualClock::new(100)));
        seed(store.as_ref(), "r1", open_role("r1")).await;
        seed(store.as_ref(), "r2", open_role("r2")).await;

        store.fail_writes_to(ROLES);

        // r1's write fails, and so does restoring it.
        let err = handler
            .execute_batch_role_updates(vec![
                ("r1".into(), update(json!({"title": "one"}))),
                ("r2".into(), update(json!({"title": "two"}))),
            ])
            .await
            .unwrap_err();
        match err {
            CoordError::RollbackFailed { original, .. } => {
                assert!(original.contains("injected failure"));
            }
            other => panic!("expected RollbackFailed, got {other:?}"),
        }
        assert!(store.list(LOCKS).await.unwrap().is_empty());
    }

    #[test]
    fn validate_merges_update() {
        let doc = open_role("r1");
        let role = Role::from_document(&doc).unwrap();
        let merged = validate_update(&role, &doc, &update(json!({"status": "IN_REVIEW"}))).unwrap();
        assert_eq!(merged["status"], "in_review");
        assert_eq!(merged["title"], "Illustrator");
    }

    #[test]
    fn validate_rejects_id_change_and_bad_capacity() {
        let doc = open_role("r1");
        let role = Role::from_document(&doc).unwrap();

        assert!(validate_update(&role, &doc, &update(json!({"id": "r1"}))).is_ok());
        let err = validate_update(&role, &doc, &update(json!({"id": "r2"}))).unwrap_err();
        assert!(err.to_string().contains("role id cannot be changed"));

        for bad in [json!(0), json!(-1), json!("3")] {
            let err = validate_update(&role, &doc, &update(json!({"maxParticipants": bad})))
                .unwrap_err();
            assert!(matches!(err, CoordError::Validation(_)));
        }
        assert!(validate_update(&role, &doc, &update(json!({"maxParticipants": 3}))).is_ok());
    }
}
