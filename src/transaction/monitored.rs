//! Create/update/delete entry points that never return an error: every call
//! reports an [`OperationResult`], and failures leave a record behind for
//! later diagnosis.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::executor::{RoleTransactionHandler, collaboration_lock_key, validate_update};
use super::new_transaction_id;
use crate::error::{CoordError, Result};
use crate::lock::role_lock_key;
use crate::state_machine::{Collaboration, Role, RoleState, RoleUpdate};
use crate::store::{COLLABORATIONS, DocumentStore, FAILURES, ROLES};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub transaction_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    pub id: String,
    pub operation: String,
    pub transaction_id: String,
    pub entity_id: String,
    pub error: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Copy)]
enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    fn as_str(self) -> &'static str {
        match self {
            Operation::Create => "createRole",
            Operation::Update => "updateRole",
            Operation::Delete => "deleteRole",
        }
    }
}

pub struct MonitoredRoleOperations {
    handler: Arc<RoleTransactionHandler>,
}

impl MonitoredRoleOperations {
    pub fn new(handler: Arc<RoleTransactionHandler>) -> Self {
        Self { handler }
    }

    fn store(&self) -> &Arc<dyn DocumentStore> {
        self.handler.store()
    }

    /// Create a role in `DRAFT`, registering it with its collaboration.
    pub async fn create_role(
        &self,
        role_id: &str,
        data: Option<Value>,
        metadata: Option<Value>,
    ) -> OperationResult {
        let transaction_id = new_transaction_id();
        let outcome = self.create(&transaction_id, role_id, data).await;
        self.report(Operation::Create, &transaction_id, role_id, outcome, metadata)
            .await
    }

    /// Apply `data` as a field update to an existing role.
    pub async fn update_role(
        &self,
        role_id: &str,
        data: Option<Value>,
        metadata: Option<Value>,
    ) -> OperationResult {
        let transaction_id = new_transaction_id();
        let outcome = match as_update(data) {
            Ok(update) => self
                .handler
                .execute_role_update_as(&transaction_id, role_id, update)
                .await
                .map(|_| ()),
            Err(e) => Err(e),
        };
        self.report(Operation::Update, &transaction_id, role_id, outcome, metadata)
            .await
    }

    /// Delete a role and remove it from its collaboration.
    pub async fn delete_role(
        &self,
        role_id: &str,
        _data: Option<Value>,
        metadata: Option<Value>,
    ) -> OperationResult {
        let transaction_id = new_transaction_id();
        let outcome = self.delete(&transaction_id, role_id).await;
        self.report(Operation::Delete, &transaction_id, role_id, outcome, metadata)
            .await
    }

    /// Failure records for one entity, oldest first.
    pub async fn failures_for(&self, entity_id: &str) -> Result<Vec<FailureRecord>> {
        let docs = self
            .store()
            .query(FAILURES, "entityId", &Value::String(entity_id.to_string()))
            .await?;
        let mut records = docs
            .into_iter()
            .map(|(_, doc)| serde_json::from_value::<FailureRecord>(doc))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        records.sort_by_key(|r| r.timestamp);
        Ok(records)
    }

    async fn create(&self, transaction_id: &str, role_id: &str, data: Option<Value>) -> Result<()> {
        let update = as_update(data)?;
        if let Some(status) = update.get("status") {
            let starts_in_draft = status
                .as_str()
                .and_then(|s| s.parse::<RoleState>().ok())
                .is_some_and(|s| s == RoleState::Draft);
            if !starts_in_draft {
                return Err(CoordError::Validation(format!(
                    "new roles must start in {}",
                    RoleState::Draft
                )));
            }
        }
        let collaboration_id = update
            .get("collaborationId")
            .and_then(Value::as_str)
            .map(str::to_string);

        let mut locks = vec![role_lock_key(role_id)];
        if let Some(cid) = &collaboration_id {
            locks.push(collaboration_lock_key(cid));
        }
        let scope = self.handler.open_with_id(transaction_id, locks).await?;

        let outcome = async {
            if self.store().get(ROLES, role_id).await?.is_some() {
                return Err(CoordError::Validation(format!("role {role_id} already exists")));
            }

            let base = Value::Object(Map::from_iter([(
                "id".to_string(),
                Value::String(role_id.to_string()),
            )]));
            let mut doc = validate_update(&Role::new(role_id, ""), &base, &update)?;
            let stamp = self.handler.next_stamp(0);
            if let Some(obj) = doc.as_object_mut() {
                obj.insert("status".into(), Value::String(RoleState::Draft.as_str().into()));
                obj.insert("createdAt".into(), Value::from(stamp));
                obj.insert("updatedAt".into(), Value::from(stamp));
                obj.insert("lastTransactionId".into(), Value::String(transaction_id.to_string()));
            }
            Role::from_document(&doc)?;

            self.handler
                .coordinator()
                .record_created(transaction_id, ROLES, role_id)?;
            self.store().set(ROLES, role_id, doc).await?;

            if let Some(cid) = &collaboration_id {
                self.edit_collaboration(transaction_id, cid, |c| {
                    if !c.role_ids.iter().any(|id| id == role_id) {
                        c.role_ids.push(role_id.to_string());
                    }
                })
                .await?;
            }
            Ok(())
        }
        .await;
        self.handler.close(scope, outcome).await
    }

    async fn delete(&self, transaction_id: &str, role_id: &str) -> Result<()> {
        // Peek outside the lock to learn which collaboration to lock as well.
        let (_, peeked) = self.handler.load_role(role_id).await?;
        let mut locks = vec![role_lock_key(role_id)];
        if let Some(cid) = &peeked.collaboration_id {
            locks.push(collaboration_lock_key(cid));
        }
        let scope = self.handler.open_with_id(transaction_id, locks).await?;

        let outcome = async {
            let (_, role) = self.handler.capture(transaction_id, role_id).await?;
            if role.collaboration_id != peeked.collaboration_id {
                return Err(CoordError::Transaction(format!(
                    "role {role_id} moved to another collaboration during delete"
                )));
            }
            self.handler.coordinator().record_write(transaction_id)?;
            self.store().delete(ROLES, role_id).await?;

            if let Some(cid) = &role.collaboration_id {
                self.edit_collaboration(transaction_id, cid, |c| {
                    c.role_ids.retain(|id| id != role_id);
                })
                .await?;
            }
            Ok(())
        }
        .await;
        self.handler.close(scope, outcome).await
    }

    /// Snapshot and rewrite a collaboration. A missing collaboration is left alone.
    async fn edit_collaboration(
        &self,
        transaction_id: &str,
        collaboration_id: &str,
        edit: impl FnOnce(&mut Collaboration),
    ) -> Result<()> {
        let Some(doc) = self.store().get(COLLABORATIONS, collaboration_id).await? else {
            warn!(collaboration_id, "role references unknown collaboration");
            return Ok(());
        };
        self.handler
            .coordinator()
            .snapshots()
            .create_snapshot(collaboration_id, COLLABORATIONS, &doc, transaction_id)
            .await?;

        let mut collaboration: Collaboration = serde_json::from_value(doc)?;
        edit(&mut collaboration);
        self.handler.coordinator().record_write(transaction_id)?;
        self.store()
            .set(COLLABORATIONS, collaboration_id, serde_json::to_value(&collaboration)?)
            .await?;
        Ok(())
    }

    async fn report(
        &self,
        operation: Operation,
        transaction_id: &str,
        role_id: &str,
        outcome: Result<()>,
        metadata: Option<Value>,
    ) -> OperationResult {
        match outcome {
            Ok(()) => {
                info!(operation = operation.as_str(), role_id, transaction_id, "role operation succeeded");
                OperationResult {
                    success: true,
                    error: None,
                    transaction_id: transaction_id.to_string(),
                }
            }
            Err(e) => {
                let record = FailureRecord {
                    id: Uuid::new_v4().to_string(),
                    operation: operation.as_str().to_string(),
                    transaction_id: transaction_id.to_string(),
                    entity_id: role_id.to_string(),
                    error: e.to_string(),
                    timestamp: self.handler.clock().now_ms(),
                    metadata,
                };
                if let Err(log_err) = self.persist_failure(&record).await {
                    error!(
                        failure_id = %record.id,
                        error = %log_err,
                        "could not persist role operation failure"
                    );
                }
                OperationResult {
                    success: false,
                    error: Some(record.error),
                    transaction_id: transaction_id.to_string(),
                }
            }
        }
    }

    async fn persist_failure(&self, record: &FailureRecord) -> Result<()> {
        self.store()
            .set(FAILURES, &record.id, serde_json::to_value(record)?)
            .await?;
        Ok(())
    }
}

fn as_update(data: Option<Value>) -> Result<RoleUpdate> {
    match data {
        None => Ok(RoleUpdate::new()),
        Some(Value::Object(map)) => Ok(map),
        Some(other) => Err(CoordError::Validation(format!(
            "role data must be an object, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::testing::FlakyStore;
    use crate::store::{LOCKS, MemoryStore};
    use crate::transaction::{HandlerConfig, TransactionState};
    use serde_json::json;

    fn operations(store: Arc<dyn DocumentStore>) -> MonitoredRoleOperations {
        let handler = RoleTransactionHandler::new(
            store,
            Arc::new(ManualClock::new(1_000)),
            HandlerConfig::default(),
        );
        MonitoredRoleOperations::new(Arc::new(handler))
    }

    async fn seed_collaboration(store: &dyn DocumentStore) {
        store
            .set(
                COLLABORATIONS,
                "c1",
                json!({"id": "c1", "ownerId": "owner", "roleIds": []}),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn create_registers_role_with_collaboration() {
        let store = Arc::new(MemoryStore::new());
        seed_collaboration(store.as_ref()).await;
        let ops = operations(store.clone());

        let result = ops
            .create_role(
                "r1",
                Some(json!({"title": "Editor", "collaborationId": "c1", "maxParticipants": 1})),
                None,
            )
            .await;
        assert!(result.success, "{:?}", result.error);

        let role = store.get(ROLES, "r1").await.unwrap().unwrap();
        assert_eq!(role["status"], "draft");
        assert_eq!(role["createdAt"], 1_000);
        assert_eq!(role["lastTransactionId"], json!(result.transaction_id));
        let collab = store.get(COLLABORATIONS, "c1").await.unwrap().unwrap();
        assert_eq!(collab["roleIds"], json!(["r1"]));
        assert!(store.list(LOCKS).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_rejects_non_draft_and_duplicates() {
        let store = Arc::new(MemoryStore::new());
        let ops = operations(store.clone());

        let result = ops
            .create_role("r1", Some(json!({"status": "open"})), None)
            .await;
        assert!(!result.success);
        assert_eq!(
            result.error.as_deref(),
            Some("validation failed: new roles must start in DRAFT")
        );
        assert!(store.get(ROLES, "r1").await.unwrap().is_none());

        assert!(ops.create_role("r1", None, None).await.success);
        let again = ops.create_role("r1", None, None).await;
        assert!(!again.success);
        assert!(again.error.unwrap().contains("already exists"));
    }

    #[tokio::test]
    async fn failed_creation_leaves_no_partial_role() {
        let store = FlakyStore::new();
        seed_collaboration(store.as_ref()).await;
        store.fail_writes_to(COLLABORATIONS);
        let ops = operations(store.clone());

        let result = ops
            .create_role("r1", Some(json!({"collaborationId": "c1"})), None)
            .await;
        assert!(!result.success);
        assert!(store.get(ROLES, "r1").await.unwrap().is_none());
        let collab = store.get(COLLABORATIONS, "c1").await.unwrap().unwrap();
        assert_eq!(collab["roleIds"], json!([]));

        let txn = ops
            .handler
            .coordinator()
            .transaction(&result.transaction_id)
            .unwrap();
        assert_eq!(txn.state, TransactionState::RolledBack);
    }

    #[tokio::test]
    async fn failures_are_recorded_with_metadata() {
        let store = Arc::new(MemoryStore::new());
        let ops = operations(store.clone());

        let result = ops
            .update_role("ghost", Some(json!({"title": "x"})), Some(json!({"source": "cli"})))
            .await;
        assert!(!result.success);

        let failures = ops.failures_for("ghost").await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].operation, "updateRole");
        assert_eq!(failures[0].transaction_id, result.transaction_id);
        assert_eq!(failures[0].timestamp, 1_000);
        assert_eq!(failures[0].metadata, Some(json!({"source": "cli"})));
        assert_eq!(failures[0].error, "role not found: ghost");
    }

    #[tokio::test]
    async fn update_reports_success() {
        let store = Arc::new(MemoryStore::new());
        let ops = operations(store.clone());
        assert!(ops.create_role("r1", Some(json!({"maxParticipants": 2})), None).await.success);

        let result = ops
            .update_role("r1", Some(json!({"requiredSkills": ["sql"]})), None)
            .await;
        assert!(result.success);
        let role = store.get(ROLES, "r1").await.unwrap().unwrap();
        assert_eq!(role["requiredSkills"], json!(["sql"]));
        assert!(ops.failures_for("r1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_object_data_is_rejected() {
        let ops = operations(Arc::new(MemoryStore::new()));
        let result = ops.update_role("r1", Some(json!([1, 2])), None).await;
        assert!(!result.success);
        assert!(result.error.unwrap().starts_with("validation failed"));
    }

    #[tokio::test]
    async fn delete_removes_role_from_collaboration() {
        let store = Arc::new(MemoryStore::new());
        seed_collaboration(store.as_ref()).await;
        let ops = operations(store.clone());
        assert!(ops.create_role("r1", Some(json!({"collaborationId": "c1"})), None).await.success);
        assert!(ops.create_role("r2", Some(json!({"collaborationId": "c1"})), None).await.success);

        assert!(ops.delete_role("r1", None, None).await.success);
        assert!(store.get(ROLES, "r1").await.unwrap().is_none());
        let collab = store.get(COLLABORATIONS, "c1").await.unwrap().unwrap();
        assert_eq!(collab["roleIds"], json!(["r2"]));
    }

    #[tokio::test]
    async fn failed_delete_restores_role() {
        let store = FlakyStore::new();
        seed_collaboration(store.as_ref()).await;
        let ops = operations(store.clone());
        assert!(ops.create_role("r1", Some(json!({"collaborationId": "c1"})), None).await.success);
        store.fail_writes_to(COLLABORATIONS);

        let result = ops.delete_role("r1", None, None).await;
        assert!(!result.success);
        let role = store.get(ROLES, "r1").await.unwrap().unwrap();
        assert_eq!(role["id"], "r1");
        let collab = store.get(COLLABORATIONS, "c1").await.unwrap().unwrap();
        assert_eq!(collab["roleIds"], json!(["r1"]));
        assert_eq!(ops.failures_for("r1").await.unwrap()[0].operation, "deleteRole");
    }
}
