//! Checksummed, transaction-tagged copies of entity state.
//!
//! A snapshot is taken immediately before an entity is mutated and is never
//! changed afterwards. Its checksum is the hex SHA-256 of the compact JSON
//! serialization of `data`; object keys serialize in sorted order, so the
//! encoding is canonical. A snapshot whose checksum no longer matches is
//! corrupt and is never written back.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{CoordError, Result};
use crate::store::{AtomicWrite, BatchWrite, DocumentStore, SNAPSHOT_VERSIONS, SNAPSHOTS, atomic_fn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    pub version: u64,
    pub checksum: String,
    pub transaction_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub id: String,
    pub entity_id: String,
    pub entity_type: String,
    pub data: Value,
    pub metadata: SnapshotMetadata,
    pub timestamp: i64,
}

/// Order snapshots newest first.
///
/// Timestamps order captures of different entities. Captures of the same
/// entity always follow their version counter, which never moves backwards
/// even when the wall clock does.
fn newest_first(mut snapshots: Vec<Snapshot>) -> Vec<Snapshot> {
    snapshots.sort_by_key(|s| Reverse((s.timestamp, s.metadata.version)));

    let mut slots: BTreeMap<(String, String), Vec<usize>> = BTreeMap::new();
    for (i, s) in snapshots.iter().enumerate() {
        slots
            .entry((s.entity_type.clone(), s.entity_id.clone()))
            .or_default()
            .push(i);
    }

    let mut ordered: Vec<Option<Snapshot>> = snapshots.into_iter().map(Some).collect();
    for positions in slots.values() {
        let mut group: Vec<Snapshot> = positions.iter().filter_map(|&i| ordered[i].take()).collect();
        group.sort_by_key(|s| Reverse(s.metadata.version));
        for (&i, s) in positions.iter().zip(group) {
            ordered[i] = Some(s);
        }
    }
    ordered.into_iter().flatten().collect()
}

/// Hex-encoded SHA-256 over the canonical serialization of `data`.
pub fn checksum(data: &Value) -> Result<String> {
    let bytes = serde_json::to_vec(data)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

pub struct SnapshotStore {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
}

impl SnapshotStore {
    pub fn new(store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Persist a copy of `data` as the next version of `(entity_type, entity_id)`.
    ///
    /// Returns only after the snapshot document is written, so callers may
    /// mutate the entity as soon as this resolves.
    pub async fn create_snapshot(
        &self,
        entity_id: &str,
        entity_type: &str,
        data: &Value,
        transaction_id: &str,
    ) -> Result<Snapshot> {
        let version = self.next_version(entity_type, entity_id).await?;
        let snapshot = Snapshot {
            id: Uuid::new_v4().to_string(),
            entity_id: entity_id.to_string(),
            entity_type: entity_type.to_string(),
            data: data.clone(),
            metadata: SnapshotMetadata {
                version,
                checksum: checksum(data)?,
                transaction_id: transaction_id.to_string(),
            },
            timestamp: self.clock.now_ms(),
        };

        self.store
            .set(SNAPSHOTS, &snapshot.id, serde_json::to_value(&snapshot)?)
            .await?;
        debug!(
            snapshot_id = %snapshot.id,
            entity_type,
            entity_id,
            version,
            transaction_id,
            "snapshot captured"
        );
        Ok(snapshot)
    }

    async fn next_version(&self, entity_type: &str, entity_id: &str) -> Result<u64> {
        let key = format!("{entity_type}:{entity_id}");
        let after = self
            .store
            .run_atomic(
                SNAPSHOT_VERSIONS,
                &key,
                atomic_fn(|current| {
                    let version = current
                        .and_then(|doc| doc.get("version"))
                        .and_then(Value::as_u64)
                        .unwrap_or(0);
                    AtomicWrite::Put(json!({ "version": version + 1 }))
                }),
            )
            .await?;

        after
            .as_ref()
            .and_then(|doc| doc.get("version"))
            .and_then(Value::as_u64)
            .ok_or_else(|| CoordError::Transaction(format!("version counter for {key} missing")))
    }

    /// Whether `snapshot.data` still hashes to the recorded checksum.
    pub fn validate_snapshot(&self, snapshot: &Snapshot) -> bool {
        checksum(&snapshot.data).is_ok_and(|sum| sum == snapshot.metadata.checksum)
    }

    pub async fn get_snapshot(&self, snapshot_id: &str) -> Result<Snapshot> {
        let doc = self
            .store
            .get(SNAPSHOTS, snapshot_id)
            .await?
            .ok_or_else(|| CoordError::not_found("snapshot", snapshot_id))?;
        decode(snapshot_id, doc)
    }

    /// Write a snapshot back to its entity, stamping where it came from.
    ///
    /// A snapshot failing verification is rejected with
    /// [`CoordError::InvalidSnapshot`] and nothing is written.
    pub async fn restore_snapshot(&self, snapshot_id: &str) -> Result<()> {
        let snapshot = self.get_snapshot(snapshot_id).await?;
        self.ensure_valid(&snapshot)?;

        let restored = stamp_restored(&snapshot, self.clock.now_ms());
        self.store
            .set(&snapshot.entity_type, &snapshot.entity_id, restored)
            .await?;
        info!(
            snapshot_id,
            entity_type = %snapshot.entity_type,
            entity_id = %snapshot.entity_id,
            "entity restored from snapshot"
        );
        Ok(())
    }

    /// Restore every snapshot taken by `transaction_id`, newest first, in one
    /// batch write. Returns the number of snapshots applied.
    pub async fn rollback_transaction(&self, transaction_id: &str) -> Result<usize> {
        let writes = self.rollback_writes(transaction_id).await?;
        let restored = writes.len();
        if restored == 0 {
            return Ok(0);
        }
        self.store.write_batch(writes).await?;
        info!(transaction_id, restored, "transaction snapshots restored");
        Ok(restored)
    }

    /// The writes that undo `transaction_id`, without applying them.
    ///
    /// Within a batch later writes win, so ordering newest-first leaves each
    /// entity at the value captured closest to the start of the transaction.
    /// Every snapshot is verified first; one corrupt snapshot fails the whole
    /// rollback before anything is written.
    pub async fn rollback_writes(&self, transaction_id: &str) -> Result<Vec<BatchWrite>> {
        let snapshots = self.snapshots_for_transaction(transaction_id).await?;
        for snapshot in &snapshots {
            self.ensure_valid(snapshot)?;
        }

        let snapshots = newest_first(snapshots);
        let now = self.clock.now_ms();
        Ok(snapshots
            .iter()
            .map(|s| BatchWrite::set(&s.entity_type, &s.entity_id, stamp_restored(s, now)))
            .collect())
    }

    /// The newest snapshot of an entity that still passes verification.
    pub async fn get_last_valid_snapshot(
        &self,
        entity_id: &str,
        entity_type: &str,
    ) -> Result<Option<Snapshot>> {
        let snapshots = self.snapshots_for_entity(entity_id, entity_type).await?;
        Ok(snapshots
            .into_iter()
            .filter(|s| self.validate_snapshot(s))
            .max_by_key(|s| s.metadata.version))
    }

    /// All readable snapshots of an entity, oldest version first.
    pub async fn snapshots_for_entity(
        &self,
        entity_id: &str,
        entity_type: &str,
    ) -> Result<Vec<Snapshot>> {
        let docs = self
            .store
            .query(SNAPSHOTS, "entityId", &Value::String(entity_id.to_string()))
            .await?;
        let mut snapshots: Vec<Snapshot> = docs
            .into_iter()
            .filter_map(|(id, doc)| decode(&id, doc).ok())
            .filter(|s| s.entity_type == entity_type)
            .collect();
        snapshots.sort_by_key(|s| s.metadata.version);
        Ok(snapshots)
    }

    /// All snapshots tagged with `transaction_id`, oldest first.
    ///
    /// An unreadable snapshot document is reported as invalid rather than
    /// skipped: a rollback must never silently miss part of a transaction.
    pub async fn snapshots_for_transaction(&self, transaction_id: &str) -> Result<Vec<Snapshot>> {
        let docs = self.store.list(SNAPSHOTS).await?;
        let mut snapshots = Vec::new();
        for (id, doc) in docs {
            let tagged = doc
                .pointer("/metadata/transactionId")
                .and_then(Value::as_str)
                == Some(transaction_id);
            if tagged {
                snapshots.push(decode(&id, doc)?);
            }
        }
        let mut snapshots = newest_first(snapshots);
        snapshots.reverse();
        Ok(snapshots)
    }

    /// Delete all but the `keep` newest snapshots of an entity.
    pub async fn prune_snapshots(
        &self,
        entity_id: &str,
        entity_type: &str,
        keep: usize,
    ) -> Result<usize> {
        let snapshots = self.snapshots_for_entity(entity_id, entity_type).await?;
        let excess = snapshots.len().saturating_sub(keep);
        if excess == 0 {
            return Ok(0);
        }

        let writes = snapshots
            .iter()
            .take(excess)
            .map(|s| BatchWrite::delete(SNAPSHOTS, &s.id))
            .collect();
        self.store.write_batch(writes).await?;
        debug!(entity_type, entity_id, pruned = excess, "old snapshots pruned");
        Ok(excess)
    }

    fn ensure_valid(&self, snapshot: &Snapshot) -> Result<()> {
        if self.validate_snapshot(snapshot) {
            return Ok(());
        }
        error!(
            snapshot_id = %snapshot.id,
            entity_type = %snapshot.entity_type,
            entity_id = %snapshot.entity_id,
            "snapshot checksum mismatch"
        );
        Err(CoordError::InvalidSnapshot {
            snapshot_id: snapshot.id.clone(),
        })
    }
}

fn decode(id: &str, doc: Value) -> Result<Snapshot> {
    serde_json::from_value(doc).map_err(|_| CoordError::InvalidSnapshot {
        snapshot_id: id.to_string(),
    })
}

fn stamp_restored(snapshot: &Snapshot, now_ms: i64) -> Value {
    let mut data = snapshot.data.clone();
    if let Some(obj) = data.as_object_mut() {
        obj.insert("restoredFromSnapshot".into(), Value::String(snapshot.id.clone()));
        obj.insert("restoredAt".into(), Value::from(now_ms));
    }
    data
}
