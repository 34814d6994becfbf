//! Document store abstraction used by every coordination component.
//!
//! The coordinator never talks to a concrete database. It needs point
//! reads and writes keyed by `(collection, id)`, a listing primitive, an
//! all-or-nothing batch write, and an atomic read-modify-write scoped to a
//! single document. [`MemoryStore`] keeps documents in process memory;
//! [`JsonFileStore`] keeps them in one file shared by every process that
//! opens it.

pub mod error;
pub mod file;
pub mod memory;
#[cfg(test)]
pub(crate) mod testing;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;

pub use error::StoreError;
pub use file::JsonFileStore;
pub use memory::MemoryStore;

pub const ROLES: &str = "roles";
pub const COLLABORATIONS: &str = "collaborations";
pub const LOCKS: &str = "locks";
pub const SNAPSHOTS: &str = "snapshots";
pub const SNAPSHOT_VERSIONS: &str = "snapshot_versions";
pub const APPLICATIONS: &str = "role_applications";
pub const COMPLETIONS: &str = "role_completions";
pub const PROGRESS: &str = "role_progress";
pub const FAILURES: &str = "role_operation_failures";

/// Decision returned by the closure passed to [`DocumentStore::run_atomic`].
#[derive(Debug, Clone, PartialEq)]
pub enum AtomicWrite {
    /// Leave the document as it is.
    Keep,
    /// Replace (or create) the document.
    Put(Value),
    /// Delete the document.
    Remove,
}

/// Read-modify-write step executed while the store holds the document exclusively.
pub type AtomicFn = Box<dyn FnOnce(Option<&Value>) -> AtomicWrite + Send>;

/// Box a closure as an [`AtomicFn`].
pub fn atomic_fn<F>(f: F) -> AtomicFn
where
    F: FnOnce(Option<&Value>) -> AtomicWrite + Send + 'static,
{
    Box::new(f)
}

/// One write inside a [`DocumentStore::write_batch`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchWrite {
    Set {
        collection: String,
        id: String,
        data: Value,
    },
    Delete {
        collection: String,
        id: String,
    },
}

impl BatchWrite {
    pub fn set(collection: &str, id: &str, data: Value) -> Self {
        BatchWrite::Set {
            collection: collection.to_string(),
            id: id.to_string(),
            data,
        }
    }

    pub fn delete(collection: &str, id: &str) -> Self {
        BatchWrite::Delete {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }
}

/// Storage backend consumed by locks, snapshots, and the role executor.
///
/// Implementations must be `Send + Sync` so one store can be shared behind an
/// `Arc` by every component and across spawned tasks.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError>;

    async fn set(&self, collection: &str, id: &str, data: Value) -> Result<(), StoreError>;

    /// Deleting a missing document is not an error.
    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError>;

    /// All documents of a collection as `(id, document)` pairs, ordered by id.
    async fn list(&self, collection: &str) -> Result<Vec<(String, Value)>, StoreError>;

    /// Documents whose top-level `field` equals `value`.
    async fn query(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<(String, Value)>, StoreError> {
        let docs = self.list(collection).await?;
        Ok(docs
            .into_iter()
            .filter(|(_, doc)| doc.get(field) == Some(value))
            .collect())
    }

    /// Run `f` against the current document with no other writer interleaving,
    /// apply its decision, and return the document as it stands afterwards.
    async fn run_atomic(
        &self,
        collection: &str,
        id: &str,
        f: AtomicFn,
    ) -> Result<Option<Value>, StoreError>;

    /// Apply every write in order, or none of them.
    async fn write_batch(&self, writes: Vec<BatchWrite>) -> Result<(), StoreError>;
}

/// Collection name -> document id -> document.
pub(crate) type Collections = BTreeMap<String, BTreeMap<String, Value>>;

pub(crate) fn read_doc(collections: &Collections, collection: &str, id: &str) -> Option<Value> {
    collections.get(collection).and_then(|c| c.get(id)).cloned()
}

pub(crate) fn apply_write(collections: &mut Collections, write: BatchWrite) {
    match write {
        BatchWrite::Set {
            collection,
            id,
            data,
        } => {
            collections.entry(collection).or_default().insert(id, data);
        }
        BatchWrite::Delete { collection, id } => {
            if let Some(docs) = collections.get_mut(&collection) {
                docs.remove(&id);
            }
        }
    }
}

pub(crate) fn apply_atomic(
    collections: &mut Collections,
    collection: &str,
    id: &str,
    f: AtomicFn,
) -> Option<Value> {
    let current = read_doc(collections, collection, id);
    match f(current.as_ref()) {
        AtomicWrite::Keep => current,
        AtomicWrite::Put(data) => {
            apply_write(collections, BatchWrite::set(collection, id, data.clone()));
            Some(data)
        }
        AtomicWrite::Remove => {
            apply_write(collections, BatchWrite::delete(collection, id));
            None
        }
    }
}

pub(crate) fn list_docs(collections: &Collections, collection: &str) -> Vec<(String, Value)> {
    collections
        .get(collection)
        .map(|docs| docs.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default()
}
