//! Store wrappers for failure injection and contention in unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use super::{AtomicFn, BatchWrite, DocumentStore, MemoryStore, StoreError};

/// Wraps a [`MemoryStore`], failing writes to selected collections on demand
/// and optionally slowing role writes down to widen race windows.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    failing: Mutex<Vec<String>>,
    fail_batches: AtomicBool,
    write_delay_ms: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every `set`/`delete` against `collection` fail.
    pub fn fail_writes_to(&self, collection: &str) {
        self.failing.lock().push(collection.to_string());
    }

    pub fn heal(&self) {
        self.failing.lock().clear();
        self.fail_batches.store(false, Ordering::SeqCst);
    }

    pub fn fail_batches(&self) {
        self.fail_batches.store(true, Ordering::SeqCst);
    }

    /// Delay every `set` on the roles collection by `ms`.
    pub fn slow_role_writes(&self, ms: usize) {
        self.write_delay_ms.store(ms, Ordering::SeqCst);
    }

    /// Highest number of role writes observed running at the same time.
    pub fn max_concurrent_role_writes(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn check(&self, collection: &str) -> Result<(), StoreError> {
        if self.failing.lock().iter().any(|c| c == collection) {
            return Err(StoreError::Unavailable(format!(
                "injected failure writing to {collection}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for FlakyStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        self.inner.get(collection, id).await
    }

    async fn set(&self, collection: &str, id: &str, data: Value) -> Result<(), StoreError> {
        self.check(collection)?;
        if collection == super::ROLES {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let delay = self.write_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay as u64)).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        self.inner.set(collection, id, data).await
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        self.check(collection)?;
        self.inner.delete(collection, id).await
    }

    async fn list(&self, collection: &str) -> Result<Vec<(String, Value)>, StoreError> {
        self.inner.list(collection).await
    }

    async fn run_atomic(
        &self,
        collection: &str,
        id: &str,
        f: AtomicFn,
    ) -> Result<Option<Value>, StoreError> {
        self.check(collection)?;
        self.inner.run_atomic(collection, id, f).await
    }

    async fn write_batch(&self, writes: Vec<BatchWrite>) -> Result<(), StoreError> {
        if self.fail_batches.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected batch failure".into()));
        }
        self.inner.write_batch(writes).await
    }
}
