use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use super::{
    AtomicFn, BatchWrite, Collections, DocumentStore, StoreError, apply_atomic, apply_write,
    list_docs, read_doc,
};

/// Process-local document store. Every operation takes one short mutex
/// section, which makes `run_atomic` and `write_batch` trivially atomic.
#[derive(Default)]
pub struct MemoryStore {
    collections: Mutex<Collections>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents currently stored in `collection`.
    pub fn count(&self, collection: &str) -> usize {
        self.collections
            .lock()
            .get(collection)
            .map(|docs| docs.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        Ok(read_doc(&self.collections.lock(), collection, id))
    }

    async fn set(&self, collection: &str, id: &str, data: Value) -> Result<(), StoreError> {
        apply_write(
            &mut self.collections.lock(),
            BatchWrite::set(collection, id, data),
        );
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        apply_write(
            &mut self.collections.lock(),
            BatchWrite::delete(collection, id),
        );
        Ok(())
    }

    async fn list(&self, collection: &str) -> Result<Vec<(String, Value)>, StoreError> {
        Ok(list_docs(&self.collections.lock(), collection))
    }

    async fn run_atomic(
        &self,
        collection: &str,
        id: &str,
        f: AtomicFn,
    ) -> Result<Option<Value>, StoreError> {
        Ok(apply_atomic(&mut self.collections.lock(), collection, id, f))
    }

    async fn write_batch(&self, writes: Vec<BatchWrite>) -> Result<(), StoreError> {
        let mut collections = self.collections.lock();
        for write in writes {
            apply_write(&mut collections, write);
        }
        Ok(())
    }
}
