//! Single-file JSON document store used by the CLI.
//!
//! Every `rolecoord` invocation opens its own handle, so the file itself is
//! the shared state. Each operation takes an advisory lock on a sibling
//! `<store>.lock` file (shared for reads, exclusive for writes), reloads the
//! store from disk, and for writes persists the result before releasing the
//! lock. A write goes to `<store>.tmp` and is renamed over the store file, so
//! a failed write changes nothing.
//!
//! File I/O is blocking and runs on tokio's blocking pool.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use fs2::FileExt;
use serde_json::Value;
use tracing::debug;

use super::{
    AtomicFn, BatchWrite, Collections, DocumentStore, StoreError, apply_atomic, apply_write,
    list_docs, read_doc,
};

#[derive(Debug)]
struct StorePaths {
    data: PathBuf,
    lock: PathBuf,
    tmp: PathBuf,
}

#[derive(Debug, Clone)]
pub struct JsonFileStore {
    paths: Arc<StorePaths>,
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

impl JsonFileStore {
    /// Open the store at `path`, starting empty if the file does not exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let data = path.as_ref().to_path_buf();
        let paths = StorePaths {
            lock: sibling(&data, ".lock"),
            tmp: sibling(&data, ".tmp"),
            data,
        };
        paths.read(|_| ())?;

        debug!(path = %paths.data.display(), "opened JSON document store");
        Ok(Self {
            paths: Arc::new(paths),
        })
    }

    pub fn path(&self) -> &Path {
        &self.paths.data
    }

    async fn read<T>(
        &self,
        f: impl FnOnce(&Collections) -> T + Send + 'static,
    ) -> Result<T, StoreError>
    where
        T: Send + 'static,
    {
        let paths = Arc::clone(&self.paths);
        run_blocking(move || paths.read(f)).await
    }

    async fn mutate<T>(
        &self,
        f: impl FnOnce(&mut Collections) -> T + Send + 'static,
    ) -> Result<T, StoreError>
    where
        T: Send + 'static,
    {
        let paths = Arc::clone(&self.paths);
        run_blocking(move || paths.mutate(f)).await
    }
}

async fn run_blocking<T>(
    job: impl FnOnce() -> Result<T, StoreError> + Send + 'static,
) -> Result<T, StoreError>
where
    T: Send + 'static,
{
    tokio::task::spawn_blocking(job)
        .await
        .map_err(|e| StoreError::Unavailable(format!("store worker failed: {e}")))?
}

impl StorePaths {
    fn lock_file(&self) -> Result<File, StoreError> {
        Ok(OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock)?)
    }

    fn load(&self) -> Result<Collections, StoreError> {
        if !self.data.exists() {
            return Ok(Collections::new());
        }
        let contents = fs::read_to_string(&self.data)?;
        if contents.trim().is_empty() {
            return Ok(Collections::new());
        }
        serde_json::from_str::<Collections>(&contents)
            .map_err(|e| StoreError::Corrupt(format!("{}: {e}", self.data.display())))
    }

    fn read<T>(&self, f: impl FnOnce(&Collections) -> T) -> Result<T, StoreError> {
        let lock = self.lock_file()?;
        FileExt::lock_shared(&lock)?;
        let out = self.load().map(|c| f(&c));
        FileExt::unlock(&lock)?;
        out
    }

    /// Reload, apply `f`, and persist, all under the exclusive lock.
    fn mutate<T>(&self, f: impl FnOnce(&mut Collections) -> T) -> Result<T, StoreError> {
        let lock = self.lock_file()?;
        FileExt::lock_exclusive(&lock)?;
        let out = self.load().and_then(|mut collections| {
            let out = f(&mut collections);
            self.persist(&collections)?;
            Ok(out)
        });
        FileExt::unlock(&lock)?;
        out
    }

    fn persist(&self, collections: &Collections) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(collections)?;
        fs::write(&self.tmp, bytes)?;
        fs::rename(&self.tmp, &self.data)?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for JsonFileStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        let (collection, id) = (collection.to_string(), id.to_string());
        self.read(move |c| read_doc(c, &collection, &id)).await
    }

    async fn set(&self, collection: &str, id: &str, data: Value) -> Result<(), StoreError> {
        let write = BatchWrite::set(collection, id, data);
        self.mutate(move |c| apply_write(c, write)).await
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        let write = BatchWrite::delete(collection, id);
        self.mutate(move |c| apply_write(c, write)).await
    }

    async fn list(&self, collection: &str) -> Result<Vec<(String, Value)>, StoreError> {
        let collection = collection.to_string();
        self.read(move |c| list_docs(c, &collection)).await
    }

    async fn run_atomic(
        &self,
        collection: &str,
        id: &str,
        f: AtomicFn,
    ) -> Result<Option<Value>, StoreError> {
        let (collection, id) = (collection.to_string(), id.to_string());
        self.mutate(move |c| apply_atomic(c, &collection, &id, f))
            .await
    }

    async fn write_batch(&self, writes: Vec<BatchWrite>) -> Result<(), StoreError> {
        self.mutate(move |c| {
            for write in writes {
                apply_write(c, write);
            }
        })
        .await
    }
}
