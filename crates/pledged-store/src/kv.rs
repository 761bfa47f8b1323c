//! fjall-backed key-value store.
//!
//! A thin façade over a fjall keyspace with named partitions and a small
//! write-batch transaction. Commits persist with `SyncAll` so a completed
//! promise is durable before its in-memory reference is demoted.

use std::collections::HashMap;
use std::path::PathBuf;

use fjall::{Config as FjallConfig, Keyspace, PartitionHandle, PersistMode};
use tempfile::TempDir;
use tracing::{debug, error};

use crate::error::{StoreError, StoreResult};

/// Completed promise blobs, keyed by the 12-byte promise id.
pub const COL_PROMISES: &str = "promises";
/// Store-level metadata (sequence high-water).
pub const COL_META: &str = "meta";

const COLLECTIONS: &[&str] = &[COL_PROMISES, COL_META];

/// Smallest accepted hash index budget.
pub const MIN_HASH_INDEX_SIZE: i64 = 256;
/// Largest accepted hash index budget.
pub const MAX_HASH_INDEX_SIZE: i64 = 1 << 40;

/// Assumed bytes of cache per hash index entry when sizing fjall's cache.
const BYTES_PER_INDEX_ENTRY: i64 = 64;

#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Filesystem path for the log device; empty means a temp-dir backed
    /// store that is unlinked on drop.
    pub path: String,
    /// Pre-size the log device. fjall sizes its journal internally, so this
    /// is accepted and recorded but has no further effect.
    pub preallocate: bool,
    /// Unlink backing files on teardown.
    pub delete_on_dispose: bool,
    /// Entries in the in-memory hash index, clamped to
    /// `[MIN_HASH_INDEX_SIZE, MAX_HASH_INDEX_SIZE]`.
    pub hash_index_size: i64,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            path: String::new(),
            preallocate: false,
            delete_on_dispose: false,
            hash_index_size: 1 << 20,
        }
    }
}

impl StoreOptions {
    pub fn clamped_hash_index_size(&self) -> i64 {
        self.hash_index_size
            .clamp(MIN_HASH_INDEX_SIZE, MAX_HASH_INDEX_SIZE)
    }
}

pub struct Store {
    keyspace: Keyspace,
    collections: HashMap<&'static str, PartitionHandle>,
    root: PathBuf,
    delete_on_dispose: bool,
    // Held for the lifetime of an empty-path store; dropping removes it.
    _temp: Option<TempDir>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("root", &self.root)
            .field("collections", &self.collections.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Store {
    pub fn open(options: &StoreOptions) -> StoreResult<Self> {
        let (root, temp) = if options.path.is_empty() {
            let temp = TempDir::new()?;
            (temp.path().join("pledged"), Some(temp))
        } else {
            (PathBuf::from(&options.path), None)
        };
        if options.preallocate {
            debug!("preallocation requested; fjall sizes its journal internally");
        }

        let cache = options.clamped_hash_index_size() as u64 * BYTES_PER_INDEX_ENTRY as u64;
        let keyspace = FjallConfig::new(&root).cache_size(cache).open()?;

        let mut collections = HashMap::new();
        for name in COLLECTIONS {
            collections.insert(*name, keyspace.open_partition(name, Default::default())?);
        }

        Ok(Self {
            keyspace,
            collections,
            root,
            delete_on_dispose: options.delete_on_dispose,
            _temp: temp,
        })
    }

    pub fn collection(&self, name: &str) -> StoreResult<&PartitionHandle> {
        self.collections
            .get(name)
            .ok_or_else(|| StoreError::Persistence(format!("unknown collection {name}")))
    }

    pub fn get(&self, collection: &str, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let partition = self.collection(collection)?;
        Ok(partition.get(key)?.map(|v| v.to_vec()))
    }

    pub fn contains(&self, collection: &str, key: &[u8]) -> StoreResult<bool> {
        let partition = self.collection(collection)?;
        Ok(partition.contains_key(key)?)
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if self.delete_on_dispose && self._temp.is_none() {
            if let Err(e) = std::fs::remove_dir_all(&self.root) {
                error!("failed to unlink store at {}: {}", self.root.display(), e);
            }
        }
    }
}

/// Buffered writes applied atomically-enough for single-key blobs and
/// persisted with `SyncAll` on commit.
#[derive(Default)]
pub struct WriteTransaction {
    changes: Vec<(&'static str, Vec<u8>, Option<Vec<u8>>)>,
}

impl WriteTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, collection: &'static str, key: Vec<u8>, value: Vec<u8>) {
        self.changes.push((collection, key, Some(value)));
    }

    pub fn delete(&mut self, collection: &'static str, key: Vec<u8>) {
        self.changes.push((collection, key, None));
    }

    pub fn commit(self, store: &Store) -> StoreResult<()> {
        for (collection, key, value) in &self.changes {
            let partition = store.collection(collection)?;
            match value {
                Some(value) => partition.insert(key, value)?,
                None => partition.remove(key)?,
            }
        }
        store.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }
}
