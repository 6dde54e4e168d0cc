//! Persistent key-value store for records and task queues.
//!
//! Wraps a single exclusively-owned sled tree. Consistency is achieved by
//! constructing every multi-key change as one atomic batch; there are no
//! cross-call transactions. Each logical entity family lives under its own
//! key prefix so pending work is discovered by bounded prefix scans.

use std::path::Path;

use sled::{Batch, Db, IVec};
use thiserror::Error;

/// File records, one per (owner, file name) pair.
pub const FILE_PREFIX: &str = "file:";
/// Bag reference records, one per distinct bag root hash.
pub const BAG_PREFIX: &str = "bag:";
/// Durable markers for files awaiting packaging.
pub const STORE_TASK_PREFIX: &str = "task/store:";
/// Scheduled or forced removal tasks, JSON-valued.
pub const CLEANUP_TASK_PREFIX: &str = "task/clean:";
/// Contract polling tasks; the due time is part of the key.
pub const UPDATE_TASK_PREFIX: &str = "task/update:";
/// Per-owner refresh throttle stamps.
pub const REFRESH_PREFIX: &str = "refresh:";

/// Errors raised by the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error")]
    Backend(#[from] sled::Error),
}

/// Exclusive handle over the embedded store.
///
/// Opened once at process start and closed once at shutdown. All writers
/// go through [`Store::apply`] so that every consistent change is a single
/// atomic batch.
pub struct Store {
    db: Db,
}

impl Store {
    /// Opens (or creates) the store at the given directory.
    ///
    /// # Errors
    /// - `StoreError::Backend` - The tree cannot be opened, which is fatal
    ///   at startup.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// Opens an in-memory store backed by a temporary file, for tests.
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    pub fn get(&self, key: &str) -> Result<Option<IVec>, StoreError> {
        Ok(self.db.get(key.as_bytes())?)
    }

    pub fn contains_key(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.db.contains_key(key.as_bytes())?)
    }

    /// Writes a single key outside of any batch.
    pub fn insert(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.db.insert(key.as_bytes(), value)?;
        Ok(())
    }

    /// Atomically applies a multi-key batch.
    pub fn apply(&self, batch: Batch) -> Result<(), StoreError> {
        self.db.apply_batch(batch)?;
        Ok(())
    }

    /// Iterates all entries under a prefix, in key order.
    ///
    /// Key order is the store's native byte order, not insertion order;
    /// callers must not rely on FIFO.
    pub fn scan_prefix(
        &self,
        prefix: &str,
    ) -> impl Iterator<Item = Result<(IVec, IVec), sled::Error>> {
        self.db.scan_prefix(prefix.as_bytes())
    }

    /// Iterates entries in `[from, to)`, in key order.
    pub fn range(
        &self,
        from: &str,
        to: &str,
    ) -> impl Iterator<Item = Result<(IVec, IVec), sled::Error>> {
        self.db.range(from.as_bytes().to_vec()..to.as_bytes().to_vec())
    }

    /// Flushes buffered writes to disk. Called once during shutdown after
    /// the in-flight worker tick has finished.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

/// Composite record key, `{owner}:{name}`. Task markers and file records
/// both carry this suffix.
pub fn record_key(owner: &str, name: &str) -> String {
    format!("{owner}:{name}")
}

pub fn file_key(key: &str) -> String {
    format!("{FILE_PREFIX}{key}")
}

pub fn bag_key(root_hash_hex: &str) -> String {
    format!("{BAG_PREFIX}{root_hash_hex}")
}

pub fn store_task_key(key: &str) -> String {
    format!("{STORE_TASK_PREFIX}{key}")
}

pub fn cleanup_task_key(key: &str) -> String {
    format!("{CLEANUP_TASK_PREFIX}{key}")
}

/// Update task keys embed the due time as a zero-padded sortable prefix
/// component, so "everything due by now" is a bounded range scan.
pub fn update_task_key(due_at_unix: i64, key: &str) -> String {
    format!("{UPDATE_TASK_PREFIX}{:020}:{key}", due_at_unix.max(0))
}

pub fn refresh_stamp_key(owner: &str) -> String {
    format!("{REFRESH_PREFIX}{owner}")
}
