//! File records and bag reference records.
//!
//! A file record tracks one (owner, file name) pair from upload through
//! packaging and provider storage. A bag reference record counts how many
//! file records share one bag content hash; the count is the only thing
//! that decides when the physical bag may be removed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sled::Batch;
use thiserror::Error;

use crate::daemon::BagId;
use crate::store::{
    self, FILE_PREFIX, Store, StoreError, cleanup_task_key, file_key, record_key,
    refresh_stamp_key, store_task_key, update_task_key,
};
use crate::tasks::CleanupTask;

/// Lifecycle state of a file record.
///
/// Monotonically non-decreasing; the only way back is a cleanup task
/// deleting the record entirely, which frees the slot for a fresh upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum FileState {
    /// Uploaded, awaiting packaging.
    New,
    /// Packaged into a bag, contract address known, awaiting deployment.
    Bagged,
    /// Provider contract observed on chain; payment is being monitored.
    Stored,
}

impl From<FileState> for u8 {
    fn from(state: FileState) -> Self {
        match state {
            FileState::New => 0,
            FileState::Bagged => 1,
            FileState::Stored => 2,
        }
    }
}

impl TryFrom<u8> for FileState {
    type Error = String;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(FileState::New),
            1 => Ok(FileState::Bagged),
            2 => Ok(FileState::Stored),
            other => Err(format!("unknown file state: {other}")),
        }
    }
}

/// Identity of the packaged content, fixed once the bag exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BagSummary {
    pub root_hash: BagId,
    pub merkle_hash: Vec<u8>,
    /// Payload plus header, in bytes.
    pub full_size: u64,
    pub piece_size: u32,
    pub created_at: DateTime<Utc>,
}

/// Last observed provider-side status for a stored file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInfo {
    /// Contract balance, rendered in whole coins.
    pub balance: String,
    /// Daily price, rendered in whole coins.
    pub per_day: String,
    pub status: String,
    pub reason: String,
    pub time_left: String,
    pub last_updated: DateTime<Utc>,
    /// Set while a non-transient error status persists; cleared on
    /// recovery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_since: Option<DateTime<Utc>>,
}

/// One tracked file per (owner, file name) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub state: FileState,
    pub owner_address: String,
    /// Upload name as given by the owner; the record key component, never
    /// rewritten.
    pub name: String,
    /// Physical path relative to the upload root; rewritten to the
    /// canonical path when the bag content deduplicates against an
    /// earlier upload.
    pub file_path: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bag: Option<BagSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderInfo>,
}

impl FileRecord {
    pub fn new(owner: &str, name: &str) -> Self {
        Self {
            state: FileState::New,
            owner_address: owner.to_string(),
            name: name.to_string(),
            file_path: format!("{owner}/{name}"),
            created_at: Utc::now(),
            bag: None,
            contract_address: None,
            provider: None,
        }
    }

    /// The `{owner}:{name}` key this record is stored under. Uses the
    /// original upload name, which stays stable across dedup path
    /// rewrites.
    pub fn key(&self) -> String {
        record_key(&self.owner_address, &self.name)
    }
}

/// Reference count for one distinct bag content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BagRefRecord {
    pub usage_count: u32,
    /// Root-relative path of the upload that first produced this bag; all
    /// later duplicates point here.
    pub canonical_path: String,
}

/// Errors raised by record operations.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("a file named {name} already exists for {owner}, remove it first")]
    AlreadyExists { owner: String, name: String },

    #[error("file is paid and stored at the provider; withdraw the contract instead")]
    Conflict,

    #[error("store error")]
    Store(#[from] StoreError),

    #[error("record serialization error")]
    Serialization(#[from] serde_json::Error),
}

/// CRUD access to file records on top of the persistent store.
///
/// Safe to share across the HTTP layer and the worker: the only in-memory
/// synchronization is a short-held mutex around each check-then-write
/// sequence; everything else relies on single-batch atomicity.
pub struct FileRepository {
    store: Arc<Store>,
    create_lock: Mutex<()>,
    refresh_lock: Mutex<()>,
}

impl FileRepository {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            create_lock: Mutex::new(()),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Creates a New-state record and its store task in one batch.
    ///
    /// # Errors
    /// - `RecordError::AlreadyExists` - A record for (owner, name) exists;
    ///   the caller must delete it before re-uploading.
    pub fn create_record(&self, owner: &str, name: &str) -> Result<FileRecord, RecordError> {
        let record = FileRecord::new(owner, name);
        let key = record.key();
        let payload = serde_json::to_vec(&record)?;

        // The existence check and the write must not interleave with a
        // concurrent create for the same key.
        let _guard = self.create_lock.lock();
        if self.store.contains_key(&file_key(&key))? {
            return Err(RecordError::AlreadyExists {
                owner: owner.to_string(),
                name: name.to_string(),
            });
        }

        let mut batch = Batch::default();
        batch.insert(file_key(&key).as_bytes(), payload);
        batch.insert(store_task_key(&key).as_bytes(), &[][..]);
        self.store.apply(batch)?;
        Ok(record)
    }

    pub fn get(&self, owner: &str, name: &str) -> Result<Option<FileRecord>, RecordError> {
        self.get_by_key(&record_key(owner, name))
    }

    /// Absence is not an error; a corrupt value is, so the caller can log
    /// and skip without deleting anything.
    pub fn get_by_key(&self, key: &str) -> Result<Option<FileRecord>, RecordError> {
        match self.store.get(&file_key(key))? {
            None => Ok(None),
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
        }
    }

    /// All records for one owner, in store key order. Callers re-sort for
    /// presentation; the store guarantees nothing temporal.
    pub fn list_for_owner(&self, owner: &str) -> Result<Vec<FileRecord>, RecordError> {
        let prefix = format!("{FILE_PREFIX}{owner}:");
        let mut records = Vec::new();
        for entry in self.store.scan_prefix(&prefix) {
            let (key, value) = entry.map_err(StoreError::from)?;
            match serde_json::from_slice::<FileRecord>(&value) {
                Ok(record) => records.push(record),
                Err(err) => {
                    tracing::warn!(
                        key = %String::from_utf8_lossy(&key),
                        error = %err,
                        "skipping corrupt file record"
                    );
                }
            }
        }
        Ok(records)
    }

    /// Enqueues a forced cleanup for an unpaid file.
    ///
    /// # Errors
    /// - `RecordError::Conflict` - The file is already paid and stored; a
    ///   funded contract must be withdrawn through the chain, not deleted
    ///   here.
    pub fn request_deletion(&self, owner: &str, name: &str) -> Result<(), RecordError> {
        let Some(record) = self.get(owner, name)? else {
            return Ok(());
        };
        if record.state >= FileState::Stored {
            return Err(RecordError::Conflict);
        }

        let task = CleanupTask::forced(record_key(owner, name), Utc::now());
        self.store
            .insert(&cleanup_task_key(&task.key), &serde_json::to_vec(&task)?)?;
        Ok(())
    }

    /// Schedules immediate update tasks for the given record keys unless
    /// the owner was refreshed within `min_interval`.
    ///
    /// Best-effort polling throttle: returns whether tasks were enqueued.
    /// Callers treat any error as non-fatal so listing never blocks on it.
    pub fn refresh_if_stale(
        &self,
        owner: &str,
        keys: &[String],
        min_interval: Duration,
    ) -> Result<bool, RecordError> {
        let stamp_key = refresh_stamp_key(owner);
        let now = Utc::now().timestamp();

        let _guard = self.refresh_lock.lock();
        if let Some(raw) = self.store.get(&stamp_key)? {
            let stamp = std::str::from_utf8(&raw)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .unwrap_or(0);
            if stamp > now - min_interval.as_secs() as i64 {
                return Ok(false);
            }
        }

        let mut batch = Batch::default();
        for key in keys {
            // Due time zero marks an immediate, non-repeating poll.
            batch.insert(update_task_key(0, key).as_bytes(), &[][..]);
        }
        batch.insert(stamp_key.as_bytes(), now.to_string().as_bytes());
        self.store.apply(batch)?;
        Ok(true)
    }

    pub(crate) fn store(&self) -> &Arc<Store> {
        &self.store
    }
}

/// Key for a bag reference record.
pub fn bag_ref_key(id: BagId) -> String {
    store::bag_key(&id.to_string())
}
