//! Durable task queues for the provisioning worker.
//!
//! Three independent, prefix-partitioned queues layered on the persistent
//! store. A queue is a set of due markers discovered by range scan, not a
//! FIFO: iteration order is the store's key order and carries no temporal
//! meaning. Each marker is consumed by exactly one worker pass.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::Batch;
use thiserror::Error;

use crate::store::{
    CLEANUP_TASK_PREFIX, STORE_TASK_PREFIX, Store, StoreError, UPDATE_TASK_PREFIX,
    cleanup_task_key, store_task_key, update_task_key,
};

/// Errors raised by queue operations.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("store error")]
    Store(#[from] StoreError),

    #[error("task serialization error")]
    Serialization(#[from] serde_json::Error),
}

/// A scheduled or forced removal of one file record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupTask {
    /// Record key, `{owner}:{name}`.
    pub key: String,
    pub execute_at: DateTime<Utc>,
    /// Forced tasks remove unconditionally; scheduled tasks are honored
    /// only while the record is still below Stored.
    pub force: bool,
}

impl CleanupTask {
    /// Immediate, unconditional removal (user delete, provider eviction,
    /// vanished bag or contract). Due at `execute_at`, so a pass staging
    /// one against its own captured time sees it due on the same tick.
    pub fn forced(key: String, execute_at: DateTime<Utc>) -> Self {
        Self {
            key,
            execute_at,
            force: true,
        }
    }

    /// Grace-period expiry sweep, honored only for unpaid records.
    pub fn scheduled(key: String, execute_at: DateTime<Utc>) -> Self {
        Self {
            key,
            execute_at,
            force: false,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.execute_at <= now
    }
}

/// A due contract-polling task. The due time lives in the key, not the
/// value, so "everything due" is a bounded range scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateTask {
    /// Record key, `{owner}:{name}`.
    pub key: String,
    /// Unix seconds; zero marks an immediate task that never reschedules.
    pub due_at: i64,
}

impl UpdateTask {
    pub fn is_immediate(&self) -> bool {
        self.due_at == 0
    }
}

/// Discovery and mutation of the three task queues.
pub struct TaskQueues {
    store: Arc<Store>,
}

impl TaskQueues {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Record keys of every file awaiting packaging.
    pub fn pending_store(&self) -> Result<Vec<String>, TaskError> {
        let mut keys = Vec::new();
        for entry in self.store.scan_prefix(STORE_TASK_PREFIX) {
            let (key, _) = entry.map_err(StoreError::from)?;
            let full = String::from_utf8_lossy(&key);
            keys.push(full[STORE_TASK_PREFIX.len()..].to_string());
        }
        Ok(keys)
    }

    /// Cleanup tasks whose execute-at time has passed. Corrupt entries are
    /// logged and skipped, never deleted.
    pub fn pending_cleanup(&self, now: DateTime<Utc>) -> Result<Vec<CleanupTask>, TaskError> {
        let mut due = Vec::new();
        for entry in self.store.scan_prefix(CLEANUP_TASK_PREFIX) {
            let (key, value) = entry.map_err(StoreError::from)?;
            match serde_json::from_slice::<CleanupTask>(&value) {
                Ok(task) if task.is_due(now) => due.push(task),
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(
                        key = %String::from_utf8_lossy(&key),
                        error = %err,
                        "skipping corrupt cleanup task"
                    );
                }
            }
        }
        Ok(due)
    }

    /// Update tasks due by `now`: a range scan bounded at the encoded due
    /// time, so future tasks are never touched.
    pub fn pending_update(&self, now: DateTime<Utc>) -> Result<Vec<UpdateTask>, TaskError> {
        let upper = format!("{UPDATE_TASK_PREFIX}{:020}", now.timestamp() + 1);
        let mut due = Vec::new();
        for entry in self.store.range(UPDATE_TASK_PREFIX, &upper) {
            let (key, _) = entry.map_err(StoreError::from)?;
            let full = String::from_utf8_lossy(&key);
            let suffix = &full[UPDATE_TASK_PREFIX.len()..];
            let Some((due_raw, record_key)) = suffix.split_once(':') else {
                tracing::warn!(key = %full, "malformed update task key");
                continue;
            };
            let Ok(due_at) = due_raw.parse::<i64>() else {
                tracing::warn!(key = %full, "unparseable update task due time");
                continue;
            };
            due.push(UpdateTask {
                key: record_key.to_string(),
                due_at,
            });
        }
        Ok(due)
    }

    // Batch composers: callers assemble one self-contained batch covering
    // every key that must change together.

    pub fn stage_cleanup(batch: &mut Batch, task: &CleanupTask) -> Result<(), TaskError> {
        batch.insert(
            cleanup_task_key(&task.key).as_bytes(),
            serde_json::to_vec(task)?,
        );
        Ok(())
    }

    pub fn stage_update(batch: &mut Batch, due_at: i64, key: &str) {
        batch.insert(update_task_key(due_at, key).as_bytes(), &[][..]);
    }

    pub fn remove_store(batch: &mut Batch, key: &str) {
        batch.remove(store_task_key(key).as_bytes());
    }

    pub fn remove_cleanup(batch: &mut Batch, key: &str) {
        batch.remove(cleanup_task_key(key).as_bytes());
    }

    pub fn remove_update(batch: &mut Batch, task: &UpdateTask) {
        batch.remove(update_task_key(task.due_at, &task.key).as_bytes());
    }
}
