//! Provisioning worker.
//!
//! A single periodic driver task runs three strictly sequential passes
//! per tick: store (package uploads into bags), cleanup (remove records
//! whose time has come), update (poll provider contracts). Each pass
//! commits its effects as atomic store batches, so a crash between ticks
//! leaves only committed states behind and every pass is safe to replay.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sled::Batch;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::chain::{ChainClient, ChainError};
use crate::config::WorkerConfig;
use crate::contract::contract_address;
use crate::daemon::{DaemonError, StorageDaemon};
use crate::pricing::{format_nano, price_per_day, time_remaining};
use crate::records::{
    BagRefRecord, BagSummary, FileRecord, FileRepository, FileState, ProviderInfo, RecordError,
    bag_ref_key,
};
use crate::store::{StoreError, file_key};
use crate::tasks::{CleanupTask, TaskError, TaskQueues, UpdateTask};

#[cfg(test)]
pub mod test_mocks;

/// Errors raised inside worker passes.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("store error")]
    Store(#[from] StoreError),

    #[error("record error")]
    Record(#[from] RecordError),

    #[error("task queue error")]
    Task(#[from] TaskError),

    #[error("storage daemon error")]
    Daemon(#[from] DaemonError),

    #[error("chain error")]
    Chain(#[from] ChainError),

    #[error("serialization error")]
    Serialization(#[from] serde_json::Error),
}

/// The provisioning state machine.
///
/// Owns no task state of its own; every decision is re-derived from the
/// persistent store each tick.
pub struct Provisioner {
    repo: Arc<FileRepository>,
    queues: TaskQueues,
    daemon: Arc<dyn StorageDaemon>,
    chain: Arc<dyn ChainClient>,
    config: WorkerConfig,
    upload_root: PathBuf,
    provider_key: Vec<u8>,
}

/// What one update task resolved to. Outcomes are collected for the whole
/// pass and committed as a single batch.
struct UpdateOutcome {
    task: UpdateTask,
    /// Next due time; `None` drops the task without rescheduling.
    next_at: Option<i64>,
    /// Updated record to persist alongside the reschedule.
    record: Option<FileRecord>,
    forced_cleanup: bool,
}

impl Provisioner {
    pub fn new(
        repo: Arc<FileRepository>,
        daemon: Arc<dyn StorageDaemon>,
        chain: Arc<dyn ChainClient>,
        config: WorkerConfig,
        upload_root: PathBuf,
        provider_key: Vec<u8>,
    ) -> Self {
        let queues = TaskQueues::new(Arc::clone(repo.store()));
        Self {
            repo,
            queues,
            daemon,
            chain,
            config,
            upload_root,
            provider_key,
        }
    }

    /// Runs one full tick: store, cleanup, update, in that order.
    ///
    /// Per-task failures are logged and retried next tick; only a broken
    /// store surfaces as an error.
    pub async fn tick(&self) -> Result<(), WorkerError> {
        let now = Utc::now();
        self.store_pass(now).await?;
        self.cleanup_pass(now).await?;
        self.update_pass(now).await?;
        Ok(())
    }

    /// Spawns the periodic driver task and returns its handle.
    pub fn start(self) -> ProvisionerHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let tick_interval = self.config.tick_interval;

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        tracing::info!("provisioner shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(err) = self.tick().await {
                            tracing::error!(error = %err, "worker tick failed");
                        }
                    }
                }
            }
        });

        ProvisionerHandle {
            shutdown_tx,
            join,
        }
    }

    fn upload_path(&self, record: &FileRecord) -> PathBuf {
        self.upload_root.join(&record.file_path)
    }

    // Store pass: one batch per task.

    async fn store_pass(&self, now: DateTime<Utc>) -> Result<(), WorkerError> {
        for key in self.queues.pending_store()? {
            if let Err(err) = self.store_one(&key, now).await {
                tracing::warn!(key = %key, error = %err, "store task failed, will retry");
            }
        }
        Ok(())
    }

    /// Packages one uploaded file into a bag and commits the transition to
    /// Bagged. Replay-safe: a record already past New just drops its
    /// marker.
    async fn store_one(&self, key: &str, now: DateTime<Utc>) -> Result<(), WorkerError> {
        let record = self.repo.get_by_key(key)?;
        let mut record = match record {
            Some(record) if record.state == FileState::New => record,
            _ => {
                // Done already, or the record is gone. Drop the marker.
                let mut batch = Batch::default();
                TaskQueues::remove_store(&mut batch, key);
                self.repo.store().apply(batch)?;
                return Ok(());
            }
        };

        let path = self.upload_path(&record);
        let id = self
            .daemon
            .create_bag(&path, &record.name, &[record.name.clone()])
            .await?;
        let details = self.daemon.bag_details(id).await?;

        let bag = BagSummary {
            root_hash: id,
            merkle_hash: details.merkle_hash,
            full_size: details.size + details.header_size,
            piece_size: details.piece_size,
            created_at: now,
        };

        // Dedup: a second upload of identical content shares the existing
        // bag and its canonical path.
        let ref_key = bag_ref_key(id);
        let mut duplicate_path: Option<PathBuf> = None;
        let bag_ref = match self.repo.store().get(&ref_key)? {
            Some(raw) => {
                let mut existing: BagRefRecord = serde_json::from_slice(&raw)?;
                existing.usage_count += 1;
                if existing.canonical_path != record.file_path {
                    duplicate_path = Some(self.upload_path(&record));
                    record.file_path = existing.canonical_path.clone();
                }
                existing
            }
            None => BagRefRecord {
                usage_count: 1,
                canonical_path: record.file_path.clone(),
            },
        };

        record.state = FileState::Bagged;
        record.contract_address = Some(contract_address(&bag, &record.owner_address));
        record.bag = Some(bag);

        let expiry = now + ChronoDuration::from_std(self.config.unpaid_grace).unwrap_or_default();
        let mut batch = Batch::default();
        batch.insert(file_key(key).as_bytes(), serde_json::to_vec(&record)?);
        batch.insert(ref_key.as_bytes(), serde_json::to_vec(&bag_ref)?);
        TaskQueues::stage_cleanup(&mut batch, &CleanupTask::scheduled(key.to_string(), expiry))?;
        TaskQueues::stage_update(&mut batch, now.timestamp(), key);
        TaskQueues::remove_store(&mut batch, key);
        self.repo.store().apply(batch)?;

        tracing::info!(key = %key, id = %id, usage = bag_ref.usage_count, "file packaged into bag");

        // The duplicate upload is no longer referenced by anything. Losing
        // the removal leaves an orphan file, nothing more.
        if let Some(path) = duplicate_path
            && let Err(err) = tokio::fs::remove_file(&path).await
        {
            tracing::warn!(path = %path.display(), error = %err, "failed to remove duplicate upload");
        }
        Ok(())
    }

    // Cleanup pass: one batch per task.

    async fn cleanup_pass(&self, now: DateTime<Utc>) -> Result<(), WorkerError> {
        for task in self.queues.pending_cleanup(now)? {
            if let Err(err) = self.cleanup_one(&task).await {
                tracing::warn!(key = %task.key, error = %err, "cleanup task failed, will retry");
            }
        }
        Ok(())
    }

    /// Removes one record, its share of the bag, and its physical file.
    /// A scheduled (non-forced) task is honored only while the record is
    /// still unpaid.
    async fn cleanup_one(&self, task: &CleanupTask) -> Result<(), WorkerError> {
        let mut batch = Batch::default();
        TaskQueues::remove_cleanup(&mut batch, &task.key);

        let Some(record) = self.repo.get_by_key(&task.key)? else {
            self.repo.store().apply(batch)?;
            return Ok(());
        };

        if !task.force && record.state >= FileState::Stored {
            // Paid in time; the expiry sweep no longer applies.
            self.repo.store().apply(batch)?;
            return Ok(());
        }

        batch.remove(file_key(&task.key).as_bytes());
        TaskQueues::remove_store(&mut batch, &task.key);

        // Drop this record's reference to the bag. The physical bag and
        // the canonical file go only when the last reference does.
        let mut remove_bag = None;
        if let Some(bag) = &record.bag {
            let ref_key = bag_ref_key(bag.root_hash);
            if let Some(raw) = self.repo.store().get(&ref_key)? {
                let mut bag_ref: BagRefRecord = serde_json::from_slice(&raw)?;
                bag_ref.usage_count = bag_ref.usage_count.saturating_sub(1);
                if bag_ref.usage_count == 0 {
                    batch.remove(ref_key.as_bytes());
                    remove_bag = Some((bag.root_hash, bag_ref.canonical_path));
                } else {
                    batch.insert(ref_key.as_bytes(), serde_json::to_vec(&bag_ref)?);
                }
            }
        }
        self.repo.store().apply(batch)?;

        tracing::info!(key = %task.key, forced = task.force, "file record removed");

        match (&record.bag, remove_bag) {
            (Some(_), Some((id, canonical_path))) => {
                if let Err(err) = self.daemon.remove_bag(id, true).await {
                    tracing::warn!(id = %id, error = %err, "failed to remove bag from daemon");
                }
                let path = self.upload_root.join(canonical_path);
                if let Err(err) = tokio::fs::remove_file(&path).await {
                    tracing::warn!(path = %path.display(), error = %err, "failed to remove stored file");
                }
            }
            (Some(_), None) => {} // other records still reference the bag
            (None, _) => {
                // Never packaged; only the raw upload exists.
                let path = self.upload_path(&record);
                if let Err(err) = tokio::fs::remove_file(&path).await {
                    tracing::warn!(path = %path.display(), error = %err, "failed to remove upload");
                }
            }
        }
        Ok(())
    }

    // Update pass: outcomes for all due tasks are committed as one batch,
    // so a reschedule is never persisted without its record update.

    async fn update_pass(&self, now: DateTime<Utc>) -> Result<(), WorkerError> {
        let due = self.queues.pending_update(now)?;
        if due.is_empty() {
            return Ok(());
        }

        let head = match self.chain.current_head().await {
            Ok(head) => head,
            Err(err) => {
                // Every due task stays queued and retries next tick.
                tracing::warn!(error = %err, "chain head unavailable, deferring update pass");
                return Ok(());
            }
        };

        let mut outcomes = Vec::with_capacity(due.len());
        for task in due {
            // A failure on one record (including a corrupt persisted value)
            // must not stall the pass for the others.
            let outcome = match self.update_one(task.clone(), &head, now).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    tracing::warn!(key = %task.key, error = %err, "update task failed, will retry");
                    let next_at = self.retry_at(&task, now);
                    UpdateOutcome {
                        task,
                        next_at,
                        record: None,
                        forced_cleanup: false,
                    }
                }
            };
            outcomes.push(outcome);
        }

        let mut batch = Batch::default();
        for outcome in &outcomes {
            TaskQueues::remove_update(&mut batch, &outcome.task);
            if let Some(next_at) = outcome.next_at {
                TaskQueues::stage_update(&mut batch, next_at, &outcome.task.key);
            }
            if let Some(record) = &outcome.record {
                batch.insert(
                    file_key(&outcome.task.key).as_bytes(),
                    serde_json::to_vec(record)?,
                );
            }
            if outcome.forced_cleanup {
                TaskQueues::stage_cleanup(
                    &mut batch,
                    &CleanupTask::forced(outcome.task.key.clone(), now),
                )?;
            }
        }
        self.repo.store().apply(batch)?;
        Ok(())
    }

    /// Next due time after a failed or inconclusive poll. Immediate tasks
    /// never reschedule; periodic ones come back at the short retry.
    fn retry_at(&self, task: &UpdateTask, now: DateTime<Utc>) -> Option<i64> {
        if task.is_immediate() {
            None
        } else {
            Some(
                (now + ChronoDuration::from_std(self.config.retry_interval).unwrap_or_default())
                    .timestamp(),
            )
        }
    }

    /// Polls one record's contract and provider status.
    async fn update_one(
        &self,
        task: UpdateTask,
        head: &crate::chain::BlockRef,
        now: DateTime<Utc>,
    ) -> Result<UpdateOutcome, WorkerError> {
        let drop_task = |task| UpdateOutcome {
            task,
            next_at: None,
            record: None,
            forced_cleanup: false,
        };
        let retry_at = self.retry_at(&task, now);

        let Some(mut record) = self.repo.get_by_key(&task.key)? else {
            return Ok(drop_task(task));
        };
        let (Some(bag), Some(address)) = (record.bag.clone(), record.contract_address.clone())
        else {
            // Not packaged yet; the store pass will enqueue a fresh task.
            return Ok(drop_task(task));
        };

        // The bag must still exist on the daemon; if it vanished there is
        // nothing left to monitor.
        match self.daemon.bag_details(bag.root_hash).await {
            Ok(_) => {}
            Err(DaemonError::NotFound) => {
                tracing::warn!(key = %task.key, id = %bag.root_hash, "bag vanished from daemon");
                return Ok(UpdateOutcome {
                    task,
                    next_at: None,
                    record: None,
                    forced_cleanup: true,
                });
            }
            Err(err) => {
                tracing::warn!(key = %task.key, error = %err, "daemon unreachable, retrying");
                return Ok(UpdateOutcome {
                    task,
                    next_at: retry_at,
                    record: None,
                    forced_cleanup: false,
                });
            }
        }

        let data = match self
            .chain
            .read_provider_contract(head, &address, &self.provider_key)
            .await
        {
            Ok(data) => data,
            Err(err) if err.is_absence() => {
                if record.state >= FileState::Stored {
                    // The contract was live and is now gone: withdrawn or
                    // the provider was evicted.
                    tracing::warn!(key = %task.key, address = %address, "contract vanished from chain");
                    return Ok(UpdateOutcome {
                        task,
                        next_at: None,
                        record: None,
                        forced_cleanup: true,
                    });
                }
                // Not deployed yet; keep waiting for the owner to fund it.
                return Ok(UpdateOutcome {
                    task,
                    next_at: retry_at,
                    record: None,
                    forced_cleanup: false,
                });
            }
            Err(err) => {
                tracing::warn!(key = %task.key, error = %err, "contract read failed, retrying");
                return Ok(UpdateOutcome {
                    task,
                    next_at: retry_at,
                    record: None,
                    forced_cleanup: false,
                });
            }
        };

        let info = match self
            .daemon
            .storage_info(&self.provider_key, &address, data.byte_to_proof)
            .await
        {
            Ok(info) => info,
            Err(err) => {
                // A failed query is our problem, not the provider's. The
                // record keeps its last observed status until a real answer
                // arrives.
                tracing::warn!(key = %task.key, error = %err, "provider status unavailable, retrying");
                return Ok(UpdateOutcome {
                    task,
                    next_at: retry_at,
                    record: None,
                    forced_cleanup: false,
                });
            }
        };

        // Error tracking: transient provider hiccups neither start nor
        // clear the clock; a persistent error past the grace window means
        // the provider stopped proving and the slot is reclaimed.
        let previous_error_since = record.provider.as_ref().and_then(|p| p.error_since);
        let error_since = if info.is_transient_error() {
            previous_error_since
        } else if info.is_error() {
            let since = previous_error_since.unwrap_or(now);
            let grace = ChronoDuration::from_std(self.config.unpaid_grace).unwrap_or_default();
            if now - since > grace {
                tracing::warn!(key = %task.key, reason = %info.reason, "provider error persisted past grace");
                return Ok(UpdateOutcome {
                    task,
                    next_at: None,
                    record: None,
                    forced_cleanup: true,
                });
            }
            Some(since)
        } else {
            None
        };

        let per_day = price_per_day(&data.rate_per_mb_day, bag.full_size);
        let time_left = time_remaining(
            &data.balance,
            &data.rate_per_mb_day,
            bag.full_size,
            data.max_span,
            data.last_proof_at,
            now,
        );

        record.state = FileState::Stored;
        record.provider = Some(ProviderInfo {
            balance: format_nano(&data.balance),
            per_day: format_nano(&per_day),
            status: info.status,
            reason: info.reason,
            time_left: time_left.to_string(),
            last_updated: now,
            error_since,
        });

        let next_at = if task.is_immediate() {
            None
        } else {
            Some((now + ChronoDuration::from_std(self.config.poll_interval).unwrap_or_default()).timestamp())
        };
        Ok(UpdateOutcome {
            task,
            next_at,
            record: Some(record),
            forced_cleanup: false,
        })
    }
}

/// Handle to the running provisioner loop.
pub struct ProvisionerHandle {
    shutdown_tx: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

impl ProvisionerHandle {
    /// Signals shutdown and waits for the in-flight tick to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(err) = self.join.await {
            tracing::error!(error = %err, "provisioner task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use num_bigint::BigUint;
    use tempfile::TempDir;

    use super::test_mocks::{MockChainClient, MockStorageDaemon, test_details};
    use super::*;
    use crate::chain::ContractData;
    use crate::daemon::{BagId, REASON_INTERNAL, STATUS_ERROR, StorageInfo};
    use crate::store::{Store, cleanup_task_key, file_key, store_task_key};

    struct Fixture {
        provisioner: Provisioner,
        repo: Arc<FileRepository>,
        daemon: Arc<MockStorageDaemon>,
        chain: Arc<MockChainClient>,
        upload_root: TempDir,
    }

    fn fixture() -> Fixture {
        let upload_root = TempDir::new().unwrap();
        let repo = Arc::new(FileRepository::new(Arc::new(Store::temporary().unwrap())));
        let daemon = Arc::new(MockStorageDaemon::default());
        let chain = Arc::new(MockChainClient::default());
        let config = WorkerConfig {
            tick_interval: Duration::from_millis(10),
            unpaid_grace: Duration::from_secs(900),
            retry_interval: Duration::from_secs(15),
            poll_interval: Duration::from_secs(300),
            refresh_gap: Duration::from_secs(5),
        };
        let provisioner = Provisioner::new(
            Arc::clone(&repo),
            Arc::clone(&daemon) as Arc<dyn StorageDaemon>,
            Arc::clone(&chain) as Arc<dyn ChainClient>,
            config,
            upload_root.path().to_path_buf(),
            vec![0xaa; 32],
        );
        Fixture {
            provisioner,
            repo,
            daemon,
            chain,
            upload_root,
        }
    }

    fn upload(fx: &Fixture, owner: &str, name: &str, content: &[u8]) -> FileRecord {
        let record = fx.repo.create_record(owner, name).unwrap();
        let path = fx.upload_root.path().join(&record.file_path);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
        record
    }

    fn funded_contract(rate: u64, balance: u64, now: DateTime<Utc>) -> ContractData {
        ContractData {
            rate_per_mb_day: BigUint::from(rate),
            byte_to_proof: 0,
            max_span: 86_400,
            last_proof_at: now,
            balance: BigUint::from(balance),
        }
    }

    #[tokio::test]
    async fn upload_becomes_bagged_with_expiry_and_poll() {
        let fx = fixture();
        let now = Utc::now();
        upload(&fx, "EQo", "a.pdf", b"payload");
        fx.daemon.queue_bag(BagId::new([1; 32]), test_details(100));

        fx.provisioner.store_pass(now).await.unwrap();

        let record = fx.repo.get("EQo", "a.pdf").unwrap().unwrap();
        assert_eq!(record.state, FileState::Bagged);
        let bag = record.bag.as_ref().unwrap();
        assert_eq!(bag.full_size, 100 + 24);
        assert!(record.contract_address.is_some());

        let store = fx.repo.store();
        assert!(!store.contains_key(&store_task_key("EQo:a.pdf")).unwrap());

        // Expiry sweep is scheduled at packaging time plus the grace.
        let queues = TaskQueues::new(Arc::clone(store));
        assert!(queues.pending_cleanup(now).unwrap().is_empty());
        let due = queues
            .pending_cleanup(now + ChronoDuration::seconds(901))
            .unwrap();
        assert_eq!(due.len(), 1);
        assert!(!due[0].force);

        // An update task is due right away.
        let due = queues.pending_update(now).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].key, "EQo:a.pdf");
    }

    #[tokio::test]
    async fn store_pass_replay_is_idempotent() {
        let fx = fixture();
        let now = Utc::now();
        upload(&fx, "EQo", "a.pdf", b"payload");
        fx.daemon.queue_bag(BagId::new([1; 32]), test_details(100));
        fx.provisioner.store_pass(now).await.unwrap();

        // Marker re-inserted by hand, as if a crash hit between the batch
        // and nothing in particular. The replay must not touch the record.
        fx.repo
            .store()
            .insert(&store_task_key("EQo:a.pdf"), b"")
            .unwrap();
        let before = fx.repo.get("EQo", "a.pdf").unwrap().unwrap();
        fx.provisioner.store_pass(now).await.unwrap();

        assert_eq!(fx.repo.get("EQo", "a.pdf").unwrap().unwrap(), before);
        assert!(
            !fx.repo
                .store()
                .contains_key(&store_task_key("EQo:a.pdf"))
                .unwrap()
        );
    }

    #[tokio::test]
    async fn duplicate_content_shares_bag_and_canonical_path() {
        let fx = fixture();
        let now = Utc::now();
        upload(&fx, "EQo", "a.pdf", b"same");
        let dup = upload(&fx, "EQo", "b.pdf", b"same");
        let id = BagId::new([2; 32]);
        fx.daemon.queue_bag(id, test_details(4));
        fx.daemon.queue_bag(id, test_details(4));

        fx.provisioner.store_pass(now).await.unwrap();

        let bag_ref: BagRefRecord = serde_json::from_slice(
            &fx.repo.store().get(&bag_ref_key(id)).unwrap().unwrap(),
        )
        .unwrap();
        assert_eq!(bag_ref.usage_count, 2);
        assert_eq!(bag_ref.canonical_path, "EQo/a.pdf");

        let second = fx.repo.get("EQo", "b.pdf").unwrap().unwrap();
        assert_eq!(second.file_path, "EQo/a.pdf");
        assert_eq!(second.name, "b.pdf");

        // The duplicate physical upload is gone; the canonical one stays.
        assert!(!fx.upload_root.path().join(&dup.file_path).exists());
        assert!(fx.upload_root.path().join("EQo/a.pdf").exists());
    }

    #[tokio::test]
    async fn grace_expiry_removes_unpaid_record_and_reference() {
        let fx = fixture();
        let now = Utc::now();
        upload(&fx, "EQo", "a.pdf", b"same");
        upload(&fx, "EQo", "b.pdf", b"same");
        let id = BagId::new([3; 32]);
        fx.daemon.queue_bag(id, test_details(4));
        fx.daemon.queue_bag(id, test_details(4));
        fx.provisioner.store_pass(now).await.unwrap();

        let after_grace = now + ChronoDuration::seconds(901);
        fx.provisioner.cleanup_pass(after_grace).await.unwrap();

        assert!(fx.repo.get("EQo", "a.pdf").unwrap().is_none());
        assert!(fx.repo.get("EQo", "b.pdf").unwrap().is_none());
        assert!(fx.repo.store().get(&bag_ref_key(id)).unwrap().is_none());
        // Last reference dropped: the bag is removed remotely, files too.
        assert_eq!(fx.daemon.removed(), vec![(id, true)]);
        assert!(!fx.upload_root.path().join("EQo/a.pdf").exists());
    }

    #[tokio::test]
    async fn expiry_decrements_shared_reference_but_keeps_live_copy() {
        let fx = fixture();
        let now = Utc::now();
        // Two owners upload identical content; the bag is shared but each
        // gets their own contract.
        upload(&fx, "EQa", "a.pdf", b"same");
        upload(&fx, "EQb", "b.pdf", b"same");
        let id = BagId::new([12; 32]);
        fx.daemon.queue_bag(id, test_details(4));
        fx.daemon.queue_bag(id, test_details(4));
        fx.provisioner.store_pass(now).await.unwrap();

        // Only the first owner funds in time.
        let address = fx
            .repo
            .get("EQa", "a.pdf")
            .unwrap()
            .unwrap()
            .contract_address
            .clone()
            .unwrap();
        fx.chain.deploy(&address, funded_contract(1_000_000, 5_000_000_000, now));
        fx.provisioner.update_pass(now).await.unwrap();

        fx.provisioner
            .cleanup_pass(now + ChronoDuration::seconds(901))
            .await
            .unwrap();

        // The unpaid copy is gone, the paid one keeps the bag alive.
        assert!(fx.repo.get("EQb", "b.pdf").unwrap().is_none());
        assert_eq!(
            fx.repo.get("EQa", "a.pdf").unwrap().unwrap().state,
            FileState::Stored
        );
        let bag_ref: BagRefRecord = serde_json::from_slice(
            &fx.repo.store().get(&bag_ref_key(id)).unwrap().unwrap(),
        )
        .unwrap();
        assert_eq!(bag_ref.usage_count, 1);
        assert!(fx.daemon.removed().is_empty());
        assert!(fx.upload_root.path().join("EQa/a.pdf").exists());
    }

    #[tokio::test]
    async fn scheduled_cleanup_spares_paid_record() {
        let fx = fixture();
        let now = Utc::now();
        upload(&fx, "EQo", "a.pdf", b"payload");
        fx.daemon.queue_bag(BagId::new([4; 32]), test_details(100));
        fx.provisioner.store_pass(now).await.unwrap();

        // Owner funds the contract before the sweep fires.
        let record = fx.repo.get("EQo", "a.pdf").unwrap().unwrap();
        let address = record.contract_address.clone().unwrap();
        fx.chain.deploy(&address, funded_contract(1_000_000, 5_000_000_000, now));
        fx.provisioner.update_pass(now).await.unwrap();
        assert_eq!(
            fx.repo.get("EQo", "a.pdf").unwrap().unwrap().state,
            FileState::Stored
        );

        fx.provisioner
            .cleanup_pass(now + ChronoDuration::seconds(901))
            .await
            .unwrap();

        let record = fx.repo.get("EQo", "a.pdf").unwrap().unwrap();
        assert_eq!(record.state, FileState::Stored);
        // The sweep marker is consumed either way.
        assert!(
            !fx.repo
                .store()
                .contains_key(&cleanup_task_key("EQo:a.pdf"))
                .unwrap()
        );
    }

    #[tokio::test]
    async fn undeployed_contract_keeps_polling() {
        let fx = fixture();
        let now = Utc::now();
        upload(&fx, "EQo", "a.pdf", b"payload");
        fx.daemon.queue_bag(BagId::new([5; 32]), test_details(100));
        fx.provisioner.store_pass(now).await.unwrap();

        fx.provisioner.update_pass(now).await.unwrap();

        let record = fx.repo.get("EQo", "a.pdf").unwrap().unwrap();
        assert_eq!(record.state, FileState::Bagged);
        assert!(record.provider.is_none());

        // Rescheduled at the short retry interval, not dropped.
        let queues = TaskQueues::new(Arc::clone(fx.repo.store()));
        assert!(queues.pending_update(now).unwrap().is_empty());
        let due = queues
            .pending_update(now + ChronoDuration::seconds(16))
            .unwrap();
        assert_eq!(due.len(), 1);
    }

    #[tokio::test]
    async fn funded_contract_promotes_to_stored() {
        let fx = fixture();
        let now = Utc::now();
        upload(&fx, "EQo", "a.pdf", b"payload");
        fx.daemon.queue_bag(BagId::new([6; 32]), test_details(100));
        fx.provisioner.store_pass(now).await.unwrap();

        let record = fx.repo.get("EQo", "a.pdf").unwrap().unwrap();
        let address = record.contract_address.clone().unwrap();
        fx.chain.deploy(&address, funded_contract(1_000_000, 5_000_000_000, now));

        fx.provisioner.update_pass(now).await.unwrap();

        let record = fx.repo.get("EQo", "a.pdf").unwrap().unwrap();
        assert_eq!(record.state, FileState::Stored);
        let provider = record.provider.unwrap();
        assert_eq!(provider.balance, "5");
        assert_eq!(provider.status, "active");
        assert!(provider.error_since.is_none());
        assert!(provider.time_left.contains("Days"));

        // Long poll interval from here on.
        let queues = TaskQueues::new(Arc::clone(fx.repo.store()));
        assert!(
            queues
                .pending_update(now + ChronoDuration::seconds(299))
                .unwrap()
                .is_empty()
        );
        assert_eq!(
            queues
                .pending_update(now + ChronoDuration::seconds(301))
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn vanished_contract_forces_cleanup_of_stored_record() {
        let fx = fixture();
        let now = Utc::now();
        upload(&fx, "EQo", "a.pdf", b"payload");
        let id = BagId::new([7; 32]);
        fx.daemon.queue_bag(id, test_details(100));
        fx.provisioner.store_pass(now).await.unwrap();

        let address = fx
            .repo
            .get("EQo", "a.pdf")
            .unwrap()
            .unwrap()
            .contract_address
            .clone()
            .unwrap();
        fx.chain.deploy(&address, funded_contract(1_000_000, 5_000_000_000, now));
        fx.provisioner.update_pass(now).await.unwrap();

        // Withdrawn: the contract disappears from the chain.
        fx.chain.undeploy(&address);
        let later = now + ChronoDuration::seconds(301);
        fx.provisioner.update_pass(later).await.unwrap();

        // The forced removal is already due on the tick that staged it.
        let queues = TaskQueues::new(Arc::clone(fx.repo.store()));
        let due = queues.pending_cleanup(later).unwrap();
        assert_eq!(due.len(), 1);
        assert!(due[0].force);

        fx.provisioner.cleanup_pass(later).await.unwrap();
        assert!(fx.repo.get("EQo", "a.pdf").unwrap().is_none());
        assert_eq!(fx.daemon.removed(), vec![(id, true)]);
    }

    #[tokio::test]
    async fn provider_error_tracked_then_reclaimed_past_grace() {
        let fx = fixture();
        let now = Utc::now();
        upload(&fx, "EQo", "a.pdf", b"payload");
        fx.daemon.queue_bag(BagId::new([8; 32]), test_details(100));
        fx.provisioner.store_pass(now).await.unwrap();

        let address = fx
            .repo
            .get("EQo", "a.pdf")
            .unwrap()
            .unwrap()
            .contract_address
            .clone()
            .unwrap();
        fx.chain.deploy(&address, funded_contract(1_000_000, 5_000_000_000, now));
        fx.daemon.set_info(StorageInfo {
            status: STATUS_ERROR.to_string(),
            reason: "bag check failed".to_string(),
        });

        fx.provisioner.update_pass(now).await.unwrap();
        let provider = fx
            .repo
            .get("EQo", "a.pdf")
            .unwrap()
            .unwrap()
            .provider
            .unwrap();
        assert_eq!(provider.error_since, Some(now));

        // Still inside the grace window: monitored, not removed.
        let later = now + ChronoDuration::seconds(400);
        fx.provisioner.update_pass(later).await.unwrap();
        assert!(fx.repo.get("EQo", "a.pdf").unwrap().is_some());

        // Past the window the slot is reclaimed.
        let past_grace = now + ChronoDuration::seconds(1_000);
        fx.provisioner.update_pass(past_grace).await.unwrap();
        let queues = TaskQueues::new(Arc::clone(fx.repo.store()));
        let due = queues.pending_cleanup(past_grace).unwrap();
        assert!(due.iter().any(|t| t.force && t.key == "EQo:a.pdf"));
    }

    #[tokio::test]
    async fn transient_provider_error_never_starts_the_clock() {
        let fx = fixture();
        let now = Utc::now();
        upload(&fx, "EQo", "a.pdf", b"payload");
        fx.daemon.queue_bag(BagId::new([9; 32]), test_details(100));
        fx.provisioner.store_pass(now).await.unwrap();

        let address = fx
            .repo
            .get("EQo", "a.pdf")
            .unwrap()
            .unwrap()
            .contract_address
            .clone()
            .unwrap();
        fx.chain.deploy(&address, funded_contract(1_000_000, 5_000_000_000, now));
        fx.daemon.set_info(StorageInfo {
            status: STATUS_ERROR.to_string(),
            reason: REASON_INTERNAL.to_string(),
        });

        fx.provisioner.update_pass(now).await.unwrap();
        let provider = fx
            .repo
            .get("EQo", "a.pdf")
            .unwrap()
            .unwrap()
            .provider
            .unwrap();
        assert!(provider.error_since.is_none());
        assert_eq!(provider.status, STATUS_ERROR);

        // Even far in the future a transient error never reclaims. The
        // scheduled expiry sweep from packaging is due by then, but no
        // forced removal is ever staged.
        fx.provisioner
            .update_pass(now + ChronoDuration::seconds(10_000))
            .await
            .unwrap();
        assert!(fx.repo.get("EQo", "a.pdf").unwrap().is_some());
        let queues = TaskQueues::new(Arc::clone(fx.repo.store()));
        assert!(
            queues
                .pending_cleanup(now + ChronoDuration::seconds(10_000))
                .unwrap()
                .iter()
                .all(|t| !t.force)
        );
    }

    #[tokio::test]
    async fn corrupt_record_does_not_stall_update_pass() {
        let fx = fixture();
        let now = Utc::now();
        upload(&fx, "EQo", "a.pdf", b"payload");
        fx.daemon.queue_bag(BagId::new([13; 32]), test_details(100));
        fx.provisioner.store_pass(now).await.unwrap();

        // A record whose persisted value no longer parses, with its poll
        // due ahead of the healthy one in key order.
        fx.repo
            .store()
            .insert(&file_key("EQa:bad.pdf"), b"not json")
            .unwrap();
        let mut batch = Batch::default();
        TaskQueues::stage_update(&mut batch, now.timestamp(), "EQa:bad.pdf");
        fx.repo.store().apply(batch).unwrap();

        let address = fx
            .repo
            .get("EQo", "a.pdf")
            .unwrap()
            .unwrap()
            .contract_address
            .clone()
            .unwrap();
        fx.chain.deploy(&address, funded_contract(1_000_000, 5_000_000_000, now));

        fx.provisioner.update_pass(now).await.unwrap();

        // The healthy record is promoted despite its broken neighbor.
        assert_eq!(
            fx.repo.get("EQo", "a.pdf").unwrap().unwrap().state,
            FileState::Stored
        );
        // The broken entry is skipped, never deleted, and retries later.
        assert!(fx.repo.store().contains_key(&file_key("EQa:bad.pdf")).unwrap());
        let queues = TaskQueues::new(Arc::clone(fx.repo.store()));
        assert!(queues.pending_update(now).unwrap().is_empty());
        let due = queues
            .pending_update(now + ChronoDuration::seconds(16))
            .unwrap();
        assert!(due.iter().any(|t| t.key == "EQa:bad.pdf"));

        // The next pass hits the same entry and still completes.
        fx.provisioner
            .update_pass(now + ChronoDuration::seconds(16))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn status_query_outage_leaves_record_untouched() {
        let fx = fixture();
        let now = Utc::now();
        upload(&fx, "EQo", "a.pdf", b"payload");
        fx.daemon.queue_bag(BagId::new([14; 32]), test_details(100));
        fx.provisioner.store_pass(now).await.unwrap();

        let address = fx
            .repo
            .get("EQo", "a.pdf")
            .unwrap()
            .unwrap()
            .contract_address
            .clone()
            .unwrap();
        fx.chain.deploy(&address, funded_contract(1_000_000, 5_000_000_000, now));
        fx.daemon.set_info_unavailable(true);

        fx.provisioner.update_pass(now).await.unwrap();

        // No fabricated provider status; the record waits for a real answer.
        let record = fx.repo.get("EQo", "a.pdf").unwrap().unwrap();
        assert_eq!(record.state, FileState::Bagged);
        assert!(record.provider.is_none());

        // Rescheduled at the short retry; the next good answer promotes it.
        let retry = now + ChronoDuration::seconds(16);
        let queues = TaskQueues::new(Arc::clone(fx.repo.store()));
        assert_eq!(queues.pending_update(retry).unwrap().len(), 1);

        fx.daemon.set_info_unavailable(false);
        fx.provisioner.update_pass(retry).await.unwrap();
        let record = fx.repo.get("EQo", "a.pdf").unwrap().unwrap();
        assert_eq!(record.state, FileState::Stored);
        assert_eq!(record.provider.unwrap().status, "active");
    }

    #[tokio::test]
    async fn vanished_bag_forces_cleanup() {
        let fx = fixture();
        let now = Utc::now();
        upload(&fx, "EQo", "a.pdf", b"payload");
        let id = BagId::new([10; 32]);
        fx.daemon.queue_bag(id, test_details(100));
        fx.provisioner.store_pass(now).await.unwrap();

        fx.daemon.forget_bag(id);
        fx.provisioner.update_pass(now).await.unwrap();

        let queues = TaskQueues::new(Arc::clone(fx.repo.store()));
        let due = queues.pending_cleanup(now).unwrap();
        assert!(due.iter().any(|t| t.force));
    }

    #[tokio::test]
    async fn immediate_refresh_task_never_reschedules() {
        let fx = fixture();
        let now = Utc::now();
        upload(&fx, "EQo", "a.pdf", b"payload");
        fx.daemon.queue_bag(BagId::new([11; 32]), test_details(100));
        fx.provisioner.store_pass(now).await.unwrap();
        // Consume the periodic task first.
        fx.provisioner.update_pass(now).await.unwrap();

        fx.repo
            .refresh_if_stale("EQo", &["EQo:a.pdf".to_string()], Duration::from_secs(5))
            .unwrap();
        fx.provisioner.update_pass(now).await.unwrap();

        // Only the previously rescheduled periodic task survives.
        let queues = TaskQueues::new(Arc::clone(fx.repo.store()));
        let far = now + ChronoDuration::days(1);
        assert_eq!(queues.pending_update(far).unwrap().len(), 1);
    }
}
