//! Upload-facing service facade.
//!
//! What the HTTP layer calls: accept an upload, list an owner's files,
//! request deletion, and produce the wallet payloads for deploying,
//! topping up, and withdrawing a storage contract. All state lives in the
//! repository; this layer adds validation, the pending cap, and
//! presentation.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::config::{UploadConfig, WorkerConfig};
use crate::contract::{self, DeployQuote, TopupTarget, WithdrawRequest};
use crate::daemon::{DaemonError, STATUS_ERROR, StorageDaemon};
use crate::pricing::{best_offer, format_size};
use crate::records::{FileRecord, FileRepository, FileState, RecordError};

/// Longest accepted file name, in bytes.
const MAX_NAME_LEN: usize = 255;

/// Errors surfaced to the upload API.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid file name: {reason}")]
    InvalidName { reason: String },

    #[error("too many pending files, pay for or remove one of the {cap} first")]
    PendingLimit { cap: usize },

    #[error("no such file")]
    NotFound,

    #[error("file is not ready for this operation yet")]
    NotReady,

    #[error("provider cannot store this file right now")]
    NoOffer,

    #[error("record error")]
    Record(#[from] RecordError),

    #[error("storage daemon error")]
    Daemon(#[from] DaemonError),

    #[error("upload I/O error")]
    Io(#[from] std::io::Error),
}

/// One row of an owner's file listing.
#[derive(Debug, Clone, Serialize)]
pub struct UserFileView {
    pub name: String,
    /// `processing`, `awaiting deployment`, or the provider status.
    pub status: String,
    pub size: String,
    pub bag_id: Option<String>,
    pub contract_address: Option<String>,
    pub balance: Option<String>,
    pub price_per_day: Option<String>,
    pub time_left: Option<String>,
    pub reason: Option<String>,
}

pub struct FileService {
    repo: Arc<FileRepository>,
    daemon: Arc<dyn StorageDaemon>,
    upload: UploadConfig,
    worker: WorkerConfig,
    provider_key: Vec<u8>,
}

impl FileService {
    pub fn new(
        repo: Arc<FileRepository>,
        daemon: Arc<dyn StorageDaemon>,
        upload: UploadConfig,
        worker: WorkerConfig,
        provider_key: Vec<u8>,
    ) -> Self {
        Self {
            repo,
            daemon,
            upload,
            worker,
            provider_key,
        }
    }

    /// Accepts an upload: validates the name, enforces the pending cap,
    /// writes the bytes under the owner's directory, and creates the
    /// record with its packaging task.
    pub async fn store_file(
        &self,
        owner: &str,
        name: &str,
        content: &[u8],
    ) -> Result<FileRecord, ServiceError> {
        let name = sanitize_name(name)?;

        if self.repo.get(owner, name)?.is_some() {
            return Err(RecordError::AlreadyExists {
                owner: owner.to_string(),
                name: name.to_string(),
            }
            .into());
        }

        let pending = self
            .repo
            .list_for_owner(owner)?
            .iter()
            .filter(|r| is_pending(r))
            .count();
        if pending >= self.upload.pending_cap {
            return Err(ServiceError::PendingLimit {
                cap: self.upload.pending_cap,
            });
        }

        let dir = self.upload.root_dir.join(owner);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(name), content).await?;

        let record = self.repo.create_record(owner, name)?;
        tracing::info!(owner, name, size = content.len(), "file accepted");
        Ok(record)
    }

    /// Lists an owner's files, newest first, and nudges the worker to
    /// refresh their contract status.
    pub fn list_files(&self, owner: &str) -> Result<Vec<UserFileView>, ServiceError> {
        let now = Utc::now();
        let grace = ChronoDuration::from_std(self.worker.unpaid_grace).unwrap_or_default();

        let mut records: Vec<FileRecord> = self
            .repo
            .list_for_owner(owner)?
            .into_iter()
            // An unpaid record past its grace window is already condemned;
            // showing it would only flash a row that is about to vanish.
            .filter(|r| {
                r.state >= FileState::Stored
                    || r.bag
                        .as_ref()
                        .is_none_or(|bag| bag.created_at + grace > now)
            })
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let keys: Vec<String> = records.iter().map(FileRecord::key).collect();
        if let Err(err) = self
            .repo
            .refresh_if_stale(owner, &keys, self.worker.refresh_gap)
        {
            tracing::warn!(owner, error = %err, "status refresh not scheduled");
        }

        Ok(records.iter().map(render_view).collect())
    }

    /// Requests removal of an unpaid file. The worker performs the actual
    /// deletion.
    pub fn remove_file(&self, owner: &str, name: &str) -> Result<(), ServiceError> {
        self.repo.request_deletion(owner, name)?;
        Ok(())
    }

    /// Quote for deploying the storage contract of a packaged file.
    pub async fn deploy_quote(&self, owner: &str, name: &str) -> Result<DeployQuote, ServiceError> {
        let record = self.repo.get(owner, name)?.ok_or(ServiceError::NotFound)?;
        if record.state != FileState::Bagged {
            return Err(ServiceError::NotReady);
        }
        let (Some(bag), Some(address)) = (record.bag, record.contract_address) else {
            return Err(ServiceError::NotReady);
        };

        let rates = self
            .daemon
            .storage_rates(&self.provider_key, bag.full_size)
            .await?;
        let offer = best_offer(&rates, bag.full_size).ok_or(ServiceError::NoOffer)?;
        Ok(contract::deploy_quote(address, &offer))
    }

    /// Withdrawal payload for a stored file's contract.
    pub fn withdraw_request(&self, owner: &str, name: &str) -> Result<WithdrawRequest, ServiceError> {
        let record = self.stored_record(owner, name)?;
        let address = record.contract_address.ok_or(ServiceError::NotReady)?;
        Ok(contract::withdraw_request(address))
    }

    /// Top-up target for a stored file's contract.
    pub fn topup_target(&self, owner: &str, name: &str) -> Result<TopupTarget, ServiceError> {
        let record = self.stored_record(owner, name)?;
        let address = record.contract_address.clone().ok_or(ServiceError::NotReady)?;
        let per_day = record
            .provider
            .map(|p| p.per_day)
            .unwrap_or_default();
        Ok(contract::topup_target(address, &per_day))
    }

    fn stored_record(&self, owner: &str, name: &str) -> Result<FileRecord, ServiceError> {
        let record = self.repo.get(owner, name)?.ok_or(ServiceError::NotFound)?;
        if record.state != FileState::Stored {
            return Err(ServiceError::NotReady);
        }
        Ok(record)
    }

    /// Physical path of a record's content, for serving downloads.
    pub fn content_path(&self, record: &FileRecord) -> PathBuf {
        self.upload.root_dir.join(&record.file_path)
    }
}

/// Unpaid or provider-errored records count against the pending cap.
fn is_pending(record: &FileRecord) -> bool {
    record.state < FileState::Stored
        || record
            .provider
            .as_ref()
            .is_some_and(|p| p.status == STATUS_ERROR)
}

/// Accepts only a plain leaf name: no separators, no traversal, printable,
/// bounded length.
fn sanitize_name(name: &str) -> Result<&str, ServiceError> {
    let invalid = |reason: &str| ServiceError::InvalidName {
        reason: reason.to_string(),
    };
    if name.is_empty() {
        return Err(invalid("empty name"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(invalid("name too long"));
    }
    if name.contains(['/', '\\']) || name.contains('\0') {
        return Err(invalid("path separators are not allowed"));
    }
    if name == "." || name == ".." {
        return Err(invalid("traversal names are not allowed"));
    }
    if name.chars().any(char::is_control) {
        return Err(invalid("control characters are not allowed"));
    }
    Ok(name)
}

fn render_view(record: &FileRecord) -> UserFileView {
    let status = match (record.state, &record.provider) {
        (FileState::New, _) => "processing".to_string(),
        (FileState::Bagged, _) => "awaiting deployment".to_string(),
        (FileState::Stored, Some(provider)) => provider.status.clone(),
        (FileState::Stored, None) => "stored".to_string(),
    };
    UserFileView {
        name: record.name.clone(),
        status,
        size: record
            .bag
            .as_ref()
            .map(|bag| format_size(bag.full_size))
            .unwrap_or_default(),
        bag_id: record.bag.as_ref().map(|bag| bag.root_hash.to_string()),
        contract_address: record.contract_address.clone(),
        balance: record.provider.as_ref().map(|p| p.balance.clone()),
        price_per_day: record.provider.as_ref().map(|p| p.per_day.clone()),
        time_left: record.provider.as_ref().map(|p| p.time_left.clone()),
        reason: record
            .provider
            .as_ref()
            .filter(|p| !p.reason.is_empty())
            .map(|p| p.reason.clone()),
    }
}
