//! Bagvault core: storage-provisioning orchestration.
//!
//! Wallet-owned uploads are packaged into content-addressed bags by an
//! external storage daemon, funded through per-bag provider contracts on
//! chain, and monitored by a persistent task-queue worker until they are
//! paid for or reclaimed. The crate is organized around seams:
//!
//! - [`store`] - embedded key-value persistence, atomic batches
//! - [`records`] / [`tasks`] - file records, bag references, task queues
//! - [`daemon`] / [`chain`] - clients for the two external systems
//! - [`pricing`] / [`contract`] - pure money math and payload derivation
//! - [`worker`] - the periodic provisioning state machine
//! - [`service`] - the upload-facing facade

pub mod chain;
pub mod config;
pub mod contract;
pub mod daemon;
pub mod pricing;
pub mod records;
pub mod service;
pub mod store;
pub mod tasks;
pub mod tracing_setup;
pub mod worker;

pub use chain::{ChainClient, ChainError, HttpChainClient};
pub use config::BagvaultConfig;
pub use daemon::{BagId, DaemonError, HttpStorageDaemon, StorageDaemon};
pub use records::{FileRecord, FileRepository, FileState, RecordError};
pub use service::{FileService, ServiceError};
pub use store::{Store, StoreError};
pub use worker::{Provisioner, ProvisionerHandle, WorkerError};

/// Umbrella error for callers that cross module seams.
#[derive(Debug, thiserror::Error)]
pub enum BagvaultError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error(transparent)]
    Daemon(#[from] DaemonError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Worker(#[from] WorkerError),
}

pub type Result<T> = std::result::Result<T, BagvaultError>;
