//! Hand-rolled mocks for the external seams, test-only.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use num_bigint::BigUint;
use parking_lot::Mutex;

use crate::chain::{BlockRef, ChainClient, ChainError, ContractData};
use crate::daemon::{BagDetails, BagId, DaemonError, StorageDaemon, StorageInfo};
use crate::pricing::ProviderRates;

/// Bag details with the given payload size and a fixed 24-byte header.
pub fn test_details(size: u64) -> BagDetails {
    BagDetails {
        size,
        header_size: 24,
        piece_size: 128 * 1024,
        merkle_hash: vec![0xee; 32],
    }
}

/// In-memory daemon: bags are queued per create call and kept in a
/// registry until forgotten.
pub struct MockStorageDaemon {
    next_bags: Mutex<VecDeque<(BagId, BagDetails)>>,
    registry: Mutex<HashMap<BagId, BagDetails>>,
    created_paths: Mutex<Vec<PathBuf>>,
    removed: Mutex<Vec<(BagId, bool)>>,
    rates: Mutex<ProviderRates>,
    info: Mutex<StorageInfo>,
    info_unavailable: Mutex<bool>,
}

impl Default for MockStorageDaemon {
    fn default() -> Self {
        Self {
            next_bags: Mutex::new(VecDeque::new()),
            registry: Mutex::new(HashMap::new()),
            created_paths: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            rates: Mutex::new(ProviderRates {
                available: true,
                rate_per_mb_day: BigUint::from(1_000_000u64),
                min_bounty: BigUint::from(100_000u64),
                space_available_mb: 1 << 20,
                min_span: 3_600,
                max_span: 7 * 86_400,
            }),
            info: Mutex::new(StorageInfo {
                status: "active".to_string(),
                reason: String::new(),
            }),
            info_unavailable: Mutex::new(false),
        }
    }
}

impl MockStorageDaemon {
    /// Queues the result of the next `create_bag` call.
    pub fn queue_bag(&self, id: BagId, details: BagDetails) {
        self.next_bags.lock().push_back((id, details));
    }

    /// Makes `bag_details` report the bag as gone.
    pub fn forget_bag(&self, id: BagId) {
        self.registry.lock().remove(&id);
    }

    pub fn set_info(&self, info: StorageInfo) {
        *self.info.lock() = info;
    }

    /// Makes `storage_info` fail until called again with `false`.
    pub fn set_info_unavailable(&self, unavailable: bool) {
        *self.info_unavailable.lock() = unavailable;
    }

    pub fn set_rates(&self, rates: ProviderRates) {
        *self.rates.lock() = rates;
    }

    pub fn removed(&self) -> Vec<(BagId, bool)> {
        self.removed.lock().clone()
    }

    pub fn created_paths(&self) -> Vec<PathBuf> {
        self.created_paths.lock().clone()
    }
}

#[async_trait]
impl StorageDaemon for MockStorageDaemon {
    async fn create_bag(
        &self,
        path: &Path,
        _description: &str,
        _keep_only: &[String],
    ) -> Result<BagId, DaemonError> {
        let (id, details) = self.next_bags.lock().pop_front().ok_or_else(|| {
            DaemonError::Rejected {
                status: 500,
                message: "no bag queued".to_string(),
            }
        })?;
        self.registry.lock().insert(id, details);
        self.created_paths.lock().push(path.to_path_buf());
        Ok(id)
    }

    async fn bag_details(&self, id: BagId) -> Result<BagDetails, DaemonError> {
        self.registry
            .lock()
            .get(&id)
            .cloned()
            .ok_or(DaemonError::NotFound)
    }

    async fn remove_bag(&self, id: BagId, with_files: bool) -> Result<(), DaemonError> {
        self.registry.lock().remove(&id);
        self.removed.lock().push((id, with_files));
        Ok(())
    }

    async fn storage_rates(
        &self,
        _provider_key: &[u8],
        _size: u64,
    ) -> Result<ProviderRates, DaemonError> {
        Ok(self.rates.lock().clone())
    }

    async fn storage_info(
        &self,
        _provider_key: &[u8],
        _contract_address: &str,
        _byte_to_proof: u64,
    ) -> Result<StorageInfo, DaemonError> {
        if *self.info_unavailable.lock() {
            return Err(DaemonError::Rejected {
                status: 502,
                message: "provider unreachable".to_string(),
            });
        }
        Ok(self.info.lock().clone())
    }
}

/// In-memory chain: contracts exist once deployed, vanish when undeployed.
#[derive(Default)]
pub struct MockChainClient {
    contracts: Mutex<HashMap<String, ContractData>>,
}

impl MockChainClient {
    pub fn deploy(&self, address: &str, data: ContractData) {
        self.contracts.lock().insert(address.to_string(), data);
    }

    pub fn undeploy(&self, address: &str) {
        self.contracts.lock().remove(address);
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn current_head(&self) -> Result<BlockRef, ChainError> {
        Ok(BlockRef { seqno: 1 })
    }

    async fn read_provider_contract(
        &self,
        _head: &BlockRef,
        contract_address: &str,
        _provider_key: &[u8],
    ) -> Result<ContractData, ChainError> {
        self.contracts
            .lock()
            .get(contract_address)
            .cloned()
            .ok_or(ChainError::NotDeployed)
    }
}
