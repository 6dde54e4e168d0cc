//! Blockchain client seam.
//!
//! The orchestrator only ever reads from the chain: the current head and
//! the per-provider state of a storage contract. Absence comes back as the
//! distinguished `NotDeployed` / `ProviderNotFound` conditions so the
//! update pass can tell "not funded yet" from "contract vanished".

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use num_bigint::BigUint;
use serde::Deserialize;
use thiserror::Error;

/// Reference to a chain head block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRef {
    pub seqno: u64,
}

/// Provider-facing state of one storage contract.
#[derive(Debug, Clone)]
pub struct ContractData {
    /// Agreed price in nano-coins per megabyte per day.
    pub rate_per_mb_day: BigUint,
    /// Byte offset the provider must prove next.
    pub byte_to_proof: u64,
    /// Proving interval in seconds.
    pub max_span: u32,
    pub last_proof_at: DateTime<Utc>,
    /// Remaining contract balance in nano-coins.
    pub balance: BigUint,
}

/// Errors raised by the chain client.
#[derive(Debug, Error)]
pub enum ChainError {
    /// The contract address holds no deployed code.
    #[error("contract is not deployed")]
    NotDeployed,

    /// The contract exists but does not list this provider.
    #[error("provider not found in contract")]
    ProviderNotFound,

    #[error("chain transport error: {reason}")]
    Transport { reason: String },

    #[error("HTTP error")]
    Http(#[from] reqwest::Error),
}

impl ChainError {
    /// Whether the error is a distinguished absence rather than a
    /// transport failure.
    pub fn is_absence(&self) -> bool {
        matches!(self, ChainError::NotDeployed | ChainError::ProviderNotFound)
    }
}

/// Seam between the orchestrator and the chain node.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Latest observed chain head.
    async fn current_head(&self) -> Result<BlockRef, ChainError>;

    /// Reads the provider's slice of a storage contract as of `head`.
    ///
    /// # Errors
    /// - `ChainError::NotDeployed` - Nothing is deployed at the address.
    /// - `ChainError::ProviderNotFound` - The contract does not pay this
    ///   provider.
    async fn read_provider_contract(
        &self,
        head: &BlockRef,
        contract_address: &str,
        provider_key: &[u8],
    ) -> Result<ContractData, ChainError>;
}

/// Thin adapter over a chain node's HTTP API.
pub struct HttpChainClient {
    base: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct HeadResponse {
    seqno: u64,
}

#[derive(Deserialize)]
struct ContractResponse {
    status: String,
    #[serde(default)]
    rate_per_mb_day: String,
    #[serde(default)]
    byte_to_proof: u64,
    #[serde(default)]
    max_span: u32,
    #[serde(default)]
    last_proof_at: i64,
    #[serde(default)]
    balance: String,
}

impl HttpChainClient {
    pub fn new(base: impl Into<String>, call_timeout: Duration) -> Result<Self, ChainError> {
        let client = reqwest::Client::builder().timeout(call_timeout).build()?;
        Ok(Self {
            base: base.into(),
            client,
        })
    }

    fn parse_nano(raw: &str, field: &str) -> Result<BigUint, ChainError> {
        BigUint::from_str(raw).map_err(|_| ChainError::Transport {
            reason: format!("unparseable {field}: {raw}"),
        })
    }
}

#[async_trait]
impl ChainClient for HttpChainClient {
    async fn current_head(&self) -> Result<BlockRef, ChainError> {
        let head: HeadResponse = self
            .client
            .get(format!("{}/api/v1/head", self.base))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(BlockRef { seqno: head.seqno })
    }

    async fn read_provider_contract(
        &self,
        head: &BlockRef,
        contract_address: &str,
        provider_key: &[u8],
    ) -> Result<ContractData, ChainError> {
        let response: ContractResponse = self
            .client
            .get(format!(
                "{}/api/v1/contract/provider?address={contract_address}&provider={}&seqno={}",
                self.base,
                hex::encode(provider_key),
                head.seqno
            ))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        match response.status.as_str() {
            "ok" => Ok(ContractData {
                rate_per_mb_day: Self::parse_nano(&response.rate_per_mb_day, "rate_per_mb_day")?,
                byte_to_proof: response.byte_to_proof,
                max_span: response.max_span,
                last_proof_at: DateTime::from_timestamp(response.last_proof_at, 0)
                    .unwrap_or_else(Utc::now),
                balance: Self::parse_nano(&response.balance, "balance")?,
            }),
            "not_deployed" => Err(ChainError::NotDeployed),
            "provider_not_found" => Err(ChainError::ProviderNotFound),
            other => Err(ChainError::Transport {
                reason: format!("unknown contract status: {other}"),
            }),
        }
    }
}
