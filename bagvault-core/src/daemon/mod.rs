//! Storage daemon client.
//!
//! The daemon turns an uploaded path into a content-addressed bag and
//! answers bag, rate, and proof-status queries. Everything behind this
//! seam is network I/O against an external process, so the trait is kept
//! narrow and every production call carries the configured timeout.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pricing::ProviderRates;

/// Length of a bag root hash in bytes.
pub const BAG_ID_LEN: usize = 32;

/// Provider proof status reported for a stored bag.
pub const STATUS_ERROR: &str = "error";
/// The one error reason treated as transient: it never starts the
/// error-since clock and never triggers cleanup.
pub const REASON_INTERNAL: &str = "internal provider error";

/// Content-addressed bag identifier (the bag's root hash).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BagId([u8; BAG_ID_LEN]);

impl BagId {
    pub fn new(bytes: [u8; BAG_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; BAG_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for BagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for BagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BagId({})", hex::encode(self.0))
    }
}

impl FromStr for BagId {
    type Err = DaemonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s).map_err(|_| DaemonError::InvalidBagId {
            value: s.to_string(),
        })?;
        let bytes: [u8; BAG_ID_LEN] =
            raw.try_into().map_err(|_| DaemonError::InvalidBagId {
                value: s.to_string(),
            })?;
        Ok(Self(bytes))
    }
}

impl Serialize for BagId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for BagId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Bag metadata as reported by the daemon.
#[derive(Debug, Clone)]
pub struct BagDetails {
    /// Payload size in bytes, excluding the header.
    pub size: u64,
    /// Bag header size in bytes.
    pub header_size: u64,
    /// Piece size used for merkle proofs.
    pub piece_size: u32,
    /// Merkle root over the piece hashes.
    pub merkle_hash: Vec<u8>,
}

/// Live proof status for a stored bag, as the provider reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageInfo {
    pub status: String,
    pub reason: String,
}

impl StorageInfo {
    pub fn is_error(&self) -> bool {
        self.status == STATUS_ERROR
    }

    /// Transient provider-side failures are exempt from error tracking.
    pub fn is_transient_error(&self) -> bool {
        self.is_error() && self.reason == REASON_INTERNAL
    }
}

/// Errors raised by the daemon client.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Distinguished absence: the bag no longer exists on the daemon.
    #[error("bag not found")]
    NotFound,

    #[error("invalid bag id: {value}")]
    InvalidBagId { value: String },

    #[error("daemon rejected request: status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("unexpected daemon response: {reason}")]
    InvalidResponse { reason: String },

    #[error("HTTP error")]
    Http(#[from] reqwest::Error),
}

/// Seam between the orchestrator and the storage daemon process.
///
/// Rate and proof-status queries ride the same seam: they are answered by
/// the provider-facing side of the daemon deployment, which is outside
/// this system's boundary.
#[async_trait]
pub trait StorageDaemon: Send + Sync {
    /// Packages the file or directory at `path` into a bag.
    async fn create_bag(
        &self,
        path: &Path,
        description: &str,
        keep_only: &[String],
    ) -> Result<BagId, DaemonError>;

    /// Fetches bag metadata.
    ///
    /// # Errors
    /// - `DaemonError::NotFound` - The bag no longer exists remotely.
    async fn bag_details(&self, id: BagId) -> Result<BagDetails, DaemonError>;

    /// Removes a bag, optionally together with its files on disk.
    async fn remove_bag(&self, id: BagId, with_files: bool) -> Result<(), DaemonError>;

    /// Published rate tiers for storing `size` bytes with the provider.
    async fn storage_rates(
        &self,
        provider_key: &[u8],
        size: u64,
    ) -> Result<ProviderRates, DaemonError>;

    /// Live proof status for a stored bag under the given contract.
    async fn storage_info(
        &self,
        provider_key: &[u8],
        contract_address: &str,
        byte_to_proof: u64,
    ) -> Result<StorageInfo, DaemonError>;
}

/// Basic-auth credentials for the daemon API.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub login: String,
    pub password: String,
}

/// Production daemon client over the daemon's HTTP API.
pub struct HttpStorageDaemon {
    base: String,
    client: reqwest::Client,
    credentials: Option<Credentials>,
}

#[derive(Serialize)]
struct CreateBagRequest<'a> {
    path: &'a str,
    description: &'a str,
    keep_only_paths: &'a [String],
}

#[derive(Deserialize)]
struct CreateBagResponse {
    bag_id: String,
}

#[derive(Deserialize)]
struct DetailsResponse {
    size: u64,
    header_size: u64,
    piece_size: u32,
    merkle_hash: String,
}

#[derive(Serialize)]
struct RemoveBagRequest {
    bag_id: String,
    with_files: bool,
}

#[derive(Deserialize)]
struct AckResponse {
    ok: bool,
    #[serde(default)]
    error: String,
}

#[derive(Serialize)]
struct RatesRequest<'a> {
    provider_key: &'a str,
    size: u64,
}

#[derive(Deserialize)]
struct RatesResponse {
    available: bool,
    rate_per_mb_day: String,
    min_bounty: String,
    space_available_mb: u64,
    min_span: u32,
    max_span: u32,
}

impl HttpStorageDaemon {
    /// Builds a client against `base` (for example `http://127.0.0.1:7711`)
    /// with a per-call timeout.
    pub fn new(
        base: impl Into<String>,
        credentials: Option<Credentials>,
        call_timeout: Duration,
    ) -> Result<Self, DaemonError> {
        let client = reqwest::Client::builder().timeout(call_timeout).build()?;
        Ok(Self {
            base: base.into(),
            client,
            credentials,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(method, format!("{}{path}", self.base));
        if let Some(creds) = &self.credentials {
            builder = builder.basic_auth(&creds.login, Some(&creds.password));
        }
        builder
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, DaemonError> {
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            // A JSON error body distinguishes "entity missing" from a
            // misconfigured API base URL.
            let ack: AckResponse = response.json().await.map_err(|_| {
                DaemonError::InvalidResponse {
                    reason: "got plain 404, check the daemon API base URL".to_string(),
                }
            })?;
            if !ack.error.is_empty() {
                return Err(DaemonError::NotFound);
            }
            return Err(DaemonError::InvalidResponse {
                reason: "empty 404 response".to_string(),
            });
        }
        if !status.is_success() {
            let message = response
                .json::<AckResponse>()
                .await
                .map(|ack| ack.error)
                .unwrap_or_default();
            return Err(DaemonError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response.json().await?)
    }

    fn parse_nano(raw: &str, field: &str) -> Result<BigUint, DaemonError> {
        BigUint::from_str(raw).map_err(|_| DaemonError::InvalidResponse {
            reason: format!("unparseable {field}: {raw}"),
        })
    }
}

#[async_trait]
impl StorageDaemon for HttpStorageDaemon {
    async fn create_bag(
        &self,
        path: &Path,
        description: &str,
        keep_only: &[String],
    ) -> Result<BagId, DaemonError> {
        let path_str = path.to_str().ok_or_else(|| DaemonError::InvalidResponse {
            reason: format!("non-UTF8 upload path: {}", path.display()),
        })?;
        tracing::info!(path = path_str, description, "creating bag");

        let response = self
            .request(reqwest::Method::POST, "/api/v1/create")
            .json(&CreateBagRequest {
                path: path_str,
                description,
                keep_only_paths: keep_only,
            })
            .send()
            .await?;
        let created: CreateBagResponse = Self::decode(response).await?;
        let id: BagId = created.bag_id.parse()?;

        tracing::info!(path = path_str, id = %id, "bag created");
        Ok(id)
    }

    async fn bag_details(&self, id: BagId) -> Result<BagDetails, DaemonError> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/api/v1/details?bag_id={id}"),
            )
            .send()
            .await?;
        let details: DetailsResponse = Self::decode(response).await?;
        let merkle_hash =
            hex::decode(&details.merkle_hash).map_err(|_| DaemonError::InvalidResponse {
                reason: format!("unparseable merkle hash: {}", details.merkle_hash),
            })?;
        Ok(BagDetails {
            size: details.size,
            header_size: details.header_size,
            piece_size: details.piece_size,
            merkle_hash,
        })
    }

    async fn remove_bag(&self, id: BagId, with_files: bool) -> Result<(), DaemonError> {
        let response = self
            .request(reqwest::Method::POST, "/api/v1/remove")
            .json(&RemoveBagRequest {
                bag_id: id.to_string(),
                with_files,
            })
            .send()
            .await?;
        let ack: AckResponse = Self::decode(response).await?;
        if !ack.ok {
            return Err(DaemonError::Rejected {
                status: 200,
                message: ack.error,
            });
        }
        Ok(())
    }

    async fn storage_rates(
        &self,
        provider_key: &[u8],
        size: u64,
    ) -> Result<ProviderRates, DaemonError> {
        let response = self
            .request(reqwest::Method::POST, "/api/v1/provider/rates")
            .json(&RatesRequest {
                provider_key: &hex::encode(provider_key),
                size,
            })
            .send()
            .await?;
        let rates: RatesResponse = Self::decode(response).await?;
        Ok(ProviderRates {
            available: rates.available,
            rate_per_mb_day: Self::parse_nano(&rates.rate_per_mb_day, "rate_per_mb_day")?,
            min_bounty: Self::parse_nano(&rates.min_bounty, "min_bounty")?,
            space_available_mb: rates.space_available_mb,
            min_span: rates.min_span,
            max_span: rates.max_span,
        })
    }

    async fn storage_info(
        &self,
        provider_key: &[u8],
        contract_address: &str,
        byte_to_proof: u64,
    ) -> Result<StorageInfo, DaemonError> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!(
                    "/api/v1/provider/storage?provider={}&contract={contract_address}&byte_to_proof={byte_to_proof}",
                    hex::encode(provider_key)
                ),
            )
            .send()
            .await?;
        Self::decode(response).await
    }
}
