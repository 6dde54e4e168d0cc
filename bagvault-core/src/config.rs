//! Runtime configuration.
//!
//! Nested section structs with sane defaults, overridable from the
//! environment. Every duration the worker or the clients consult lives
//! here so tests can shrink them.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration for the provisioning service.
#[derive(Debug, Clone)]
pub struct BagvaultConfig {
    pub store: StoreConfig,
    pub upload: UploadConfig,
    pub daemon: DaemonConfig,
    pub chain: ChainConfig,
    pub worker: WorkerConfig,
}

/// Persistent store settings.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding the embedded database.
    pub data_dir: PathBuf,
}

/// Upload staging settings.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Root under which per-owner upload directories are created.
    pub root_dir: PathBuf,
    /// Maximum simultaneous files per owner that are unpaid or
    /// provider-errored.
    pub pending_cap: usize,
}

/// Storage daemon API settings.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub base_url: String,
    pub login: Option<String>,
    pub password: Option<String>,
    /// Per-call timeout for daemon requests.
    pub call_timeout: Duration,
}

/// Chain node API settings.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub base_url: String,
    /// Hex-encoded public key of the storage provider being contracted.
    pub provider_key: String,
    /// Per-call timeout for chain requests.
    pub call_timeout: Duration,
}

/// Worker cadence and retention settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Interval between worker ticks.
    pub tick_interval: Duration,
    /// How long an unpaid upload survives after packaging before the
    /// expiry sweep removes it.
    pub unpaid_grace: Duration,
    /// Reschedule interval while a record is still awaiting deployment.
    pub retry_interval: Duration,
    /// Reschedule interval between successful contract polls.
    pub poll_interval: Duration,
    /// Minimum gap between refresh bursts triggered by file listings.
    pub refresh_gap: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/db"),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("./data/uploads"),
            pending_cap: 3,
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:7711".to_string(),
            login: None,
            password: None,
            call_timeout: Duration::from_secs(7),
        }
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8081".to_string(),
            provider_key: String::new(),
            call_timeout: Duration::from_secs(7),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(500),
            unpaid_grace: Duration::from_secs(15 * 60),
            retry_interval: Duration::from_secs(15),
            poll_interval: Duration::from_secs(5 * 60),
            refresh_gap: Duration::from_secs(5),
        }
    }
}

impl Default for BagvaultConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            upload: UploadConfig::default(),
            daemon: DaemonConfig::default(),
            chain: ChainConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

impl BagvaultConfig {
    /// Defaults overridden by `BAGVAULT_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = env::var("BAGVAULT_DATA_DIR") {
            config.store.data_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = env::var("BAGVAULT_UPLOAD_DIR") {
            config.upload.root_dir = PathBuf::from(dir);
        }
        if let Ok(cap) = env::var("BAGVAULT_PENDING_CAP")
            && let Ok(cap) = cap.parse()
        {
            config.upload.pending_cap = cap;
        }
        if let Ok(url) = env::var("BAGVAULT_DAEMON_URL") {
            config.daemon.base_url = url;
        }
        if let Ok(login) = env::var("BAGVAULT_DAEMON_LOGIN") {
            config.daemon.login = Some(login);
        }
        if let Ok(password) = env::var("BAGVAULT_DAEMON_PASSWORD") {
            config.daemon.password = Some(password);
        }
        if let Ok(url) = env::var("BAGVAULT_CHAIN_URL") {
            config.chain.base_url = url;
        }
        if let Ok(key) = env::var("BAGVAULT_PROVIDER_KEY") {
            config.chain.provider_key = key;
        }
        if let Ok(ms) = env::var("BAGVAULT_TICK_MS")
            && let Ok(ms) = ms.parse()
        {
            config.worker.tick_interval = Duration::from_millis(ms);
        }
        if let Ok(secs) = env::var("BAGVAULT_UNPAID_GRACE_SECS")
            && let Ok(secs) = secs.parse()
        {
            config.worker.unpaid_grace = Duration::from_secs(secs);
        }

        config
    }

    /// Test configuration: temp-friendly paths and fast cadence.
    pub fn for_testing() -> Self {
        let mut config = Self::default();
        config.store.data_dir = PathBuf::from("/tmp/bagvault-test/db");
        config.upload.root_dir = PathBuf::from("/tmp/bagvault-test/uploads");
        config.worker.tick_interval = Duration::from_millis(10);
        config.worker.retry_interval = Duration::from_millis(50);
        config.worker.poll_interval = Duration::from_millis(100);
        config.daemon.call_timeout = Duration::from_millis(500);
        config.chain.call_timeout = Duration::from_millis(500);
        config
    }
}
