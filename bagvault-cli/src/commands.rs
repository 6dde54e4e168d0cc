//! CLI command implementations.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bagvault_core::chain::HttpChainClient;
use bagvault_core::config::BagvaultConfig;
use bagvault_core::daemon::{Credentials, HttpStorageDaemon};
use bagvault_core::records::FileRepository;
use bagvault_core::store::Store;
use bagvault_core::tracing_setup::{CliLogLevel, init_tracing};
use bagvault_core::worker::Provisioner;
use clap::Subcommand;

/// Available CLI commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Run the provisioning service
    Run {
        /// Directory holding the embedded database
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Root directory for uploaded files
        #[arg(long)]
        upload_dir: Option<PathBuf>,
        /// Storage daemon API base URL
        #[arg(long)]
        daemon_url: Option<String>,
        /// Storage daemon API login
        #[arg(long)]
        daemon_login: Option<String>,
        /// Storage daemon API password
        #[arg(long)]
        daemon_password: Option<String>,
        /// Chain node API base URL
        #[arg(long)]
        chain_url: Option<String>,
        /// Hex-encoded public key of the storage provider
        #[arg(long)]
        provider_key: Option<String>,
        /// Console log level
        #[arg(long, default_value = "info")]
        log_level: CliLogLevel,
    },
    /// List the tracked files of one owner
    List {
        /// Owner wallet address
        owner: String,
        /// Directory holding the embedded database
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Request removal of an unpaid file
    Remove {
        /// Owner wallet address
        owner: String,
        /// File name as uploaded
        name: String,
        /// Directory holding the embedded database
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

/// Dispatches the parsed command.
///
/// # Errors
/// Returns the first startup or store error; in-loop worker failures are
/// logged, not returned.
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Run {
            data_dir,
            upload_dir,
            daemon_url,
            daemon_login,
            daemon_password,
            chain_url,
            provider_key,
            log_level,
        } => {
            run(
                data_dir,
                upload_dir,
                daemon_url,
                daemon_login,
                daemon_password,
                chain_url,
                provider_key,
                log_level,
            )
            .await
        }
        Commands::List { owner, data_dir } => list(owner, data_dir),
        Commands::Remove {
            owner,
            name,
            data_dir,
        } => remove(owner, name, data_dir),
    }
}

#[allow(clippy::too_many_arguments)]
async fn run(
    data_dir: Option<PathBuf>,
    upload_dir: Option<PathBuf>,
    daemon_url: Option<String>,
    daemon_login: Option<String>,
    daemon_password: Option<String>,
    chain_url: Option<String>,
    provider_key: Option<String>,
    log_level: CliLogLevel,
) -> anyhow::Result<()> {
    init_tracing(log_level.as_tracing_level(), None)
        .map_err(|err| anyhow::anyhow!("tracing setup failed: {err}"))?;

    let mut config = BagvaultConfig::from_env();
    if let Some(dir) = data_dir {
        config.store.data_dir = dir;
    }
    if let Some(dir) = upload_dir {
        config.upload.root_dir = dir;
    }
    if let Some(url) = daemon_url {
        config.daemon.base_url = url;
    }
    if let Some(login) = daemon_login {
        config.daemon.login = Some(login);
    }
    if let Some(password) = daemon_password {
        config.daemon.password = Some(password);
    }
    if let Some(url) = chain_url {
        config.chain.base_url = url;
    }
    if let Some(key) = provider_key {
        config.chain.provider_key = key;
    }

    let provider_key = hex::decode(&config.chain.provider_key)
        .context("provider key must be hex-encoded")?;
    if provider_key.is_empty() {
        anyhow::bail!("a provider key is required, pass --provider-key or BAGVAULT_PROVIDER_KEY");
    }

    let store = Arc::new(Store::open(&config.store.data_dir).context("opening store")?);
    let repo = Arc::new(FileRepository::new(Arc::clone(&store)));

    let credentials = match (&config.daemon.login, &config.daemon.password) {
        (Some(login), Some(password)) => Some(Credentials {
            login: login.clone(),
            password: password.clone(),
        }),
        _ => None,
    };
    let daemon = Arc::new(
        HttpStorageDaemon::new(
            config.daemon.base_url.clone(),
            credentials,
            config.daemon.call_timeout,
        )
        .context("building daemon client")?,
    );
    let chain = Arc::new(
        HttpChainClient::new(config.chain.base_url.clone(), config.chain.call_timeout)
            .context("building chain client")?,
    );

    let handle = Provisioner::new(
        repo,
        daemon,
        chain,
        config.worker.clone(),
        config.upload.root_dir.clone(),
        provider_key,
    )
    .start();
    tracing::info!(
        data_dir = %config.store.data_dir.display(),
        daemon = %config.daemon.base_url,
        chain = %config.chain.base_url,
        "bagvault running, press ctrl-c to stop"
    );

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    handle.shutdown().await;
    store.flush().context("flushing store")?;
    Ok(())
}

fn open_repo(data_dir: Option<PathBuf>) -> anyhow::Result<FileRepository> {
    let mut config = BagvaultConfig::from_env();
    if let Some(dir) = data_dir {
        config.store.data_dir = dir;
    }
    let store = Arc::new(Store::open(&config.store.data_dir).context("opening store")?);
    Ok(FileRepository::new(store))
}

fn list(owner: String, data_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let repo = open_repo(data_dir)?;
    let records = repo.list_for_owner(&owner)?;
    if records.is_empty() {
        println!("no files for {owner}");
        return Ok(());
    }
    for record in records {
        let bag = record
            .bag
            .as_ref()
            .map(|bag| bag.root_hash.to_string())
            .unwrap_or_else(|| "-".to_string());
        let status = record
            .provider
            .as_ref()
            .map(|p| format!("{} ({})", p.status, p.time_left))
            .unwrap_or_else(|| format!("{:?}", record.state));
        println!("{}\t{}\t{}", record.name, bag, status);
    }
    Ok(())
}

fn remove(owner: String, name: String, data_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let repo = open_repo(data_dir)?;
    repo.request_deletion(&owner, &name)?;
    println!("removal of {owner}:{name} scheduled");
    Ok(())
}
