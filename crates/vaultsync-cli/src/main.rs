//! Vaultsync CLI
//!
//! Thin wrapper around vaultsync-core for command-line usage. The remote
//! store is a redb file; pointing two data directories at the same
//! `--remote` file behaves like two devices sharing one account.
//!
//! ## Usage
//!
//! ```bash
//! # Create the data directory, config file and device key
//! vaultsync init
//!
//! # Store a record (JSON body) and list records of a type
//! vaultsync record put collection_item '{"name": "linen shirt", "color": "navy"}'
//! vaultsync record list collection_item
//!
//! # Sync every built-in record type, or just one
//! vaultsync sync
//! vaultsync sync vault_item --incremental
//!
//! # Keep syncing every 30 seconds, following [network] reachability
//! vaultsync watch --every 30
//!
//! # Inspect and settle conflicts that need a decision
//! vaultsync conflicts list
//! vaultsync conflicts resolve <record_id> remote
//!
//! # Rotate the device key, drop keys nothing uses anymore
//! vaultsync keys rotate
//! vaultsync keys retire
//!
//! # Move record keys to another device
//! vaultsync backup export --passphrase "..." --output keys.backup
//! vaultsync backup import keys.backup --passphrase "..."
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::prelude::*;
use vaultsync_core::config::CONFIG_FILE_NAME;
use vaultsync_core::logging::JsonlLayer;
use vaultsync_core::{
    AlwaysPresent, FileRemoteStore, KeyManager, LocalStore, NetworkMonitor, NetworkSettings,
    ReachabilityProbe, Record, RecordId, RecordType, ResolutionChoice, SoftwareKeyStore, Storage,
    SyncConfig, SyncOrchestrator, SyncReport, TcpProbe,
};

/// Local database file inside the data directory
const LOCAL_DB_FILE: &str = "local.redb";
/// Default remote store file inside the data directory
const REMOTE_DB_FILE: &str = "remote.redb";

/// Vaultsync - zero-knowledge record sync
#[derive(Parser)]
#[command(name = "vaultsync")]
#[command(version)]
#[command(about = "Vaultsync - zero-knowledge record sync")]
#[command(
    long_about = "Encrypts personal records on this device and syncs them through a remote store that never sees their contents."
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Data directory (default: ~/.vaultsync/data)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Remote store file (default: <data-dir>/remote.redb)
    #[arg(short, long, global = true)]
    remote: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the data directory, default config and device key
    Init,

    /// Show device and store information
    Info,

    /// Local record management
    Record {
        #[command(subcommand)]
        action: RecordAction,
    },

    /// Run a sync cycle
    Sync {
        /// Record types to sync (default: all built-in types)
        record_types: Vec<String>,

        /// Only pull changes since the last successful sync
        #[arg(short, long)]
        incremental: bool,
    },

    /// Sync repeatedly, pausing while [network] reachability reports offline
    Watch {
        /// Record types to sync (default: all built-in types)
        record_types: Vec<String>,

        /// Seconds between sync passes
        #[arg(short, long, default_value_t = 30)]
        every: u64,

        /// Stop after this many seconds (default: run until Ctrl-C)
        #[arg(long = "for")]
        duration: Option<u64>,
    },

    /// Conflicts that need a manual decision
    Conflicts {
        #[command(subcommand)]
        action: ConflictAction,
    },

    /// Device key management
    Keys {
        #[command(subcommand)]
        action: KeyAction,
    },

    /// Passphrase-protected backup of record keys
    Backup {
        #[command(subcommand)]
        action: BackupAction,
    },
}

#[derive(Subcommand)]
enum RecordAction {
    /// Create a record, or update one with --id
    Put {
        /// Record type (e.g. collection_item)
        record_type: String,
        /// Record body as JSON
        body: String,
        /// Update this record instead of creating a new one
        #[arg(long)]
        id: Option<String>,
    },
    /// List records of a type
    List {
        /// Record type
        record_type: String,
        /// Include deleted records
        #[arg(short, long)]
        all: bool,
    },
    /// Delete a record (synced as a tombstone)
    Delete {
        /// Record ID (UUID)
        record_id: String,
        /// Also remove it from the remote store and drop its keys
        #[arg(long)]
        purge: bool,
    },
}

#[derive(Subcommand)]
enum ConflictAction {
    /// Sync and list the conflicts waiting for a decision
    List {
        /// Record types to check (default: all built-in types)
        record_types: Vec<String>,
    },
    /// Settle the conflict on a record
    Resolve {
        /// Record ID (UUID)
        record_id: String,
        /// local, remote or merge
        choice: ResolutionChoice,
    },
}

#[derive(Subcommand)]
enum KeyAction {
    /// Show the current device key and migration progress
    Show,
    /// Replace the device key pair; records migrate as they are decrypted
    Rotate,
    /// Delete retired key pairs no record is wrapped under anymore
    Retire,
}

#[derive(Subcommand)]
enum BackupAction {
    /// Export every record key under a passphrase
    Export {
        #[arg(short, long)]
        passphrase: String,
        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Import record keys from a backup file
    Import {
        /// Backup file
        file: PathBuf,
        #[arg(short, long)]
        passphrase: String,
    },
}

/// Everything a command needs, opened from one data directory.
struct Vault {
    data_dir: PathBuf,
    remote_path: PathBuf,
    network: NetworkSettings,
    storage: Storage,
    key_store: Arc<SoftwareKeyStore>,
    keys: Arc<KeyManager>,
    orchestrator: SyncOrchestrator,
}

impl Vault {
    fn open(data_dir: &Path, remote: Option<PathBuf>) -> Result<Self> {
        std::fs::create_dir_all(data_dir).with_context(|| {
            format!("Failed to create data directory {}", data_dir.display())
        })?;

        let config = SyncConfig::load(data_dir.join(CONFIG_FILE_NAME))
            .context("Failed to load configuration")?;

        let storage =
            Storage::new(data_dir.join(LOCAL_DB_FILE)).context("Failed to open local database")?;
        let key_store = Arc::new(
            SoftwareKeyStore::open(storage.clone(), AlwaysPresent)
                .context("Failed to open device key store")?,
        );
        let keys = Arc::new(KeyManager::new(
            key_store.clone(),
            Arc::new(storage.clone()),
            config.keys.clone(),
            config.backup.clone(),
        ));

        let remote_path = remote.unwrap_or_else(|| data_dir.join(REMOTE_DB_FILE));
        let remote_store = FileRemoteStore::open(&remote_path)
            .with_context(|| format!("Failed to open remote store {}", remote_path.display()))?;

        let orchestrator = SyncOrchestrator::builder(
            keys.clone(),
            Arc::new(remote_store),
            Arc::new(storage.clone()),
            Arc::new(storage.clone()),
        )
        .settings(config.sync.clone())
        .device_id(storage.device_id()?)
        .build();

        debug!(data_dir = %data_dir.display(), remote = %remote_path.display(), "Vault opened");
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            remote_path,
            network: config.network.clone(),
            storage,
            key_store,
            keys,
            orchestrator,
        })
    }

    /// Find a local record by id string
    fn record(&self, record_id: &str) -> Result<Record> {
        let id = parse_record_id(record_id)?;
        self.storage
            .get(&id)?
            .ok_or_else(|| anyhow::anyhow!("Record not found: {}", id))
    }

    /// Point the orchestrator at `[network]` reachability, sampled once now.
    /// Given a `shutdown` token, sampling continues every
    /// `probe_interval_secs` until it fires. Nothing happens without
    /// `probe_addr`.
    async fn follow_network(
        &self,
        shutdown: Option<CancellationToken>,
    ) -> Option<(NetworkMonitor, Option<JoinHandle<()>>)> {
        let probe = TcpProbe::from_settings(&self.network)?;
        let initial = probe.probe().await;
        debug!(state = %initial, "Initial reachability");

        let monitor = NetworkMonitor::new(initial);
        // Detached; ends when the monitor is dropped
        drop(self.orchestrator.attach_network(&monitor));
        let sampler = shutdown.map(|shutdown| {
            let interval = Duration::from_secs(self.network.probe_interval_secs.max(1));
            monitor.spawn_probe(probe, interval, shutdown)
        });
        Some((monitor, sampler))
    }

    async fn sync(&self, record_type: RecordType, incremental: bool) -> Result<SyncReport> {
        let result = if incremental {
            self.orchestrator
                .request_incremental_sync(record_type.clone())
                .await
        } else {
            self.orchestrator.request_sync(record_type.clone()).await
        };
        result.with_context(|| format!("Sync of {} failed", record_type))
    }
}

fn setup_logging(verbosity: u8, data_dir: &Path) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let log_path = data_dir.join("logs").join("vaultsync.jsonl");
    let jsonl = match JsonlLayer::open(&log_path) {
        Ok(layer) => Some(layer),
        Err(e) => {
            eprintln!("Warning: cannot write log file {}: {}", log_path.display(), e);
            None
        }
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(jsonl)
        .init();
}

/// Get the default data directory (~/.vaultsync/data)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".vaultsync")
        .join("data")
}

/// Parse a record ID from its UUID string
fn parse_record_id(s: &str) -> Result<RecordId> {
    RecordId::parse(s).map_err(|e| anyhow::anyhow!("Invalid record ID '{}': {}", s, e))
}

/// Record types named on the command line, or every built-in type
fn record_types(names: &[String]) -> Vec<RecordType> {
    if names.is_empty() {
        vec![
            RecordType::collection_item(),
            RecordType::preference_profile(),
            RecordType::vault_item(),
        ]
    } else {
        names.iter().map(RecordType::new).collect()
    }
}

fn print_report(report: &SyncReport) {
    println!("Synced {}:", report.record_type);
    println!("  Uploaded: {}", report.uploaded);
    println!("  Downloaded: {}", report.downloaded);
    if report.auto_resolved > 0 {
        println!("  Auto-resolved: {}", report.auto_resolved);
    }
    if report.skipped > 0 {
        println!("  Skipped (no keys): {}", report.skipped);
    }
    if report.queued > 0 {
        println!("  Conflicts: {}", report.queued);
    }
}

fn report_has_changes(report: &SyncReport) -> bool {
    report.uploaded + report.downloaded + report.auto_resolved + report.skipped + report.queued > 0
}

/// Resolves at `deadline`, or never without one.
async fn until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn print_record(record: &Record) {
    let marker = if record.deleted { "✗" } else { "•" };
    println!("{} {} (v{})", marker, record.id, record.version);
    if !record.deleted {
        println!("    {}", record.body);
    }
    println!(
        "    Modified: {}",
        record.last_modified.format("%Y-%m-%d %H:%M:%S UTC")
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    setup_logging(cli.verbose, &data_dir);

    let vault = Vault::open(&data_dir, cli.remote)?;

    match cli.command {
        Commands::Init => {
            let config_path = data_dir.join(CONFIG_FILE_NAME);
            if !config_path.exists() {
                SyncConfig::default()
                    .save(&config_path)
                    .context("Failed to write default configuration")?;
            }
            let device_key = vault.keys.device_public_key()?;

            println!("Initialized Vaultsync data directory");
            println!("  Path: {}", vault.data_dir.display());
            println!("  Config: {}", config_path.display());
            println!("  Device ID: {}", vault.orchestrator.device_id());
            println!("  Device key: {}", device_key.key_id);
        }

        Commands::Info => {
            let device_key = vault.keys.device_public_key()?;

            println!("Vaultsync v{}", env!("CARGO_PKG_VERSION"));
            println!();
            println!("Device:");
            println!("  ID: {}", vault.orchestrator.device_id());
            println!("  Key: {}", device_key.key_id);
            println!("  Key pairs held: {}", vault.key_store.key_count());
            println!();
            println!("Data directory: {}", vault.data_dir.display());
            println!("Remote store: {}", vault.remote_path.display());
            println!();
            println!("Records:");
            for record_type in record_types(&[]) {
                println!(
                    "  {}: {}",
                    record_type,
                    vault.storage.live_count(&record_type)?
                );
            }
            let pending = vault.keys.pending_rewrap()?.len();
            if pending > 0 {
                println!();
                println!("Records awaiting key migration: {}", pending);
            }
        }

        Commands::Record { action } => match action {
            RecordAction::Put {
                record_type,
                body,
                id,
            } => {
                let record_type = RecordType::new(record_type);
                let body: serde_json::Value =
                    serde_json::from_str(&body).context("Record body is not valid JSON")?;

                let record = match id {
                    Some(id) => {
                        let id = parse_record_id(&id)?;
                        match vault.storage.get(&id)? {
                            Some(existing) => {
                                if existing.record_type != record_type {
                                    anyhow::bail!(
                                        "Record {} is a {}, not a {}",
                                        id,
                                        existing.record_type,
                                        record_type
                                    );
                                }
                                existing.updated(body)
                            }
                            None => {
                                let mut record = Record::new(record_type, body);
                                record.id = id;
                                record
                            }
                        }
                    }
                    None => Record::new(record_type, body),
                };
                vault.storage.apply(&record)?;

                println!("Stored record:");
                println!("  ID: {}", record.id);
                println!("  Version: {}", record.version);
            }

            RecordAction::List { record_type, all } => {
                let record_type = RecordType::new(record_type);
                let mut records = vault.storage.all(&record_type)?;
                records.retain(|r| all || !r.deleted);
                records.sort_by_key(|r| r.last_modified);

                if records.is_empty() {
                    println!("No {} records.", record_type);
                } else {
                    println!("{} ({}):", record_type, records.len());
                    for record in &records {
                        print_record(record);
                    }
                }
            }

            RecordAction::Delete { record_id, purge } => {
                let record = vault.record(&record_id)?;
                if !record.deleted {
                    vault.storage.apply(&record.tombstone())?;
                }
                println!("Deleted record: {}", record.id);

                if purge {
                    vault
                        .orchestrator
                        .purge_record(&record.id)
                        .await
                        .context("Failed to purge record from remote store")?;
                    println!("Purged from remote store.");
                }
            }
        },

        Commands::Sync {
            record_types: names,
            incremental,
        } => {
            let _network = vault.follow_network(None).await;
            for record_type in record_types(&names) {
                let report = vault.sync(record_type, incremental).await?;
                print_report(&report);
            }

            let waiting = vault.orchestrator.conflicts().len();
            if waiting > 0 {
                println!();
                println!(
                    "{} conflict(s) need a decision. Run: vaultsync conflicts list",
                    waiting
                );
            }
        }

        Commands::Watch {
            record_types: names,
            every,
            duration,
        } => {
            let types = record_types(&names);
            let shutdown = CancellationToken::new();
            let network = vault.follow_network(Some(shutdown.clone())).await;
            let deadline =
                duration.map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs));
            let mut ticker = tokio::time::interval(Duration::from_secs(every.max(1)));
            let mut first = true;

            println!("Watching {} record type(s). Press Ctrl-C to stop.", types.len());
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    _ = until(deadline) => break,
                    _ = ticker.tick() => {
                        for record_type in &types {
                            match vault.sync(record_type.clone(), !first).await {
                                Ok(report) if report_has_changes(&report) => print_report(&report),
                                Ok(_) => {}
                                Err(e) => warn!(%record_type, error = %format!("{:#}", e), "Sync pass did not complete"),
                            }
                        }
                        first = false;
                    }
                }
            }

            shutdown.cancel();
            if let Some((_, Some(sampler))) = network {
                if let Err(e) = sampler.await {
                    warn!(error = %e, "Reachability sampler ended abnormally");
                }
            }
            info!("Watch stopped");
            println!("Stopped.");
        }

        Commands::Conflicts { action } => match action {
            ConflictAction::List {
                record_types: names,
            } => {
                // Conflicts live in the orchestrator, so detect them afresh
                for record_type in record_types(&names) {
                    vault.sync(record_type, false).await?;
                }

                let conflicts = vault.orchestrator.conflicts();
                if conflicts.is_empty() {
                    println!("No conflicts.");
                } else {
                    println!("Conflicts ({}):", conflicts.len());
                    for conflict in &conflicts {
                        println!(
                            "  {} [{}] {} conflict",
                            conflict.record_id, conflict.record_type, conflict.kind
                        );
                        println!(
                            "    Local:  v{} {}",
                            conflict.local.version,
                            conflict.local_version.format("%Y-%m-%d %H:%M:%S UTC")
                        );
                        println!(
                            "    Remote: v{} {}",
                            conflict.remote.version,
                            conflict.remote_version.format("%Y-%m-%d %H:%M:%S UTC")
                        );
                    }
                }
            }

            ConflictAction::Resolve { record_id, choice } => {
                let record = vault.record(&record_id)?;
                vault.sync(record.record_type.clone(), false).await?;

                let conflict = vault
                    .orchestrator
                    .conflicts()
                    .into_iter()
                    .find(|c| c.record_id == record.id)
                    .ok_or_else(|| anyhow::anyhow!("No conflict on record {}", record.id))?;
                let resolved = vault
                    .orchestrator
                    .resolve_conflict(conflict.id, choice)
                    .await
                    .context("Failed to resolve conflict")?;

                println!("Resolved conflict on {}", resolved.id);
                println!("  Version: {}", resolved.version);
                if resolved.deleted {
                    println!("  Record is deleted.");
                }
            }
        },

        Commands::Keys { action } => match action {
            KeyAction::Show => {
                let device_key = vault.keys.device_public_key()?;
                println!("Device key:");
                println!("  ID: {}", device_key.key_id);
                println!("  Public: {}", device_key.to_hex());
                println!("  Key pairs held: {}", vault.key_store.key_count());
                println!(
                    "  Records awaiting migration: {}",
                    vault.keys.pending_rewrap()?.len()
                );
            }

            KeyAction::Rotate => {
                let next = vault.orchestrator.rotate_keys()?;
                println!("Rotated device key.");
                println!("  New key: {}", next.key_id);
                println!(
                    "  Records awaiting migration: {}",
                    vault.keys.pending_rewrap()?.len()
                );
            }

            KeyAction::Retire => {
                let retired = vault.keys.retire_unused_keys()?;
                if retired.is_empty() {
                    println!("No key pairs to retire.");
                } else {
                    println!("Retired {} key pair(s):", retired.len());
                    for key_id in &retired {
                        println!("  {}", key_id);
                    }
                }
            }
        },

        Commands::Backup { action } => match action {
            BackupAction::Export { passphrase, output } => {
                if passphrase.is_empty() {
                    anyhow::bail!("Passphrase must not be empty");
                }
                let backup = vault
                    .orchestrator
                    .export_backup(&passphrase)
                    .await
                    .context("Failed to export backup")?;

                match output {
                    Some(path) => {
                        std::fs::write(&path, &backup).with_context(|| {
                            format!("Failed to write backup to {}", path.display())
                        })?;
                        println!("Backup written to {}", path.display());
                    }
                    None => println!("{}", backup),
                }
            }

            BackupAction::Import { file, passphrase } => {
                let data = std::fs::read_to_string(&file)
                    .with_context(|| format!("Failed to read backup {}", file.display()))?;
                let restored = vault
                    .orchestrator
                    .import_backup(data.trim(), &passphrase)
                    .await
                    .context("Failed to import backup")?;
                if restored == 0 {
                    warn!(file = %file.display(), "Backup contained no record keys");
                }
                println!("Imported {} record key(s).", restored);
            }
        },
    }

    Ok(())
}
