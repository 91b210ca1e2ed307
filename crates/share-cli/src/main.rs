//! MetaFuse Shares CLI
//!
//! Command-line interface for inspecting share objects, releasing stuck
//! dataset locks and running the verifier and reapplier.

use clap::{Parser, Subcommand};
use metafuse_share_core::{ShareObject, ShareObjectItem, ShareObjectStatus};
use metafuse_share_engine::processor::memory::{InMemoryDatashareApi, InMemoryObjectStorageApi};
use metafuse_share_engine::{
    reapplier_task, verifier_task, Collaborators, DirectorySnapshot, InMemoryDirectory,
    InMemoryIdentityProvider, InMemoryPolicyStore, ShareReapplier, ShareService, ShareVerifier,
    SharingConfig, SharingRegistry, SweepReport, TracingNotifier,
};
use metafuse_share_storage::{
    initialize_store, DatasetLockCoordinator, ItemFilter, ShareFilter, ShareRepository,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

type CliResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "metafuse-shares")]
#[command(version, about = "MetaFuse share administration CLI", long_about = None)]
struct Cli {
    /// Path to the share database (overrides METAFUSE_SHARES_DB)
    #[arg(short, long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the share database
    Init,

    /// List share objects
    List {
        /// Filter by dataset
        #[arg(short, long)]
        dataset: Option<String>,

        /// Filter by share status (e.g. Processed, Submitted)
        #[arg(short, long)]
        status: Option<String>,

        /// Include rejected and deleted shares
        #[arg(short, long)]
        all: bool,
    },

    /// Show a share object and its items
    Show {
        share_uri: String,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show item counts of a share
    Stats { share_uri: String },

    /// List held dataset locks
    Locks,

    /// Release a dataset lock regardless of its holder
    Unlock { dataset_uri: String },

    /// Verify every active share once (cloud APIs simulated in memory)
    Verify {
        /// JSON file with the datasets and environments to resolve against
        #[arg(long)]
        directory: PathBuf,
    },

    /// Reapply unhealthy and failed items once (cloud APIs simulated in memory)
    Reapply {
        #[arg(long)]
        directory: PathBuf,

        /// Only reapply shares of this dataset
        #[arg(short = 's', long)]
        dataset: Option<String>,
    },

    /// Run the verifier and reapplier on their intervals until interrupted
    Run {
        #[arg(long)]
        directory: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> CliResult {
    let config = load_config(cli.db)?;

    match cli.command {
        Commands::Init => init_store(&config).await,
        Commands::List {
            dataset,
            status,
            all,
        } => list_shares(&config, dataset, status, all).await,
        Commands::Show { share_uri, json } => show_share(&config, &share_uri, json).await,
        Commands::Stats { share_uri } => show_stats(&config, &share_uri).await,
        Commands::Locks => list_locks(&config).await,
        Commands::Unlock { dataset_uri } => unlock_dataset(&config, &dataset_uri).await,
        Commands::Verify { directory } => {
            let service = local_service(&config, &directory).await?;
            let report = ShareVerifier::new(service).run_once().await?;
            print_sweep("Verification", &report);
            Ok(())
        }
        Commands::Reapply { directory, dataset } => {
            let service = local_service(&config, &directory).await?;
            let report = ShareReapplier::new(service)
                .run_once(dataset.as_deref())
                .await?;
            print_sweep("Reapply", &report);
            Ok(())
        }
        Commands::Run { directory } => run_tasks(&config, &directory).await,
    }
}

fn load_config(db: Option<PathBuf>) -> CliResult<SharingConfig> {
    let config = SharingConfig::from_env()?;
    let config = match db {
        Some(db_path) => SharingConfig { db_path, ..config },
        None => config,
    };
    config.validate()?;
    Ok(config)
}

async fn init_store(config: &SharingConfig) -> CliResult {
    let created = initialize_store(config.db_path.clone()).await?;
    if created {
        println!("Created share store at {}", config.db_path.display());
    } else {
        println!("Share store at {} is up to date", config.db_path.display());
    }
    println!("Schema version: {}", metafuse_share_core::SCHEMA_VERSION);
    Ok(())
}

async fn list_shares(
    config: &SharingConfig,
    dataset: Option<String>,
    status: Option<String>,
    all: bool,
) -> CliResult {
    let status = status
        .map(|s| s.parse::<ShareObjectStatus>())
        .transpose()?;
    let repo = ShareRepository::new(config.db_path.clone());
    let shares = repo
        .list_shares(ShareFilter {
            dataset_uri: dataset,
            status,
            active_only: !all,
        })
        .await?;

    if shares.is_empty() {
        println!("No shares found.");
        return Ok(());
    }

    println!(
        "{:<38} {:<20} {:<24} {:<18} Updated",
        "Share", "Dataset", "Principal", "Status"
    );
    for share in &shares {
        println!(
            "{:<38} {:<20} {:<24} {:<18} {}",
            share.share_uri,
            share.dataset_uri,
            share.principal_id,
            share.status,
            share.updated.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!("\n{} share(s)", shares.len());
    Ok(())
}

async fn show_share(config: &SharingConfig, share_uri: &str, json: bool) -> CliResult {
    let repo = ShareRepository::new(config.db_path.clone());
    let share = repo
        .get_share(share_uri)
        .await?
        .ok_or_else(|| format!("Share not found: {}", share_uri))?;
    let items = repo.list_items(share_uri, ItemFilter::default()).await?;

    if json {
        let value = serde_json::json!({ "share": share, "items": items });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    print_share(&share);
    print_items(&items);
    Ok(())
}

fn print_share(share: &ShareObject) {
    println!("Share: {}", share.share_uri);
    println!("Dataset: {}", share.dataset_uri);
    println!(
        "Environments: {} -> {}",
        share.source_environment_uri, share.target_environment_uri
    );
    println!(
        "Principal: {} ({}, role {})",
        share.principal_id, share.principal_type, share.principal_role_name
    );
    println!("Requested by: {} ({})", share.owner, share.group_uri);
    let permissions: Vec<String> = share.permissions.iter().map(|p| p.to_string()).collect();
    println!("Permissions: {}", permissions.join(", "));
    println!("Status: {}", share.status);
    if let Some(purpose) = &share.request_purpose {
        println!("Request purpose: {}", purpose);
    }
    if let Some(purpose) = &share.reject_purpose {
        println!("Reject purpose: {}", purpose);
    }
    println!("Created: {}", share.created);
    println!("Last Updated: {}", share.updated);
    if let Some(deleted) = share.deleted {
        println!("Deleted: {}", deleted);
    }
}

fn print_items(items: &[ShareObjectItem]) {
    if items.is_empty() {
        println!("\nNo items.");
        return;
    }

    println!("\nItems:");
    for item in items {
        let health = item
            .health_status
            .map(|h| h.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {} [{}] {} (health: {})",
            item.item_name, item.item_type, item.status, health
        );
        if let Some(message) = &item.health_message {
            println!("      {}", message);
        }
    }
}

async fn show_stats(config: &SharingConfig, share_uri: &str) -> CliResult {
    let repo = ShareRepository::new(config.db_path.clone());
    if repo.get_share(share_uri).await?.is_none() {
        return Err(format!("Share not found: {}", share_uri).into());
    }
    let stats = metafuse_share_core::ShareStatistics::from_statuses(
        repo.item_statuses(share_uri).await?,
    );

    println!("Share Statistics: {}", share_uri);
    println!("  Shared: {}", stats.shared_items);
    println!("  Revoked: {}", stats.revoked_items);
    println!("  Failed: {}", stats.failed_items);
    println!("  Pending: {}", stats.pending_items);
    Ok(())
}

async fn list_locks(config: &SharingConfig) -> CliResult {
    let locks = DatasetLockCoordinator::new(config.db_path.clone(), config.lock_retry_policy());
    let held = locks.list_held_locks().await?;

    if held.is_empty() {
        println!("No dataset locks held.");
        return Ok(());
    }

    for lock in held {
        println!(
            "{} held by {} since {}",
            lock.dataset_uri,
            lock.acquired_by.as_deref().unwrap_or("unknown"),
            lock.acquired_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".to_string())
        );
    }
    Ok(())
}

async fn unlock_dataset(config: &SharingConfig, dataset_uri: &str) -> CliResult {
    let locks = DatasetLockCoordinator::new(config.db_path.clone(), config.lock_retry_policy());
    match locks.force_release(dataset_uri).await? {
        Some(holder) => println!("Released lock on {} held by {}", dataset_uri, holder),
        None => println!("No lock held on {}", dataset_uri),
    }
    Ok(())
}

/// Share service over a directory snapshot, with cloud APIs and policies
/// kept in memory.
async fn local_service(config: &SharingConfig, directory: &Path) -> CliResult<Arc<ShareService>> {
    let snapshot = DirectorySnapshot::from_json_file(directory)?;
    let identity = Arc::new(InMemoryIdentityProvider::from_environments(
        &snapshot.environments,
    ));
    let registry = SharingRegistry::standard(
        identity.clone(),
        Arc::new(InMemoryObjectStorageApi::new()),
        Arc::new(InMemoryDatashareApi::new()),
    );

    let service = ShareService::new(
        config,
        registry,
        Collaborators {
            directory: Arc::new(InMemoryDirectory::from_snapshot(snapshot)),
            identity,
            policies: Arc::new(InMemoryPolicyStore::new()),
            notifier: Arc::new(TracingNotifier),
        },
    );
    service.repository().initialize().await?;
    Ok(Arc::new(service))
}

async fn run_tasks(config: &SharingConfig, directory: &Path) -> CliResult {
    let service = local_service(config, directory).await?;

    let verifier = tokio::spawn(verifier_task(service.clone(), config.clone()));
    let reapplier = tokio::spawn(reapplier_task(service, config.reapplier_interval));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, stopping share tasks");

    verifier.abort();
    reapplier.abort();
    Ok(())
}

fn print_sweep(label: &str, report: &SweepReport) {
    println!("{} sweep: {} share(s) processed", label, report.processed);
    if !report.is_clean() {
        println!("\nErrors:");
        for error in &report.errors {
            println!("  {}", error);
        }
    }
}
