//! Chamber-Sync main entry point
//!
//! This is the command-line interface for the Chamber-Sync open-data importer.

use chamber_sync::config::{load_config_with_hash, Config};
use chamber_sync::crawler::{run_sync, RecrawlScheduler, RunMode};
use chamber_sync::normalize_url;
use chamber_sync::output::{load_statistics, print_statistics};
use chamber_sync::storage::{open_storage, DomainStore, Storage};
use chrono::Utc;
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// Chamber-Sync: keeps a relational store in step with a volatile open-data publisher
///
/// Chamber-Sync scans listing pages, tracks every linked resource through an
/// import lifecycle, and upserts parsed entities keyed by their natural key.
/// Rotating access tokens, retries and schema drift are handled per resource.
#[derive(Parser, Debug)]
#[command(name = "chamber-sync")]
#[command(version)]
#[command(about = "Crawl-state tracking and idempotent ingestion for open data", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Run one discovery, scheduling and import pass, then exit
    #[arg(long, conflicts_with_all = ["stats", "sweep", "reset", "dedup", "dry_run"])]
    once: bool,

    /// Show statistics from the database and exit
    #[arg(long, conflicts_with_all = ["sweep", "reset", "dedup", "dry_run"])]
    stats: bool,

    /// Run a single scheduler pass (expired claims, token refreshes) and exit
    #[arg(long, conflicts_with_all = ["reset", "dedup", "dry_run"])]
    sweep: bool,

    /// Re-admit an abandoned or parked resource with a fresh retry budget
    #[arg(long, value_name = "URL", conflicts_with_all = ["dedup", "dry_run"])]
    reset: Option<String>,

    /// Remove duplicate domain records and install the natural-key constraint
    #[arg(long, conflicts_with = "dry_run")]
    dedup: bool,

    /// Validate config and show what would be synced without syncing
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);

    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, config_hash) = match load_config_with_hash(&cli.config) {
        Ok((cfg, hash)) => {
            tracing::info!("Configuration loaded successfully (hash: {})", hash);
            (cfg, hash)
        }
        Err(e) => {
            tracing::error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    if cli.dry_run {
        handle_dry_run(&config)
    } else if cli.stats {
        handle_stats(&config)
    } else if cli.sweep {
        handle_sweep(&config)
    } else if let Some(url) = cli.reset.as_deref() {
        handle_reset(&config, url)
    } else if cli.dedup {
        handle_dedup(&config)
    } else {
        let mode = if cli.once {
            RunMode::Once
        } else {
            RunMode::Continuous
        };
        handle_sync(config, &config_hash, mode).await
    }
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("chamber_sync=info,warn"),
            1 => EnvFilter::new("chamber_sync=debug,info"),
            2 => EnvFilter::new("chamber_sync=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Handles the --dry-run mode: validates config and shows what would be synced
fn handle_dry_run(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Chamber-Sync Dry Run ===\n");

    println!("Store:");
    println!("  Database: {}", config.store.database_path);

    println!("\nWorkers:");
    println!("  Count: {}", config.worker.count);
    println!("  Batch size: {}", config.worker.batch_size);
    println!("  Claim timeout: {}s", config.worker.claim_timeout_secs);
    println!("  Request timeout: {}s", config.worker.request_timeout_secs);

    println!("\nRetry:");
    println!("  Max retries: {}", config.retry.max_retries);
    println!(
        "  Backoff: {}s x{} (cap {}s)",
        config.retry.backoff_base_secs, config.retry.backoff_factor, config.retry.backoff_cap_secs
    );

    println!("\nUser Agent: {}", config.user_agent.header_value());

    println!("\nListings ({}):", config.listing.len());
    for listing in &config.listing {
        match &listing.href_contains {
            Some(filter) => println!("  - {} -> {} (links containing '{}')", listing.url, listing.family, filter),
            None => println!("  - {} -> {}", listing.url, listing.family),
        }
    }

    println!("\nMappings ({}):", config.mapping.len());
    for mapping in &config.mapping {
        println!(
            "  - {} v{} keyed by [{}], {} fields, {} child kinds",
            mapping.family,
            mapping.version,
            mapping.natural_key.join(", "),
            mapping.fields.len(),
            mapping.children.len()
        );
    }

    println!("\n✓ Configuration is valid");

    Ok(())
}

/// Handles the --stats mode: shows statistics from the database
fn handle_stats(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    println!("Database: {}\n", config.store.database_path);

    let storage = open_storage(Path::new(&config.store.database_path))?;
    let stats = load_statistics(&storage)?;
    print_statistics(&stats);

    Ok(())
}

/// Handles the --sweep mode: one scheduler pass
fn handle_sweep(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let mut storage = open_storage(Path::new(&config.store.database_path))?;
    let scheduler = RecrawlScheduler::new(config.retry.policy(), config.worker.claim_timeout());
    let report = scheduler.run_pass(&mut storage, Utc::now())?;

    println!(
        "✓ Swept {} expired claims ({} retried, {} abandoned), re-admitted {} token refreshes",
        report.swept, report.retried, report.abandoned, report.readmitted
    );

    Ok(())
}

/// Handles the --reset mode: operator re-admission of one resource
fn handle_reset(config: &Config, url: &str) -> Result<(), Box<dyn std::error::Error>> {
    let normalized = normalize_url(url)?;
    let mut storage = open_storage(Path::new(&config.store.database_path))?;
    let record = storage.reset_for_operator(normalized.as_str(), Utc::now())?;

    tracing::info!("Reset {} for re-import", record.url);
    println!("✓ {} is {} again", record.url, record.status);

    Ok(())
}

/// Handles the --dedup mode: one-time natural-key deduplication
fn handle_dedup(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let mut storage = open_storage(Path::new(&config.store.database_path))?;
    let report = storage.dedup_domain_records()?;

    println!(
        "✓ Removed {} duplicate records ({} child rows) across {} groups",
        report.removed_record_ids.len(),
        report.removed_children,
        report.duplicate_groups
    );
    if report.constraint_added {
        println!("✓ Natural-key constraint installed");
    }

    Ok(())
}

/// Handles the main sync operation
async fn handle_sync(
    config: Config,
    config_hash: &str,
    mode: RunMode,
) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(
        "Listings: {}, mapped families: {}, workers: {}",
        config.listing.len(),
        config.mapping.len(),
        config.worker.count
    );

    match run_sync(config, config_hash, mode).await {
        Ok(summary) => {
            tracing::info!(
                "Sync completed: {} imported, {} failed, {} skipped",
                summary.drain.imported,
                summary.drain.failed,
                summary.drain.skipped
            );
            Ok(())
        }
        Err(e) => {
            tracing::error!("Sync failed: {}", e);
            Err(e.into())
        }
    }
}
