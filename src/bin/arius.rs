//! # Arius CLI
//!
//! Command-line front end for archiving directories into an Arius repository.
//!
//! ## Usage
//! ```bash
//! export ARIUS_PASSPHRASE=...
//!
//! # Archive with deduplication, replacing binaries by pointer files
//! arius --store /mnt/backup archive ~/photos --dedup --remove-local
//!
//! # Recreate pointer files, then download binaries
//! arius --store /mnt/backup restore ~/photos --synchronize --download
//!
//! # Inspect the repository
//! arius --store /mnt/backup versions
//! arius --store /mnt/backup ls --include-deleted
//! ```
//!
//! Exit codes: 0 on success, 1 on error, 2 when a restore is still waiting
//! for hydration (or some items failed).

use anyhow::Context;
use arius::{
    utils::format_bytes, AccessTier, ArchiveOptions, ArchiveSummary, Repository, RepositoryBuilder,
    RestoreOptions, RestoreSummary,
};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// Arius - deduplicated, encrypted archives on tiered storage
#[derive(Parser)]
#[command(name = "arius")]
#[command(version)]
#[command(about = "Archive directories into a deduplicated, encrypted repository")]
#[command(long_about = None)]
struct Cli {
    /// Repository directory
    #[arg(short, long, global = true, env = "ARIUS_STORE")]
    store: Option<PathBuf>,

    /// Repository passphrase
    #[arg(short, long, global = true, env = "ARIUS_PASSPHRASE", hide_env_values = true)]
    passphrase: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Archive a directory
    Archive {
        /// Directory to archive
        path: PathBuf,

        /// Split files into content-defined chunks
        #[arg(long)]
        dedup: bool,

        /// Tier for new chunks
        #[arg(long, value_enum, default_value = "cool")]
        tier: Tier,

        /// Delete binaries after archiving, keeping pointer files
        #[arg(long)]
        remove_local: bool,

        /// Trust unchanged pointer files instead of rehashing
        #[arg(long)]
        fasthash: bool,

        /// Additional glob patterns to skip
        #[arg(short, long)]
        exclude: Vec<String>,
    },

    /// Restore a directory
    Restore {
        /// Directory to restore into
        path: PathBuf,

        /// Make pointer files match the repository
        #[arg(long)]
        synchronize: bool,

        /// Download binaries for pointer files
        #[arg(long)]
        download: bool,

        /// Keep pointer files next to restored binaries
        #[arg(long)]
        keep_pointers: bool,

        /// Restore as of this instant (RFC 3339, e.g. 2024-03-01T12:00:00Z)
        #[arg(long, value_parser = parse_point_in_time)]
        point_in_time: Option<DateTime<Utc>>,
    },

    /// List repository versions
    Versions,

    /// List entries
    Ls {
        /// Show tombstones too
        #[arg(long)]
        include_deleted: bool,

        /// List as of this instant
        #[arg(long, value_parser = parse_point_in_time)]
        point_in_time: Option<DateTime<Utc>>,
    },

    /// Remove hydration staging copies
    PurgeStaging,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum Tier {
    Hot,
    Cool,
    Cold,
    Archive,
}

impl From<Tier> for AccessTier {
    fn from(tier: Tier) -> Self {
        match tier {
            Tier::Hot => AccessTier::Hot,
            Tier::Cool => AccessTier::Cool,
            Tier::Cold => AccessTier::Cold,
            Tier::Archive => AccessTier::Archive,
        }
    }
}

fn parse_point_in_time(value: &str) -> Result<DateTime<Utc>, String> {
    humantime::parse_rfc3339_weak(value)
        .map(arius::utils::system_time_to_utc)
        .map_err(|e| format!("invalid point in time '{}': {}", value, e))
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // Disable colors if needed
    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("{}: {}", "Error".red().bold(), e);
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            let message = match e.downcast_ref::<arius::ArchiveError>() {
                Some(archive_error) => archive_error.user_message(),
                None => format!("{:#}", e),
            };
            eprintln!("{}: {}", "Error".red().bold(), message);
            ExitCode::from(1)
        }
    }
}

/// Main command runner
async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let repository = open_repository(cli.store, cli.passphrase).await?;

    match cli.command {
        Commands::Archive {
            path,
            dedup,
            tier,
            remove_local,
            fasthash,
            exclude,
        } => {
            let mut options = ArchiveOptions::new(path);
            options.dedup = dedup;
            options.tier = tier.into();
            options.remove_local = remove_local;
            options.fast_hash = fasthash;
            options.exclude_patterns.extend(exclude);
            cmd_archive(&repository, options).await
        }
        Commands::Restore {
            path,
            synchronize,
            download,
            keep_pointers,
            point_in_time,
        } => {
            let mut options = RestoreOptions::new(path);
            options.synchronize = synchronize;
            options.download = download;
            options.keep_pointers = keep_pointers;
            options.point_in_time = point_in_time;
            cmd_restore(&repository, options).await
        }
        Commands::Versions => cmd_versions(&repository),
        Commands::Ls {
            include_deleted,
            point_in_time,
        } => cmd_ls(&repository, include_deleted, point_in_time),
        Commands::PurgeStaging => {
            let removed = repository.chunks().purge_hydration_staging().await?;
            println!("{} Removed {} staging copies", "✓".green().bold(), removed.to_string().cyan());
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn open_repository(store: Option<PathBuf>, passphrase: Option<String>) -> anyhow::Result<Repository> {
    let store = store.context("no repository given; pass --store or set ARIUS_STORE")?;
    let passphrase = passphrase.context("no passphrase given; pass --passphrase or set ARIUS_PASSPHRASE")?;

    let repository = RepositoryBuilder::new()
        .local_store(&store)?
        .passphrase(passphrase)
        .open()
        .await
        .with_context(|| format!("failed to open repository {}", store.display()))?;
    Ok(repository)
}

fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        pb.set_style(style);
    }
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

/// Archive a directory and print what changed
async fn cmd_archive(repository: &Repository, options: ArchiveOptions) -> anyhow::Result<ExitCode> {
    println!(
        "{} {}",
        "Archiving".blue().bold(),
        options.root.display().to_string().cyan()
    );

    let start = Instant::now();
    let pb = spinner("Scanning and uploading...");
    let result = repository.archive(options).await;
    pb.finish_and_clear();
    let summary = result?;

    print_archive_summary(&summary, start.elapsed());
    Ok(if summary.has_failures() {
        ExitCode::from(2)
    } else {
        ExitCode::SUCCESS
    })
}

fn print_archive_summary(summary: &ArchiveSummary, elapsed: Duration) {
    match (summary.state_committed, summary.version) {
        (true, Some(version)) => println!(
            "{} Created version {}",
            "✓".green().bold(),
            version.to_rfc3339().yellow().bold()
        ),
        _ => println!("{} Nothing changed", "✓".green().bold()),
    }

    println!("  Files: {}", summary.files_scanned.to_string().cyan());
    println!(
        "  Uploaded: {} binaries, {} chunks",
        summary.binaries_uploaded.to_string().cyan(),
        summary.chunks_uploaded.to_string().cyan()
    );
    println!(
        "  Size: {} original, {} new in repository",
        format_bytes(summary.bytes_original).cyan(),
        format_bytes(summary.bytes_incremental).cyan()
    );
    println!(
        "  Entries: {} updated, {} deleted",
        summary.entries_upserted.to_string().cyan(),
        summary.entries_deleted.to_string().yellow()
    );
    if summary.binaries_removed > 0 {
        println!("  Removed locally: {}", summary.binaries_removed.to_string().yellow());
    }
    println!("  Time: {}", format_duration(truncate_secs(elapsed)).to_string().cyan());
    print_failures(&summary.failures);
}

/// Restore a directory; exits with 2 while binaries await hydration
async fn cmd_restore(repository: &Repository, options: RestoreOptions) -> anyhow::Result<ExitCode> {
    if !options.synchronize && !options.download {
        println!(
            "{} Nothing to do; pass {} and/or {}",
            "!".yellow().bold(),
            "--synchronize".yellow(),
            "--download".yellow()
        );
        return Ok(ExitCode::SUCCESS);
    }

    println!(
        "{} {}",
        "Restoring".blue().bold(),
        options.root.display().to_string().cyan()
    );

    let start = Instant::now();
    let pb = spinner("Restoring files...");
    let result = repository.restore(options).await;
    pb.finish_and_clear();
    let summary = result?;

    print_restore_summary(&summary, start.elapsed());
    Ok(if summary.is_complete() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    })
}

fn print_restore_summary(summary: &RestoreSummary, elapsed: Duration) {
    if let Some(version) = summary.version {
        println!(
            "{} Restored version {}",
            "✓".green().bold(),
            version.to_rfc3339().yellow().bold()
        );
    }
    println!(
        "  Pointers: {} created, {} removed",
        summary.pointers_created.to_string().cyan(),
        summary.pointers_deleted.to_string().cyan()
    );
    println!(
        "  Binaries: {} restored ({})",
        summary.binaries_restored.to_string().cyan(),
        format_bytes(summary.bytes_restored).cyan()
    );
    if summary.binaries_pending > 0 {
        println!(
            "  {} {} binaries waiting for hydration ({} new requests); run restore again later",
            "⏳".yellow(),
            summary.binaries_pending.to_string().yellow().bold(),
            summary.hydrations_requested
        );
    }
    println!("  Time: {}", format_duration(truncate_secs(elapsed)).to_string().cyan());
    print_failures(&summary.failures);
}

fn print_failures(failures: &[arius::ItemFailure]) {
    if failures.is_empty() {
        return;
    }
    println!("\n{} {} items failed:", "✗".red().bold(), failures.len());
    for failure in failures {
        println!("  {} {}", failure.relative_name.red(), failure.message.dimmed());
    }
}

fn cmd_versions(repository: &Repository) -> anyhow::Result<ExitCode> {
    let versions = repository.versions()?;
    if versions.is_empty() {
        println!("{}", "No versions yet".yellow());
        return Ok(ExitCode::SUCCESS);
    }

    println!("{}", "Versions:".blue().bold());
    for version in versions.iter().rev() {
        println!("  {}", version.to_rfc3339().yellow());
    }
    println!("\nTotal: {}", versions.len().to_string().cyan());
    Ok(ExitCode::SUCCESS)
}

fn cmd_ls(
    repository: &Repository,
    include_deleted: bool,
    point_in_time: Option<DateTime<Utc>>,
) -> anyhow::Result<ExitCode> {
    let entries = repository.entries(point_in_time, include_deleted)?;
    for entry in &entries {
        match entry.binary_hash {
            Some(hash) if !entry.is_deleted => {
                let length = repository
                    .db()
                    .binary_properties(&hash)?
                    .map(|p| format_bytes(p.original_length))
                    .unwrap_or_default();
                println!("  {} {} {:>10}", hash.short().yellow(), entry.relative_name, length.dimmed());
            }
            _ => println!("  {} {}", "deleted ".red(), entry.relative_name.dimmed()),
        }
    }
    println!("\nTotal: {} entries", entries.len().to_string().cyan());
    Ok(ExitCode::SUCCESS)
}

fn truncate_secs(elapsed: Duration) -> Duration {
    Duration::from_secs(elapsed.as_secs())
}
