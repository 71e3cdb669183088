//! coffer: encrypted incremental backups
//!
//! Commands:
//!   init                          - create or unlock the repository
//!   backup <name> <path>          - back up a directory as <name>
//!   snapshots [<name>]            - list backups and their snapshots
//!   restore <name> <dest>         - restore the latest (or a given) snapshot
//!   delete <name> <snapshot>      - delete one snapshot, keeping later ones whole
//!   prune <name>                  - apply the retention schedule
//!   wipe <name> --yes             - remove a backup and everything it stored
//!   usage [--days N]              - upload and storage history

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use secrecy::SecretString;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use coffer_core::config::{expand_tilde, CofferConfig};
use coffer_core::CofferError;
use coffer_engine::{BackupDir, BackupOutcome, BackupService, ProgressSink};
use coffer_storage::{build_from_core_config, Credentials, ObjectStore, RetryPolicy};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "coffer",
    version,
    about = "Encrypted incremental backups to object storage"
)]
struct Cli {
    /// Path to coffer.toml configuration file
    #[arg(long, short = 'c', env = "COFFER_CONFIG", default_value = "~/.config/coffer/coffer.toml")]
    config: PathBuf,

    /// Log level or filter (overrides [logging] level; RUST_LOG wins over both)
    #[arg(long, env = "COFFER_LOG")]
    log: Option<String>,

    /// Log output format (overrides [logging] format)
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the repository, or check the password against an existing one
    Init,

    /// Back up a directory
    ///
    /// An interrupted backup of the same name is resumed first.
    Backup {
        /// Backup name
        name: String,
        /// Directory to back up
        path: PathBuf,
    },

    /// List backups and their snapshots
    Snapshots {
        /// Only this backup
        name: Option<String>,
    },

    /// Restore a snapshot into a directory
    Restore {
        name: String,
        /// Destination directory
        dest: PathBuf,
        /// Snapshot to restore (default: latest)
        #[arg(long, short = 's')]
        snapshot: Option<String>,
        /// Only restore this path and what lies beneath it
        #[arg(long, short = 'p')]
        prefix: Option<String>,
    },

    /// Delete one snapshot
    Delete { name: String, snapshot: String },

    /// Delete snapshots outside the retention schedule
    Prune { name: String },

    /// Remove a backup and every object it stored
    Wipe {
        name: String,
        /// Confirm the wipe
        #[arg(long)]
        yes: bool,
    },

    /// Show upload and storage history
    Usage {
        /// Window in days
        #[arg(long, default_value_t = 30)]
        days: i64,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let config = CofferConfig::load(&config_path)
        .with_context(|| format!("loading config: {}", config_path.display()))?;

    let format = cli.log_format.unwrap_or(match config.logging.format.as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    });
    init_logging(cli.log.as_deref().unwrap_or(&config.logging.level), format);
    tracing::debug!(config = %config_path.display(), backend = %config.storage.backend, "config loaded");

    if let Commands::Wipe { yes: false, name } = &cli.command {
        anyhow::bail!("refusing to wipe {name} without --yes");
    }

    let service = open_service(&config).await?;

    let supervisor = service.supervisor().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() && supervisor.cancel_current() {
            eprintln!("\ncancelling, please wait...");
        }
    });

    match cli.command {
        Commands::Init => {
            println!("Repository ready ({} backend)", config.storage.backend);
            Ok(())
        }
        Commands::Backup { name, path } => cmd_backup(&service, &name, &path).await,
        Commands::Snapshots { name } => cmd_snapshots(&service, name.as_deref()).await,
        Commands::Restore {
            name,
            dest,
            snapshot,
            prefix,
        } => cmd_restore(&service, &name, &dest, snapshot.as_deref(), prefix).await,
        Commands::Delete { name, snapshot } => {
            let plan = service.delete_snapshot(&name, &snapshot).await?;
            println!(
                "Deleted {name}/{snapshot}: {} objects removed, {} moved forward",
                plan.delete_objs.len(),
                plan.rename_objs.len()
            );
            Ok(())
        }
        Commands::Prune { name } => {
            let pruned = service.prune(&name, Utc::now()).await?;
            if pruned.is_empty() {
                println!("Nothing to prune");
            }
            for snapshot in pruned {
                println!("  pruned {snapshot}");
            }
            Ok(())
        }
        Commands::Wipe { name, .. } => {
            let removed = service.wipe(&name).await?;
            println!("Wiped {name}: {removed} objects removed");
            Ok(())
        }
        Commands::Usage { days } => cmd_usage(&service, days),
    }
}

fn init_logging(level: &str, format: LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

// ── Repository access ─────────────────────────────────────────────────────────

fn read_password() -> Result<SecretString> {
    if let Ok(pw) = std::env::var("COFFER_PASSWORD") {
        return Ok(SecretString::from(pw));
    }
    let pw = rpassword::prompt_password("coffer password: ").context("reading password")?;
    Ok(SecretString::from(pw))
}

async fn open_service(config: &CofferConfig) -> Result<BackupService> {
    let creds = match config.storage.backend.as_str() {
        "s3" => Some(Credentials::from_env()?),
        _ => None,
    };
    let op = build_from_core_config(&config.storage, creds.as_ref())
        .context("building storage operator")?;
    let store = ObjectStore::new(op, RetryPolicy::from(&config.storage));
    let password = read_password()?;
    match BackupService::open(config, store, &password).await {
        Ok(service) => Ok(service),
        Err(CofferError::DecryptFailed) => anyhow::bail!("wrong password for this repository"),
        Err(e) => Err(e).context("opening repository"),
    }
}

// ── Progress display ──────────────────────────────────────────────────────────

struct BarSink(ProgressBar);

impl BarSink {
    fn new(prefix: &str) -> Self {
        let pb = ProgressBar::new(0);
        if let Ok(style) =
            ProgressStyle::with_template("{prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            pb.set_style(style.progress_chars("=>-"));
        }
        pb.set_prefix(prefix.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        Self(pb)
    }
}

impl ProgressSink for BarSink {
    fn report(&self, finished: u64, total: u64, message: &str) {
        self.0.set_length(total);
        self.0.set_position(finished);
        self.0.set_message(message.to_string());
    }
}

// ── `coffer backup` ───────────────────────────────────────────────────────────

async fn cmd_backup(service: &BackupService, name: &str, path: &Path) -> Result<()> {
    if !path.is_dir() {
        anyhow::bail!("not a directory: {}", path.display());
    }
    let bar = BarSink::new("backup");
    let outcome = service.backup(name, path, &bar).await;
    bar.0.finish_and_clear();

    match outcome {
        Ok(BackupOutcome::NoChanges) => println!("Nothing to back up in {}", path.display()),
        Ok(BackupOutcome::Completed(s)) => {
            println!("Backup complete:");
            println!("  snapshot: {}/{}", s.backup_name, s.snapshot_name);
            println!("  entries:  {}", s.entries);
            println!("  uploaded: {}", fmt_bytes(s.uploaded_bytes));
            if s.failed > 0 {
                println!("  failed:   {} (see log)", s.failed);
            }
            if s.resumed {
                println!("  (resumed an interrupted run)");
            }
        }
        Err(CofferError::Cancelled) => println!("Backup cancelled; nothing from this run was kept"),
        Err(e) => return Err(e).with_context(|| format!("backing up {}", path.display())),
    }
    Ok(())
}

// ── `coffer snapshots` ────────────────────────────────────────────────────────

async fn cmd_snapshots(service: &BackupService, name: Option<&str>) -> Result<()> {
    let dirs: BTreeMap<String, BackupDir> = match name {
        Some(name) => {
            let dir = service.backup_dir(name).await?;
            std::iter::once((name.to_string(), dir)).collect()
        }
        None => service.snapshots().await?,
    };
    if dirs.is_empty() {
        println!("No backups");
    }
    for (name, dir) in dirs {
        println!("{name}");
        for snap in &dir.snapshots {
            println!(
                "  {}  {} entries",
                snap.decrypted_name,
                snap.live_entries().count()
            );
        }
    }
    Ok(())
}

// ── `coffer restore` ──────────────────────────────────────────────────────────

async fn cmd_restore(
    service: &BackupService,
    name: &str,
    dest: &Path,
    snapshot: Option<&str>,
    prefix: Option<String>,
) -> Result<()> {
    let bar = BarSink::new("restore");
    let report = service.restore(name, snapshot, dest, prefix, &bar).await;
    bar.0.finish_and_clear();
    let report = report.with_context(|| format!("restoring {name} into {}", dest.display()))?;

    println!("Restore complete:");
    println!("  files: {} ({})", report.files, fmt_bytes(report.bytes));
    println!("  dirs:  {}", report.dirs);
    if !report.failures.is_empty() {
        println!("  failed: {}", report.failures.len());
        for (path, reason) in &report.failures {
            println!("    {path}: {reason}");
        }
    }
    Ok(())
}

// ── `coffer usage` ────────────────────────────────────────────────────────────

fn cmd_usage(service: &BackupService, days: i64) -> Result<()> {
    let samples = service.usage(Utc::now() - ChronoDuration::days(days));
    if samples.is_empty() {
        println!("No backups in the last {days} days");
    }
    for s in samples {
        println!(
            "{}  {:<20} uploaded {:>10}  stored {:>10}",
            s.at.format("%Y-%m-%d %H:%M"),
            s.backup_name,
            fmt_bytes(s.uploaded_bytes),
            fmt_bytes(s.stored_bytes)
        );
    }
    Ok(())
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
