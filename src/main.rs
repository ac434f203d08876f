//! rclone-manager command-line driver
//!
//! Thin shell over the orchestration core: probes the environment, starts
//! one operation, and renders progress events until the job reaches a
//! terminal state. Ctrl-C cancels the active job (or unmounts the active
//! mount) instead of abandoning the subprocess.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use rclone_manager::capabilities::Capabilities;
use rclone_manager::config::AppConfig;
use rclone_manager::events::JobEvent;
use rclone_manager::jobs::{JobId, JobKind, JobRecord, JobStatus, MountHealth};
use rclone_manager::manager::{RcloneManager, TransferOptions};
use rclone_manager::rclone::MountOptions;
use rclone_manager::utils::format::{format_bytes, format_eta, format_rate};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match cli.config {
        Some(ref path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    };

    let configured_path = cli.rclone_path.clone().or_else(|| config.rclone_path.clone());
    let capabilities = Capabilities::probe(configured_path.as_deref());
    let manager = RcloneManager::new(capabilities.clone());

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = interrupted.clone();
        ctrlc::set_handler(move || {
            interrupted.store(true, Ordering::SeqCst);
        })
        .context("failed to install Ctrl-C handler")?;
    }

    match cli.command {
        Command::Capabilities => {
            match &capabilities.rclone_path {
                Some(path) => println!("rclone: {:?}", path),
                None => println!("rclone: NOT FOUND"),
            }
            if let Some(version) = &capabilities.rclone_version {
                println!("version: {}", version);
            }
            println!(
                "FUSE/WinFsp: {}",
                if capabilities.fuse_available {
                    "installed (mount available)"
                } else {
                    "NOT installed (mount will not work)"
                }
            );
            Ok(())
        }
        Command::Version => {
            println!("{}", manager.version()?);
            Ok(())
        }
        Command::Remotes => {
            for remote in manager.list_remotes()? {
                println!("{}", remote);
            }
            Ok(())
        }
        Command::Copy { ref source, ref dest, ref transfer } => {
            run_transfer(&manager, &config, JobKind::Copy, source, dest, transfer, &interrupted)
        }
        Command::Move { ref source, ref dest, ref transfer } => {
            run_transfer(&manager, &config, JobKind::Move, source, dest, transfer, &interrupted)
        }
        Command::Sync { ref source, ref dest, ref transfer } => {
            run_transfer(&manager, &config, JobKind::Sync, source, dest, transfer, &interrupted)
        }
        Command::Check { ref target } => {
            let events = manager.subscribe();
            let record = manager.check(target, &[]);
            finish(watch_job(&manager, events, record.id, &interrupted)?)
        }
        Command::Size { ref target } => {
            let events = manager.subscribe();
            let record = manager.size_query(target);
            let record = watch_job(&manager, events, record.id, &interrupted)?;
            if let Some(ref message) = record.message {
                println!("{}", message);
            }
            finish(record)
        }
        Command::CacheClean { ref dir } => {
            let cache_dir = dir
                .clone()
                .or_else(|| config.effective_cache_dir())
                .context("no cache directory configured")?;
            let events = manager.subscribe();
            let record = manager.clean_cache(&cache_dir);
            let record = watch_job(&manager, events, record.id, &interrupted)?;
            if let Some(ref message) = record.message {
                println!("{}", message);
            }
            finish(record)
        }
        Command::Mount {
            ref remote,
            ref mount_point,
            read_only,
            allow_other,
            ref vfs_cache_mode,
        } => {
            let mut options = config.last_mount.clone().unwrap_or_default();
            options.read_only = read_only;
            options.allow_other = allow_other;
            if vfs_cache_mode.is_some() {
                options.vfs_cache_mode = vfs_cache_mode.clone();
            }
            if options.cache_dir.is_none() {
                options.cache_dir = config.effective_cache_dir();
            }
            run_mount(&manager, remote, mount_point, &options, &interrupted)
        }
        Command::Unmount { ref mount_point } => {
            let record = manager.unmount(mount_point)?;
            wait_for_health(&manager, record.id, MountHealth::Unmounted, Duration::from_secs(30))?;
            println!("unmounted {:?}", mount_point);
            Ok(())
        }
    }
}

fn run_transfer(
    manager: &RcloneManager,
    config: &AppConfig,
    kind: JobKind,
    source: &str,
    dest: &str,
    args: &TransferArgs,
    interrupted: &AtomicBool,
) -> Result<()> {
    let options = args.to_options(config.last_transfer.clone().unwrap_or_default());

    // Remember the chosen options for the next run, best effort.
    let mut updated = config.clone();
    updated.last_transfer = Some(options.clone());
    let _ = updated.save();

    let events = manager.subscribe();
    let record = manager.start_transfer(kind, source, dest, &options)?;
    println!("{}: {} {} -> {}", record.id, kind, source, dest);

    finish(watch_job(manager, events, record.id, interrupted)?)
}

fn run_mount(
    manager: &RcloneManager,
    remote: &str,
    mount_point: &PathBuf,
    options: &MountOptions,
    interrupted: &AtomicBool,
) -> Result<()> {
    let record = manager.start_mount(remote, mount_point, options)?;
    if record.status.is_terminal() {
        return finish(record);
    }
    println!("{}: mounting {} at {:?}", record.id, remote, mount_point);

    wait_for_health(manager, record.id, MountHealth::Active, Duration::from_secs(30))?;
    println!("mounted; press Ctrl-C to unmount");

    loop {
        if interrupted.load(Ordering::SeqCst) {
            println!("\nunmounting {:?}...", mount_point);
            manager.unmount(mount_point)?;
            wait_for_health(manager, record.id, MountHealth::Unmounted, Duration::from_secs(30))?;
            println!("unmounted");
            return Ok(());
        }

        if let Some(current) = manager.job(record.id) {
            if let Some(mount) = current.mount.as_ref() {
                if mount.health == MountHealth::Stale {
                    eprintln!(
                        "warning: mount at {:?} has gone stale (backing process exited); \
                         run `unmount` to clean it up",
                        mount_point
                    );
                    return finish(current);
                }
            }
        }
        std::thread::sleep(Duration::from_millis(200));
    }
}

/// Drain events for one job until it reaches a terminal state, rendering
/// progress along the way. Ctrl-C requests cancellation once and keeps
/// waiting for the process's own exit.
fn watch_job(
    manager: &RcloneManager,
    events: Receiver<JobEvent>,
    id: JobId,
    interrupted: &AtomicBool,
) -> Result<JobRecord> {
    let mut cancel_sent = false;
    loop {
        if interrupted.load(Ordering::SeqCst) && !cancel_sent {
            eprintln!("\ncancelling {}...", id);
            let _ = manager.cancel_job(id);
            cancel_sent = true;
        }

        match events.recv_timeout(Duration::from_millis(250)) {
            Ok(event) if event.job.id == id => {
                render_progress(&event.job);
                if event.job.status.is_terminal() {
                    println!();
                    return Ok(event.job);
                }
            }
            Ok(_) => {}
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                let Some(record) = manager.job(id) else {
                    bail!("job {} disappeared from the registry", id);
                };
                if record.status.is_terminal() {
                    println!();
                    return Ok(record);
                }
            }
        }
    }
}

fn render_progress(record: &JobRecord) {
    let Some(progress) = record.progress.as_ref() else {
        return;
    };
    let total = match progress.total_bytes {
        Some(total) => format_bytes(total as f64),
        None => "?".to_string(),
    };
    let percent = progress
        .percent()
        .map(|p| format!("{}%", p))
        .unwrap_or_else(|| "-".to_string());
    print!(
        "\r{} / {} ({}), {}, ETA {}        ",
        format_bytes(progress.bytes as f64),
        total,
        percent,
        format_rate(progress.rate),
        format_eta(progress.eta),
    );
    let _ = std::io::stdout().flush();
}

fn wait_for_health(
    manager: &RcloneManager,
    id: JobId,
    wanted: MountHealth,
    timeout: Duration,
) -> Result<()> {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        let record = manager.job(id).context("mount job disappeared")?;
        if let Some(mount) = record.mount.as_ref() {
            if mount.health == wanted {
                return Ok(());
            }
        }
        if record.status == JobStatus::Failed && wanted == MountHealth::Active {
            let detail = record
                .error
                .map(|e| e.message)
                .unwrap_or_else(|| "mount failed".to_string());
            bail!("{}", detail);
        }
        if std::time::Instant::now() >= deadline {
            bail!("timed out waiting for mount to become {:?}", wanted);
        }
        std::thread::sleep(Duration::from_millis(200));
    }
}

/// Report the terminal job and set the process exit code.
fn finish(record: JobRecord) -> Result<()> {
    match record.status {
        JobStatus::Succeeded => {
            println!("{}: succeeded", record.id);
            Ok(())
        }
        JobStatus::Cancelled => {
            println!("{}: cancelled", record.id);
            Ok(())
        }
        _ => {
            if let Some(error) = record.error {
                eprintln!("{}: failed ({:?}): {}", record.id, error.kind, error.message);
            } else {
                eprintln!("{}: failed", record.id);
            }
            std::process::exit(1);
        }
    }
}

/// CLI arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Desktop front-end core for rclone")]
struct Cli {
    /// Path to the rclone executable (overrides config and discovery)
    #[arg(long, global = true)]
    rclone_path: Option<PathBuf>,

    /// Path to the application config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Report probed environment capabilities
    Capabilities,
    /// Show the rclone version
    Version,
    /// List configured remotes
    Remotes,
    /// Copy files from source to destination
    Copy {
        source: String,
        dest: String,
        #[command(flatten)]
        transfer: TransferArgs,
    },
    /// Move files from source to destination
    Move {
        source: String,
        dest: String,
        #[command(flatten)]
        transfer: TransferArgs,
    },
    /// Make destination identical to source (may delete files)
    Sync {
        source: String,
        dest: String,
        #[command(flatten)]
        transfer: TransferArgs,
    },
    /// Verify file integrity of a path
    Check { target: String },
    /// Query the total size of a remote path
    Size { target: String },
    /// Clear the VFS cache directory
    CacheClean {
        /// Cache directory (defaults to the configured one)
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Mount a remote at a local path until Ctrl-C
    Mount {
        /// Remote spec, e.g. gdrive: or gdrive:photos
        remote: String,
        mount_point: PathBuf,
        #[arg(long, default_value_t = false)]
        read_only: bool,
        #[arg(long, default_value_t = false)]
        allow_other: bool,
        /// VFS cache mode: off, minimal, writes, full
        #[arg(long)]
        vfs_cache_mode: Option<String>,
    },
    /// Unmount a mounted path
    Unmount { mount_point: PathBuf },
}

/// Transfer tuning flags shared by copy/move/sync
#[derive(Args, Debug)]
struct TransferArgs {
    /// Number of parallel file transfers
    #[arg(long)]
    transfers: Option<u32>,
    /// Number of parallel checkers
    #[arg(long)]
    checkers: Option<u32>,
    /// Per-file buffer size in MiB
    #[arg(long)]
    buffer_size: Option<u32>,
    /// Upload chunk size in MiB
    #[arg(long)]
    chunk_size: Option<u32>,
    /// Check all files before starting
    #[arg(long, default_value_t = false)]
    check_first: bool,
    /// Report what would change without changing it
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

impl TransferArgs {
    /// Overlay explicit flags onto the remembered defaults.
    fn to_options(&self, mut base: TransferOptions) -> TransferOptions {
        if self.transfers.is_some() {
            base.transfers = self.transfers;
        }
        if self.checkers.is_some() {
            base.checkers = self.checkers;
        }
        if self.buffer_size.is_some() {
            base.buffer_size_mib = self.buffer_size;
        }
        if self.chunk_size.is_some() {
            base.chunk_size_mib = self.chunk_size;
        }
        if self.check_first {
            base.check_first = true;
        }
        if self.dry_run {
            base.dry_run = true;
        }
        base
    }
}
