//! Upward facade for the presentation layer
//!
//! One object tying the launcher, registry, event bus and mount manager
//! together. Every method returns immediately with a job snapshot or data;
//! the actual work happens on the per-job background threads, so the UI
//! thread never blocks on subprocess I/O.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::thread;
use std::time::Duration;

use crate::capabilities::Capabilities;
use crate::events::JobEvent;
use crate::jobs::registry::{JobFilter, JobRegistry};
use crate::jobs::{JobId, JobKind, JobRecord, MountInfo};
use crate::rclone::{MountManager, MountOptions, RcloneRunner};

/// Options for copy/move/sync operations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferOptions {
    /// Number of parallel file transfers
    pub transfers: Option<u32>,
    /// Number of parallel checkers
    pub checkers: Option<u32>,
    /// Per-file buffer size in MiB
    pub buffer_size_mib: Option<u32>,
    /// Upload chunk size in MiB (drive backends)
    pub chunk_size_mib: Option<u32>,
    /// Check all files before starting the transfer
    pub check_first: bool,
    /// Report what would change without changing it
    pub dry_run: bool,
    /// Additional raw flags appended verbatim
    pub extra_args: Vec<String>,
}

impl TransferOptions {
    /// Render the options as rclone command-line flags.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(transfers) = self.transfers {
            args.push("--transfers".to_string());
            args.push(transfers.to_string());
        }
        if let Some(checkers) = self.checkers {
            args.push("--checkers".to_string());
            args.push(checkers.to_string());
        }
        if let Some(buffer) = self.buffer_size_mib {
            args.push("--buffer-size".to_string());
            args.push(format!("{}M", buffer));
        }
        if let Some(chunk) = self.chunk_size_mib {
            args.push("--drive-chunk-size".to_string());
            args.push(format!("{}M", chunk));
        }
        if self.check_first {
            args.push("--check-first".to_string());
        }
        if self.dry_run {
            args.push("--dry-run".to_string());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

/// Orchestration core entry point.
///
/// Cloning shares the same registry, bus and mount records.
#[derive(Clone)]
pub struct RcloneManager {
    runner: RcloneRunner,
    registry: JobRegistry,
    mounts: MountManager,
    capabilities: Capabilities,
}

impl RcloneManager {
    /// Build the core from probed capabilities.
    ///
    /// A missing rclone binary is not an error here: launches will produce
    /// Failed jobs carrying `ExecutableNotFound`, giving the UI one
    /// decision point.
    pub fn new(capabilities: Capabilities) -> Self {
        let exe = capabilities
            .rclone_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("rclone"));
        let runner = RcloneRunner::new(exe);
        let registry = JobRegistry::new();
        let mounts = MountManager::new(runner.clone(), registry.clone());
        Self {
            runner,
            registry,
            mounts,
            capabilities,
        }
    }

    /// Use a specific rclone config file for all operations.
    pub fn with_config_file(mut self, path: impl AsRef<Path>) -> Self {
        self.runner = self.runner.with_config(path);
        self.mounts = MountManager::new(self.runner.clone(), self.registry.clone());
        self
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Subscribe to job state snapshots
    pub fn subscribe(&self) -> Receiver<JobEvent> {
        self.registry.subscribe()
    }

    /// Snapshots of all tracked jobs
    pub fn list_jobs(&self) -> Vec<JobRecord> {
        self.registry.list(JobFilter::default())
    }

    /// Snapshot of one job
    pub fn job(&self, id: JobId) -> Option<JobRecord> {
        self.registry.get(id)
    }

    /// Request cancellation; a no-op on already-terminal jobs.
    pub fn cancel_job(&self, id: JobId) -> Result<()> {
        self.registry.cancel(id)
    }

    /// Drop a job whose terminal status has been observed.
    pub fn remove_job(&self, id: JobId) -> Result<()> {
        self.registry.remove(id)
    }

    /// Start a copy/move/sync operation.
    pub fn start_transfer(
        &self,
        kind: JobKind,
        source: &str,
        dest: &str,
        options: &TransferOptions,
    ) -> Result<JobRecord> {
        let Some(verb) = kind.transfer_verb() else {
            bail!("{} is not a transfer operation", kind);
        };
        if source.trim().is_empty() {
            bail!("transfer source is empty");
        }
        if dest.trim().is_empty() {
            bail!("transfer destination is empty");
        }

        let mut args = vec![
            verb.to_string(),
            source.to_string(),
            dest.to_string(),
            "--progress".to_string(),
            "--stats".to_string(),
            "1s".to_string(),
        ];
        args.extend(options.to_args());

        Ok(self.runner.launch(kind, args, &self.registry))
    }

    /// Mount a remote at a local path.
    ///
    /// Rejected before any spawn if the filesystem driver is missing or
    /// the path is already owned by a live mount.
    pub fn start_mount(
        &self,
        remote: &str,
        mount_point: &Path,
        options: &MountOptions,
    ) -> Result<JobRecord> {
        if !self.capabilities.fuse_available {
            bail!(
                "FUSE is not available. Install it to enable mounting:\n\
                - Windows: winget install WinFsp.WinFsp\n\
                - Linux: sudo apt install fuse3\n\
                - macOS: brew install --cask macfuse"
            );
        }
        self.mounts.mount(remote, mount_point, options)
    }

    /// Unmount a mounted path; cleanup continues in the background.
    pub fn unmount(&self, mount_point: &Path) -> Result<JobRecord> {
        self.mounts.unmount(mount_point)
    }

    /// Live mount records
    pub fn mounts(&self) -> Vec<MountInfo> {
        self.mounts.mounts()
    }

    /// Verify file integrity of a path (checked against itself).
    pub fn check(&self, target: &str, extra_args: &[String]) -> JobRecord {
        let mut args = vec![
            "check".to_string(),
            target.to_string(),
            target.to_string(),
        ];
        args.extend(extra_args.iter().cloned());
        self.runner.launch(JobKind::Check, args, &self.registry)
    }

    /// Query the total size of a remote path.
    pub fn size_query(&self, target: &str) -> JobRecord {
        let args = vec![
            "size".to_string(),
            target.to_string(),
            "--json".to_string(),
        ];
        self.runner.launch(JobKind::SizeQuery, args, &self.registry)
    }

    /// Clear the VFS cache directory.
    ///
    /// Asks a running rclone rc server to forget its VFS state first (it is
    /// normal for none to be listening), then removes the cache directory's
    /// contents. Runs as a tracked job with no backing process.
    pub fn clean_cache(&self, cache_dir: &Path) -> JobRecord {
        let record = self
            .registry
            .insert_local(JobKind::CacheClean, vec!["rc".to_string(), "vfs/forget".to_string()]);

        let id = record.id;
        let runner = self.runner.clone();
        let registry = self.registry.clone();
        let cache_dir = cache_dir.to_path_buf();
        thread::spawn(move || {
            if !cache_dir.exists() {
                registry.finish_local(
                    id,
                    Err(format!("cache directory does not exist: {:?}", cache_dir)),
                );
                return;
            }

            match runner.run_with_timeout(&["rc", "vfs/forget"], Some(Duration::from_secs(10))) {
                Ok(output) if output.success() => {
                    tracing::info!("{}: rclone rc vfs/forget accepted", id);
                }
                Ok(_) | Err(_) => {
                    tracing::debug!("{}: no rclone rc server listening, cleaning manually", id);
                }
            }

            let (files, dirs) = remove_dir_contents(&cache_dir);
            registry.finish_local(
                id,
                Ok(format!("removed {} files and {} directories", files, dirs)),
            );
        });

        record
    }

    /// List configured remotes (short blocking call).
    pub fn list_remotes(&self) -> Result<Vec<String>> {
        self.runner.list_remotes()
    }

    /// rclone version string (short blocking call).
    pub fn version(&self) -> Result<String> {
        self.runner
            .version()
            .context("failed to query rclone version")
    }
}

/// Remove everything under `dir`, keeping `dir` itself.
///
/// Individual failures are skipped; cache entries can be transient.
fn remove_dir_contents(dir: &Path) -> (usize, usize) {
    let mut files = 0;
    let mut dirs = 0;
    let Ok(entries) = std::fs::read_dir(dir) else {
        return (files, dirs);
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            let (f, d) = remove_dir_contents(&path);
            files += f;
            dirs += d;
            if std::fs::remove_dir(&path).is_ok() {
                dirs += 1;
            }
        } else if std::fs::remove_file(&path).is_ok() {
            files += 1;
        }
    }
    (files, dirs)
}
