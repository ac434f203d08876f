//! Rclone mount lifecycle
//!
//! Mounts remotes as local file systems via `rclone mount` and tracks each
//! mount point through its lifecycle: Unmounted → Mounting → Active →
//! (Unmounting → Unmounted | Stale). Supports Windows (via WinFsp), Linux
//! (via FUSE), and macOS (via macFUSE).
//!
//! A mount only becomes Active after a positive probe of the mount point
//! within a bounded timeout. A background health thread detects staleness:
//! either the probe failing while the backing process is still alive, or
//! the process exiting without an unmount having been requested (the crash
//! case, which the UI warns about). Staleness never auto-unmounts, since
//! forcibly detaching can lose data for in-flight writers.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::jobs::registry::JobRegistry;
use crate::jobs::{ErrorKind, JobError, JobId, JobRecord, MountHealth, MountInfo};
use crate::rclone::process::RcloneRunner;

/// How long a new mount may take to become listable
const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(10);
/// Poll interval while waiting for mount confirmation
const CONFIRM_POLL_INTERVAL: Duration = Duration::from_millis(200);
/// Interval between health probes of active mounts
const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(2);
/// How long unmount waits for the backing process to exit
const UNMOUNT_WAIT_TIMEOUT: Duration = Duration::from_secs(15);

/// VFS and mount options for `rclone mount`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountOptions {
    /// Mount read-only
    pub read_only: bool,
    /// Allow other users to access the mount (requires fuse.conf setup)
    pub allow_other: bool,
    /// VFS cache mode: off, minimal, writes, full
    pub vfs_cache_mode: Option<String>,
    /// Directory for the VFS cache
    pub cache_dir: Option<PathBuf>,
    /// Maximum VFS cache size in MiB
    pub cache_max_size_mib: Option<u64>,
    /// How long to cache directory listings, e.g. "30m"
    pub dir_cache_time: Option<String>,
    /// Volume name (WinFsp)
    pub volname: Option<String>,
    /// Additional raw flags appended verbatim
    pub extra_args: Vec<String>,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            allow_other: false,
            vfs_cache_mode: Some("writes".to_string()),
            cache_dir: None,
            cache_max_size_mib: None,
            dir_cache_time: None,
            volname: None,
            extra_args: Vec::new(),
        }
    }
}

impl MountOptions {
    /// Render the options as rclone command-line flags.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.read_only {
            args.push("--read-only".to_string());
        }
        if self.allow_other {
            args.push("--allow-other".to_string());
        }
        if let Some(ref mode) = self.vfs_cache_mode {
            args.push("--vfs-cache-mode".to_string());
            args.push(mode.clone());
        }
        if let Some(ref dir) = self.cache_dir {
            args.push("--cache-dir".to_string());
            args.push(dir.to_string_lossy().into_owned());
        }
        if let Some(size) = self.cache_max_size_mib {
            args.push("--vfs-cache-max-size".to_string());
            args.push(format!("{}M", size));
        }
        if let Some(ref time) = self.dir_cache_time {
            args.push("--dir-cache-time".to_string());
            args.push(time.clone());
        }
        if let Some(ref name) = self.volname {
            args.push("--volname".to_string());
            args.push(name.clone());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

struct MountEntry {
    job: JobId,
    remote: String,
    unmount_requested: Arc<AtomicBool>,
}

/// Mount manager for handling multiple mounts
#[derive(Clone)]
pub struct MountManager {
    runner: RcloneRunner,
    registry: JobRegistry,
    records: Arc<Mutex<HashMap<PathBuf, MountEntry>>>,
    health_started: Arc<AtomicBool>,
    confirm_timeout: Duration,
    probe_interval: Duration,
}

impl MountManager {
    /// Create a new mount manager
    pub fn new(runner: RcloneRunner, registry: JobRegistry) -> Self {
        Self {
            runner,
            registry,
            records: Arc::new(Mutex::new(HashMap::new())),
            health_started: Arc::new(AtomicBool::new(false)),
            confirm_timeout: DEFAULT_CONFIRM_TIMEOUT,
            probe_interval: DEFAULT_PROBE_INTERVAL,
        }
    }

    /// Override the mount confirmation timeout
    pub fn with_confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout = timeout;
        self
    }

    /// Override the health probe interval
    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    /// Check if FUSE/WinFsp is available
    pub fn check_fuse_available() -> bool {
        #[cfg(windows)]
        {
            // Check for WinFsp
            let winfsp = PathBuf::from(r"C:\Program Files (x86)\WinFsp\bin\winfsp-x64.dll");
            let winfsp_alt = PathBuf::from(r"C:\Program Files\WinFsp\bin\winfsp-x64.dll");
            winfsp.exists() || winfsp_alt.exists()
        }

        #[cfg(target_os = "linux")]
        {
            // Check for FUSE
            PathBuf::from("/dev/fuse").exists()
        }

        #[cfg(target_os = "macos")]
        {
            // Check for macFUSE
            let macfuse = PathBuf::from("/Library/Filesystems/macfuse.fs");
            let osxfuse = PathBuf::from("/Library/Filesystems/osxfuse.fs");
            macfuse.exists() || osxfuse.exists()
        }

        #[cfg(not(any(windows, target_os = "linux", target_os = "macos")))]
        {
            false
        }
    }

    /// Mount a remote at the given mount point.
    ///
    /// The mount point must not already be owned by a live mount record;
    /// a duplicate request is rejected here, before any subprocess is
    /// spawned. On success the returned job is Running with health
    /// Mounting; a confirmation thread promotes it to Active once the
    /// mount point probes as usable, or fails the job on timeout.
    pub fn mount(
        &self,
        remote: &str,
        mount_point: &Path,
        options: &MountOptions,
    ) -> Result<JobRecord> {
        let remote = normalize_remote(remote);
        let mount_point = mount_point.to_path_buf();

        // Reserve the path before anything else so a concurrent request
        // cannot race past the duplicate check.
        self.claim_mount_path(&mount_point, &remote)?;

        std::fs::create_dir_all(&mount_point)
            .with_context(|| format!("Failed to create mount point: {:?}", mount_point))
            .map_err(|e| {
                self.release_mount_path(&mount_point);
                e
            })?;

        let option_args = options.to_args();
        let mut args = vec![
            "mount".to_string(),
            remote.clone(),
            mount_point.to_string_lossy().into_owned(),
        ];
        args.extend(option_args.iter().cloned());

        let record = self.runner.launch(crate::jobs::JobKind::Mount, args, &self.registry);
        if record.status.is_terminal() {
            // Resolve/spawn failure; the job already carries the error.
            self.release_mount_path(&mount_point);
            return Ok(record);
        }

        self.registry.set_mount_info(
            record.id,
            MountInfo {
                remote: remote.clone(),
                mount_point: mount_point.clone(),
                options: option_args,
                health: MountHealth::Mounting,
            },
        );

        {
            let mut records = self.records.lock().expect("mount records lock poisoned");
            if let Some(entry) = records.get_mut(&mount_point) {
                entry.job = record.id;
            }
        }

        self.start_health_thread();
        self.spawn_confirm_thread(record.id, mount_point);

        Ok(self.registry.get(record.id).unwrap_or(record))
    }

    /// Unmount the mount at the given path.
    ///
    /// Marks the record Unmounting, terminates the backing process, issues
    /// the platform unmount command, and only reports Unmounted once the
    /// path is verified to no longer be a mount point. Returns the mount
    /// job's current snapshot immediately; the cleanup itself runs in the
    /// background.
    pub fn unmount(&self, mount_point: &Path) -> Result<JobRecord> {
        let (job, unmount_requested) = {
            let records = self.records.lock().expect("mount records lock poisoned");
            let Some(entry) = records.get(mount_point) else {
                bail!("no mount at {:?}", mount_point);
            };
            (entry.job, entry.unmount_requested.clone())
        };

        unmount_requested.store(true, Ordering::SeqCst);
        self.registry.set_mount_health(job, MountHealth::Unmounting);
        // Graceful stop: the mount job completes as Succeeded, not Cancelled.
        self.registry.request_stop(job);

        let manager = self.clone();
        let path = mount_point.to_path_buf();
        thread::spawn(move || manager.finish_unmount(job, &path));

        self.registry
            .get(job)
            .context("mount job disappeared from registry")
    }

    /// Snapshot of all live mount records
    pub fn mounts(&self) -> Vec<MountInfo> {
        let records = self.records.lock().expect("mount records lock poisoned");
        records
            .values()
            .filter_map(|entry| self.registry.get(entry.job).and_then(|r| r.mount))
            .collect()
    }

    /// Whether a live mount record owns this path
    pub fn is_path_claimed(&self, mount_point: &Path) -> bool {
        self.records
            .lock()
            .expect("mount records lock poisoned")
            .contains_key(mount_point)
    }

    /// Reserve a mount path, rejecting duplicates before any spawn.
    ///
    /// The placeholder entry (job id 0) is replaced once the launch has
    /// produced a real job, or released if the launch fails.
    fn claim_mount_path(&self, mount_point: &Path, remote: &str) -> Result<()> {
        let mut records = self.records.lock().expect("mount records lock poisoned");
        if let Some(entry) = records.get(mount_point) {
            bail!(
                "mount point {:?} is already in use by {} ({})",
                mount_point,
                entry.remote,
                entry.job
            );
        }
        records.insert(
            mount_point.to_path_buf(),
            MountEntry {
                job: JobId::from_raw(0),
                remote: remote.to_string(),
                unmount_requested: Arc::new(AtomicBool::new(false)),
            },
        );
        Ok(())
    }

    fn release_mount_path(&self, mount_point: &Path) {
        self.records
            .lock()
            .expect("mount records lock poisoned")
            .remove(mount_point);
    }

    /// Wait for the mount point to become usable, then promote to Active.
    fn spawn_confirm_thread(&self, job: JobId, mount_point: PathBuf) {
        let manager = self.clone();
        let timeout = self.confirm_timeout;
        thread::spawn(move || {
            let start = Instant::now();
            loop {
                if manager.registry.is_terminal(job) {
                    // The process died while Mounting (bad remote, FUSE
                    // refusal); the completion path already recorded the
                    // failure. Clean up what was created.
                    manager.cleanup_mount_point(job, &mount_point);
                    return;
                }
                if probe_mount_point(&mount_point) {
                    tracing::info!("{}: mount at {:?} confirmed active", job, mount_point);
                    manager.registry.set_mount_health(job, MountHealth::Active);
                    return;
                }
                if start.elapsed() >= timeout {
                    break;
                }
                thread::sleep(CONFIRM_POLL_INTERVAL);
            }

            let kind = if mount_point.exists() {
                ErrorKind::MountTimeout
            } else {
                ErrorKind::MountConfirmFailed
            };
            tracing::warn!("{}: mount point {:?} not usable within {:?}", job, mount_point, timeout);
            manager.registry.fail(
                job,
                JobError::new(
                    job,
                    kind,
                    format!("mount point {:?} did not become usable", mount_point),
                ),
            );
            // Force-unmount the partially created mount as cleanup.
            manager.registry.request_stop(job);
            platform_unmount(&mount_point);
            manager.cleanup_mount_point(job, &mount_point);
        });
    }

    /// Background cleanup after an unmount request.
    fn finish_unmount(&self, job: JobId, mount_point: &Path) {
        // The process's own exit is the authoritative signal.
        let deadline = Instant::now() + UNMOUNT_WAIT_TIMEOUT;
        while !self.registry.is_terminal(job) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(100));
        }

        platform_unmount(mount_point);

        // Verify the path is actually detached before reporting Unmounted.
        let verify_deadline = Instant::now() + Duration::from_secs(5);
        while is_mount_point(mount_point) && Instant::now() < verify_deadline {
            thread::sleep(Duration::from_millis(200));
            platform_unmount(mount_point);
        }

        if is_mount_point(mount_point) {
            tracing::warn!("{}: {:?} still appears mounted after unmount", job, mount_point);
            self.registry.set_mount_health(job, MountHealth::Stale);
            return;
        }

        self.cleanup_mount_point(job, mount_point);
        tracing::info!("{}: unmounted {:?}", job, mount_point);
    }

    fn cleanup_mount_point(&self, job: JobId, mount_point: &Path) {
        // Free the path before announcing Unmounted, so an observer of the
        // transition can immediately mount there again.
        self.release_mount_path(mount_point);
        // Remove the directory we created, if empty.
        let _ = std::fs::remove_dir(mount_point);
        self.registry.set_mount_health(job, MountHealth::Unmounted);
    }

    /// Start the periodic health probe thread on first use.
    fn start_health_thread(&self) {
        if self.health_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let manager = self.clone();
        thread::spawn(move || loop {
            thread::sleep(manager.probe_interval);
            manager.probe_active_mounts();
        });
    }

    /// One pass over all Active mounts, demoting unhealthy ones to Stale.
    fn probe_active_mounts(&self) {
        let snapshot: Vec<(PathBuf, JobId, bool)> = {
            let records = self.records.lock().expect("mount records lock poisoned");
            records
                .iter()
                .map(|(path, entry)| {
                    (
                        path.clone(),
                        entry.job,
                        entry.unmount_requested.load(Ordering::SeqCst),
                    )
                })
                .collect()
        };

        for (path, job, unmount_requested) in snapshot {
            if unmount_requested {
                continue;
            }
            let Some(record) = self.registry.get(job) else {
                continue;
            };
            let Some(mount) = record.mount.as_ref() else {
                continue;
            };
            if mount.health != MountHealth::Active {
                continue;
            }

            if record.status.is_terminal() {
                // Backing process gone without an unmount request: the
                // mount point still nominally exists but nothing serves it.
                tracing::warn!(
                    "{}: mount process for {:?} exited unexpectedly, marking stale",
                    job,
                    path
                );
                self.registry.set_mount_health(job, MountHealth::Stale);
            } else if !probe_mount_point(&path) {
                tracing::warn!("{}: mount at {:?} stopped responding, marking stale", job, path);
                self.registry.set_mount_health(job, MountHealth::Stale);
            }
        }
    }
}

/// A single usability probe: the mount point is listable.
fn probe_mount_point(mount_point: &Path) -> bool {
    mount_point.read_dir().is_ok()
}

/// Ensure the remote spec has its `:` separator, e.g. `gdrive` → `gdrive:`.
fn normalize_remote(remote: &str) -> String {
    if remote.contains(':') {
        remote.to_string()
    } else {
        format!("{}:", remote)
    }
}

/// Issue the platform-specific unmount command, best effort.
fn platform_unmount(mount_point: &Path) {
    #[cfg(target_os = "linux")]
    {
        let _ = std::process::Command::new("fusermount")
            .args(["-u", mount_point.to_str().unwrap_or("")])
            .output();
    }

    #[cfg(target_os = "macos")]
    {
        let _ = std::process::Command::new("umount")
            .arg(mount_point)
            .output();
    }

    #[cfg(windows)]
    {
        // WinFsp releases the mount when the rclone process exits; there is
        // no separate unmount command to run.
        let _ = mount_point;
    }

    #[cfg(not(any(windows, target_os = "linux", target_os = "macos")))]
    {
        let _ = mount_point;
    }
}

/// Whether the path is currently a mount point.
#[cfg(target_os = "linux")]
fn is_mount_point(path: &Path) -> bool {
    let Ok(mounts) = std::fs::read_to_string("/proc/self/mounts") else {
        return false;
    };
    let target = path.to_string_lossy();
    // /proc/self/mounts octal-escapes spaces in mount targets.
    let escaped = target.replace(' ', "\\040");
    mounts.lines().any(|line| {
        line.split_whitespace()
            .nth(1)
            .map_or(false, |field| field == target || field == escaped)
    })
}

/// Whether the path is currently a mount point.
///
/// Without a mount table to consult, rely on the backing process having
/// been terminated and the unmount command having run.
#[cfg(not(target_os = "linux"))]
fn is_mount_point(_path: &Path) -> bool {
    false
}
