//! Job tracking types
//!
//! Data model for tracked rclone invocations: identifiers, kinds, status,
//! live transfer progress, mount state and the error taxonomy. The registry
//! that owns live jobs lives in [`registry`]; the per-job monitoring threads
//! live in [`monitor`].

pub mod monitor;
pub mod registry;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::rclone::parser::StatsUpdate;

/// Opaque unique token identifying one tracked rclone invocation.
///
/// Allocated by the [`registry::JobRegistry`]; unique for the lifetime of
/// the registry that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(u64);

impl JobId {
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Kind of rclone operation a job represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobKind {
    Mount,
    Copy,
    Move,
    Sync,
    Check,
    CacheClean,
    SizeQuery,
}

impl JobKind {
    /// rclone subcommand for transfer kinds
    pub fn transfer_verb(&self) -> Option<&'static str> {
        match self {
            JobKind::Copy => Some("copy"),
            JobKind::Move => Some("move"),
            JobKind::Sync => Some("sync"),
            _ => None,
        }
    }

    pub fn is_transfer(&self) -> bool {
        self.transfer_verb().is_some()
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobKind::Mount => "mount",
            JobKind::Copy => "copy",
            JobKind::Move => "move",
            JobKind::Sync => "sync",
            JobKind::Check => "check",
            JobKind::CacheClean => "cache-clean",
            JobKind::SizeQuery => "size-query",
        };
        f.write_str(name)
    }
}

/// Lifecycle status of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Terminal states accept no further mutation.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Live progress of a Copy/Move/Sync job, built up from parsed stats lines.
///
/// `bytes` is monotonically non-decreasing while the job is Running and
/// frozen once the job leaves Running. A malformed stats line never resets
/// a field that already holds a known value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransferProgress {
    /// Bytes transferred so far
    pub bytes: u64,
    /// Total bytes, when rclone knows it
    pub total_bytes: Option<u64>,
    /// Current transfer rate in bytes per second
    pub rate: f64,
    /// Estimated time remaining
    pub eta: Option<Duration>,
    /// Files completed
    pub files_done: u64,
    /// Total files, when known
    pub files_total: Option<u64>,
    /// File currently being transferred
    pub current_file: Option<String>,
}

impl TransferProgress {
    /// Files still to transfer, when the total is known.
    pub fn files_remaining(&self) -> Option<u64> {
        self.files_total.map(|t| t.saturating_sub(self.files_done))
    }

    /// Percentage complete by bytes (0-100), when the total is known.
    pub fn percent(&self) -> Option<u8> {
        match self.total_bytes {
            Some(total) if total > 0 => {
                Some(((self.bytes as f64 / total as f64) * 100.0).min(100.0) as u8)
            }
            _ => None,
        }
    }

    /// Merge a parsed stats update field by field.
    ///
    /// Absent fields keep their previous value, and `bytes` never moves
    /// backwards, so a malformed or partially parsed line cannot make a
    /// progress display regress.
    pub fn apply(&mut self, update: &StatsUpdate) {
        if let Some(bytes) = update.bytes {
            if bytes >= self.bytes {
                self.bytes = bytes;
            }
        }
        if let Some(total) = update.total_bytes {
            self.total_bytes = Some(total);
        }
        if let Some(rate) = update.rate {
            self.rate = rate;
        }
        if let Some(eta) = update.eta {
            self.eta = Some(eta);
        }
        if let Some(done) = update.files_done {
            self.files_done = done;
        }
        if let Some(total) = update.files_total {
            self.files_total = Some(total);
        }
    }
}

/// Health of a mount point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MountHealth {
    Mounting,
    Active,
    Stale,
    Unmounting,
    Unmounted,
}

/// Mount state attached to a Mount job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountInfo {
    /// Remote spec, e.g. `gdrive:photos`
    pub remote: String,
    /// Local mount point
    pub mount_point: PathBuf,
    /// Rendered mount option flags
    pub options: Vec<String>,
    pub health: MountHealth,
}

/// Error taxonomy for job failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// rclone executable could not be resolved
    ExecutableNotFound,
    /// Process could not be spawned (permissions, resource limits)
    SpawnFailed,
    /// Output line could not be parsed; diagnostic only, never escalates
    ParseDegraded,
    /// Mount point did not become usable within the confirmation timeout
    MountTimeout,
    /// Mount point probe failed during confirmation
    MountConfirmFailed,
    /// Process exited unexpectedly while Active/Running
    ProcessCrashed,
    /// Non-zero exit with parsed error detail
    TransferFailed,
    /// User-initiated cancellation; not an error condition
    Cancelled,
}

/// Error record attached to a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub job: JobId,
    pub kind: ErrorKind,
    pub message: String,
    pub recoverable: bool,
}

impl JobError {
    pub fn new(job: JobId, kind: ErrorKind, message: impl Into<String>) -> Self {
        let recoverable = matches!(kind, ErrorKind::ParseDegraded | ErrorKind::Cancelled);
        Self {
            job,
            kind,
            message: message.into(),
            recoverable,
        }
    }
}

/// Snapshot of one tracked job.
///
/// The registry owns the live record; everything handed out is a clone, so
/// the presentation layer can hold or drop snapshots freely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub kind: JobKind,
    /// Arguments the rclone process was (or would have been) started with
    pub args: Vec<String>,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Verbatim process exit code, once the process has exited
    pub exit_code: Option<i32>,
    /// Present on Copy/Move/Sync jobs
    pub progress: Option<TransferProgress>,
    /// Present on Mount jobs
    pub mount: Option<MountInfo>,
    pub error: Option<JobError>,
    /// Human-readable result summary (e.g. size query output)
    pub message: Option<String>,
}

impl JobRecord {
    pub(crate) fn new(id: JobId, kind: JobKind, args: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            kind,
            args,
            status: JobStatus::Pending,
            started_at: now,
            updated_at: now,
            exit_code: None,
            progress: if kind.is_transfer() {
                Some(TransferProgress::default())
            } else {
                None
            },
            mount: None,
            error: None,
            message: None,
        }
    }
}
