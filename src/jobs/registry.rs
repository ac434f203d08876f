//! Job registry
//!
//! Single owner of all tracked jobs. Every mutation of a job's state goes
//! through the registry's lock, so concurrent progress updates from the
//! parser threads and a cancel from the UI thread can never race status
//! into an inconsistent value: once a job is terminal, progress and
//! completion writes are ignored, and the completion event always wins over
//! any earlier progress event for the same job.
//!
//! The registry publishes a [`JobEvent`] snapshot on every state
//! transition. No lock is held across a process spawn, a kill, or any I/O.

use anyhow::{bail, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::process::Child;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};

use crate::events::{EventBus, JobEvent};
use crate::jobs::{
    ErrorKind, JobError, JobId, JobKind, JobRecord, JobStatus, MountHealth, MountInfo,
};
use crate::rclone::parser::StatsUpdate;

/// Raw diagnostic lines kept per job (oldest dropped first)
const MAX_DIAGNOSTICS: usize = 200;

/// Shared handles the monitoring threads need for one job
#[derive(Clone)]
pub(crate) struct JobHandles {
    pub id: JobId,
    pub child: Arc<Mutex<Child>>,
}

struct JobEntry {
    record: JobRecord,
    child: Option<Arc<Mutex<Child>>>,
    cancel_requested: Arc<AtomicBool>,
    /// Graceful stop (unmount); completion maps to Succeeded, not Cancelled
    stop_requested: Arc<AtomicBool>,
    last_error_line: Option<String>,
    diagnostics: Vec<String>,
    seq: u64,
}

impl JobEntry {
    fn new(record: JobRecord, child: Option<Arc<Mutex<Child>>>) -> Self {
        Self {
            record,
            child,
            cancel_requested: Arc::new(AtomicBool::new(false)),
            stop_requested: Arc::new(AtomicBool::new(false)),
            last_error_line: None,
            diagnostics: Vec::new(),
            seq: 0,
        }
    }
}

/// Filter for [`JobRegistry::list`]
#[derive(Debug, Clone, Copy, Default)]
pub struct JobFilter {
    pub kind: Option<JobKind>,
    pub status: Option<JobStatus>,
}

impl JobFilter {
    fn matches(&self, record: &JobRecord) -> bool {
        self.kind.map_or(true, |k| record.kind == k)
            && self.status.map_or(true, |s| record.status == s)
    }
}

/// Registry of all tracked jobs.
///
/// Cloning is cheap and shares the same underlying map; collaborators hold
/// the registry by handle rather than through any ambient state.
#[derive(Clone)]
pub struct JobRegistry {
    inner: Arc<Mutex<HashMap<JobId, JobEntry>>>,
    next_id: Arc<AtomicU64>,
    bus: EventBus,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            bus: EventBus::new(),
        }
    }

    /// The bus this registry publishes job transitions to
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Subscribe to job state snapshots
    pub fn subscribe(&self) -> Receiver<JobEvent> {
        self.bus.subscribe()
    }

    fn allocate_id(&self) -> JobId {
        JobId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a job whose process spawned successfully; status Running.
    pub(crate) fn insert_running(
        &self,
        kind: JobKind,
        args: Vec<String>,
        child: Child,
    ) -> (JobRecord, JobHandles) {
        let id = self.allocate_id();
        let mut record = JobRecord::new(id, kind, args);
        record.status = JobStatus::Running;

        let child = Arc::new(Mutex::new(child));
        let entry = JobEntry::new(record.clone(), Some(child.clone()));
        let handles = JobHandles { id, child };

        let event = self.insert_entry(id, entry);
        self.bus.publish(&event);
        (record, handles)
    }

    /// Register a job that failed before or during spawn; status Failed.
    ///
    /// The caller still receives a job record, never a bare error, so the
    /// presentation layer has one decision point regardless of when the
    /// failure happened.
    pub(crate) fn insert_failed(
        &self,
        kind: JobKind,
        args: Vec<String>,
        error_kind: ErrorKind,
        message: impl Into<String>,
    ) -> JobRecord {
        let id = self.allocate_id();
        let mut record = JobRecord::new(id, kind, args);
        record.status = JobStatus::Failed;
        record.error = Some(JobError::new(id, error_kind, message));

        let entry = JobEntry::new(record.clone(), None);
        let event = self.insert_entry(id, entry);
        self.bus.publish(&event);
        record
    }

    /// Register a job with no backing process (e.g. cache cleaning), which
    /// a worker thread later finishes via [`JobRegistry::finish_local`].
    pub(crate) fn insert_local(&self, kind: JobKind, args: Vec<String>) -> JobRecord {
        let id = self.allocate_id();
        let mut record = JobRecord::new(id, kind, args);
        record.status = JobStatus::Running;

        let entry = JobEntry::new(record.clone(), None);
        let event = self.insert_entry(id, entry);
        self.bus.publish(&event);
        record
    }

    fn insert_entry(&self, id: JobId, mut entry: JobEntry) -> JobEvent {
        entry.seq += 1;
        entry.record.updated_at = Utc::now();
        let event = JobEvent::new(entry.record.clone(), entry.seq);
        self.inner
            .lock()
            .expect("job registry lock poisoned")
            .insert(id, entry);
        event
    }

    /// Snapshot of one job
    pub fn get(&self, id: JobId) -> Option<JobRecord> {
        self.inner
            .lock()
            .expect("job registry lock poisoned")
            .get(&id)
            .map(|entry| entry.record.clone())
    }

    /// Snapshots of all jobs matching the filter, ordered by id
    pub fn list(&self, filter: JobFilter) -> Vec<JobRecord> {
        let map = self.inner.lock().expect("job registry lock poisoned");
        let mut records: Vec<JobRecord> = map
            .values()
            .filter(|entry| filter.matches(&entry.record))
            .map(|entry| entry.record.clone())
            .collect();
        records.sort_by_key(|r| r.id);
        records
    }

    /// Whether the job exists and has reached a terminal status
    pub fn is_terminal(&self, id: JobId) -> bool {
        self.get(id).map_or(false, |r| r.status.is_terminal())
    }

    /// Request cancellation of a job.
    ///
    /// Sends a kill to the underlying process; the job transitions to
    /// Cancelled only once the monitor observes the process exit. A cancel
    /// on an already-terminal job is a no-op, not an error.
    pub fn cancel(&self, id: JobId) -> Result<()> {
        let child = {
            let mut map = self.inner.lock().expect("job registry lock poisoned");
            let Some(entry) = map.get_mut(&id) else {
                bail!("unknown job {}", id);
            };
            if entry.record.status.is_terminal() {
                return Ok(());
            }
            entry.cancel_requested.store(true, Ordering::SeqCst);
            entry.child.clone()
        };

        // Kill outside the registry lock.
        if let Some(child) = child {
            let mut child = child.lock().expect("child lock poisoned");
            let _ = child.kill();
        }
        Ok(())
    }

    /// Request a graceful stop (used for unmount): the process is killed
    /// but completion maps to Succeeded rather than Cancelled.
    pub(crate) fn request_stop(&self, id: JobId) {
        let child = {
            let map = self.inner.lock().expect("job registry lock poisoned");
            let Some(entry) = map.get(&id) else {
                return;
            };
            if entry.record.status.is_terminal() {
                return;
            }
            entry.stop_requested.store(true, Ordering::SeqCst);
            entry.child.clone()
        };
        if let Some(child) = child {
            let mut child = child.lock().expect("child lock poisoned");
            let _ = child.kill();
        }
    }

    /// Remove a job after its terminal status has been observed.
    pub fn remove(&self, id: JobId) -> Result<()> {
        let mut map = self.inner.lock().expect("job registry lock poisoned");
        let Some(entry) = map.get(&id) else {
            bail!("unknown job {}", id);
        };
        if !entry.record.status.is_terminal() {
            bail!("job {} is still {:?}", id, entry.record.status);
        }
        map.remove(&id);
        Ok(())
    }

    /// Apply a parsed stats update. Ignored once the job is terminal, so a
    /// straggling progress line can never reopen a completed job.
    pub(crate) fn apply_progress(&self, id: JobId, update: &StatsUpdate) {
        let event = {
            let mut map = self.inner.lock().expect("job registry lock poisoned");
            let Some(entry) = map.get_mut(&id) else {
                return;
            };
            if entry.record.status != JobStatus::Running {
                return;
            }
            let Some(progress) = entry.record.progress.as_mut() else {
                return;
            };
            progress.apply(update);
            Self::bump(entry)
        };
        self.bus.publish(&event);
    }

    /// Record the file currently being transferred
    pub(crate) fn set_current_file(&self, id: JobId, name: &str) {
        let event = {
            let mut map = self.inner.lock().expect("job registry lock poisoned");
            let Some(entry) = map.get_mut(&id) else {
                return;
            };
            if entry.record.status != JobStatus::Running {
                return;
            }
            let Some(progress) = entry.record.progress.as_mut() else {
                return;
            };
            if progress.current_file.as_deref() == Some(name) {
                return;
            }
            progress.current_file = Some(name.to_string());
            Self::bump(entry)
        };
        self.bus.publish(&event);
    }

    /// Record an error line from the process output. Kept as the failure
    /// detail for the terminal event; not itself a state transition.
    pub(crate) fn record_error_line(&self, id: JobId, message: &str) {
        let mut map = self.inner.lock().expect("job registry lock poisoned");
        if let Some(entry) = map.get_mut(&id) {
            entry.last_error_line = Some(message.to_string());
            Self::push_diagnostic(entry, message.to_string());
        }
    }

    /// Retain an unrecognized output line as raw diagnostic text.
    pub(crate) fn add_diagnostic(&self, id: JobId, line: String) {
        let mut map = self.inner.lock().expect("job registry lock poisoned");
        if let Some(entry) = map.get_mut(&id) {
            Self::push_diagnostic(entry, line);
        }
    }

    /// Raw diagnostic lines retained for a job
    pub fn diagnostics(&self, id: JobId) -> Vec<String> {
        self.inner
            .lock()
            .expect("job registry lock poisoned")
            .get(&id)
            .map(|entry| entry.diagnostics.clone())
            .unwrap_or_default()
    }

    /// Attach a human-readable result summary
    pub(crate) fn set_message(&self, id: JobId, message: String) {
        let mut map = self.inner.lock().expect("job registry lock poisoned");
        if let Some(entry) = map.get_mut(&id) {
            entry.record.message = Some(message);
        }
    }

    /// Attach mount state to a Mount job
    pub(crate) fn set_mount_info(&self, id: JobId, info: MountInfo) {
        let event = {
            let mut map = self.inner.lock().expect("job registry lock poisoned");
            let Some(entry) = map.get_mut(&id) else {
                return;
            };
            entry.record.mount = Some(info);
            Self::bump(entry)
        };
        self.bus.publish(&event);
    }

    /// Update mount-point health.
    ///
    /// Deliberately works on terminal jobs too: the mount point outlives
    /// its backing process (Stale after a crash, Unmounted after cleanup).
    pub(crate) fn set_mount_health(&self, id: JobId, health: MountHealth) {
        let event = {
            let mut map = self.inner.lock().expect("job registry lock poisoned");
            let Some(entry) = map.get_mut(&id) else {
                return;
            };
            let Some(mount) = entry.record.mount.as_mut() else {
                return;
            };
            if mount.health == health {
                return;
            }
            mount.health = health;
            Self::bump(entry)
        };
        self.bus.publish(&event);
    }

    /// Record an error and mark the job Failed (e.g. mount confirmation
    /// timeout). Ignored if the job is already terminal.
    pub(crate) fn fail(&self, id: JobId, error: JobError) {
        let event = {
            let mut map = self.inner.lock().expect("job registry lock poisoned");
            let Some(entry) = map.get_mut(&id) else {
                return;
            };
            if entry.record.status.is_terminal() {
                return;
            }
            entry.record.status = JobStatus::Failed;
            entry.record.error = Some(error);
            Self::bump(entry)
        };
        self.bus.publish(&event);
    }

    /// Record process exit and settle the terminal status.
    ///
    /// Called by the job's waiter thread after both output streams have
    /// closed, so this event logically sorts after every progress event for
    /// the job. Cancellation and graceful-stop requests take precedence
    /// over the exit code.
    pub(crate) fn complete(&self, id: JobId, exit_code: Option<i32>) {
        let event = {
            let mut map = self.inner.lock().expect("job registry lock poisoned");
            let Some(entry) = map.get_mut(&id) else {
                return;
            };
            if entry.record.status.is_terminal() {
                return;
            }

            entry.record.exit_code = exit_code;
            if entry.cancel_requested.load(Ordering::SeqCst) {
                entry.record.status = JobStatus::Cancelled;
            } else if entry.stop_requested.load(Ordering::SeqCst) {
                entry.record.status = JobStatus::Succeeded;
            } else if exit_code == Some(0) {
                entry.record.status = JobStatus::Succeeded;
            } else {
                entry.record.status = JobStatus::Failed;
                let kind = if entry.record.kind == JobKind::Mount {
                    ErrorKind::ProcessCrashed
                } else {
                    ErrorKind::TransferFailed
                };
                let message = entry.last_error_line.clone().unwrap_or_else(|| match exit_code {
                    Some(code) => format!("rclone exited with code {}", code),
                    None => "rclone terminated by signal".to_string(),
                });
                entry.record.error = Some(JobError::new(id, kind, message));
            }
            Self::bump(entry)
        };
        self.bus.publish(&event);
    }

    /// Finish a job that has no backing process.
    pub(crate) fn finish_local(&self, id: JobId, result: std::result::Result<String, String>) {
        let event = {
            let mut map = self.inner.lock().expect("job registry lock poisoned");
            let Some(entry) = map.get_mut(&id) else {
                return;
            };
            if entry.record.status.is_terminal() {
                return;
            }
            match result {
                Ok(message) => {
                    entry.record.status = JobStatus::Succeeded;
                    entry.record.message = Some(message);
                }
                Err(message) => {
                    entry.record.status = JobStatus::Failed;
                    entry.record.error =
                        Some(JobError::new(id, ErrorKind::TransferFailed, message));
                }
            }
            Self::bump(entry)
        };
        self.bus.publish(&event);
    }

    fn bump(entry: &mut JobEntry) -> JobEvent {
        entry.seq += 1;
        entry.record.updated_at = Utc::now();
        JobEvent::new(entry.record.clone(), entry.seq)
    }

    fn push_diagnostic(entry: &mut JobEntry, line: String) {
        if entry.diagnostics.len() >= MAX_DIAGNOSTICS {
            entry.diagnostics.remove(0);
        }
        entry.diagnostics.push(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_unique_across_registry_lifetime() {
        let registry = JobRegistry::new();
        let mut seen = HashSet::new();
        for _ in 0..100 {
            let record = registry.insert_local(JobKind::Copy, vec![]);
            assert!(seen.insert(record.id), "duplicate id {}", record.id);
        }
    }

    #[test]
    fn test_cancel_on_succeeded_job_is_noop() {
        let registry = JobRegistry::new();
        let record = registry.insert_local(JobKind::CacheClean, vec![]);
        registry.finish_local(record.id, Ok("done".to_string()));

        assert!(registry.cancel(record.id).is_ok());
        assert_eq!(
            registry.get(record.id).unwrap().status,
            JobStatus::Succeeded
        );
    }

    #[test]
    fn test_cancel_unknown_job_is_error() {
        let registry = JobRegistry::new();
        assert!(registry.cancel(JobId::from_raw(999)).is_err());
    }

    #[test]
    fn test_remove_refused_while_running() {
        let registry = JobRegistry::new();
        let record = registry.insert_local(JobKind::Copy, vec![]);
        assert!(registry.remove(record.id).is_err());

        registry.finish_local(record.id, Ok("done".to_string()));
        assert!(registry.remove(record.id).is_ok());
        assert!(registry.get(record.id).is_none());
    }

    #[test]
    fn test_progress_frozen_after_terminal() {
        let registry = JobRegistry::new();
        let record = registry.insert_local(JobKind::Copy, vec![]);

        registry.apply_progress(
            record.id,
            &StatsUpdate {
                bytes: Some(100),
                ..Default::default()
            },
        );
        registry.finish_local(record.id, Ok("done".to_string()));

        // Straggling progress after completion must be ignored.
        registry.apply_progress(
            record.id,
            &StatsUpdate {
                bytes: Some(9999),
                ..Default::default()
            },
        );

        let progress = registry.get(record.id).unwrap().progress.unwrap();
        assert_eq!(progress.bytes, 100);
    }

    #[test]
    fn test_list_filters_by_kind_and_status() {
        let registry = JobRegistry::new();
        let copy = registry.insert_local(JobKind::Copy, vec![]);
        let _sync = registry.insert_local(JobKind::Sync, vec![]);
        registry.finish_local(copy.id, Ok("done".to_string()));

        let copies = registry.list(JobFilter {
            kind: Some(JobKind::Copy),
            ..Default::default()
        });
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].id, copy.id);

        let running = registry.list(JobFilter {
            status: Some(JobStatus::Running),
            ..Default::default()
        });
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].kind, JobKind::Sync);

        assert_eq!(registry.list(JobFilter::default()).len(), 2);
    }

    #[test]
    fn test_failed_insert_carries_error_record() {
        let registry = JobRegistry::new();
        let record = registry.insert_failed(
            JobKind::Copy,
            vec!["copy".into()],
            ErrorKind::ExecutableNotFound,
            "rclone not found on PATH",
        );
        assert_eq!(record.status, JobStatus::Failed);
        let error = record.error.unwrap();
        assert_eq!(error.kind, ErrorKind::ExecutableNotFound);
        assert!(!error.recoverable);
    }

    #[test]
    fn test_events_published_with_increasing_seq() {
        let registry = JobRegistry::new();
        let rx = registry.subscribe();
        let record = registry.insert_local(JobKind::Copy, vec![]);
        registry.apply_progress(
            record.id,
            &StatsUpdate {
                bytes: Some(10),
                ..Default::default()
            },
        );
        registry.finish_local(record.id, Ok("done".to_string()));

        let seqs: Vec<u64> = rx.try_iter().map(|e| e.seq).collect();
        assert_eq!(seqs.len(), 3);
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_diagnostics_capped() {
        let registry = JobRegistry::new();
        let record = registry.insert_local(JobKind::Copy, vec![]);
        for i in 0..(MAX_DIAGNOSTICS + 50) {
            registry.add_diagnostic(record.id, format!("line {}", i));
        }
        let diagnostics = registry.diagnostics(record.id);
        assert_eq!(diagnostics.len(), MAX_DIAGNOSTICS);
        assert_eq!(diagnostics.last().unwrap(), &format!("line {}", MAX_DIAGNOSTICS + 49));
    }
}
