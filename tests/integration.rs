#![cfg(unix)]
//! End-to-end tests driving the orchestration core against a fake rclone
//! binary (a shell script) that emits genuine rclone progress output.

use rclone_manager::capabilities::Capabilities;
use rclone_manager::jobs::{ErrorKind, JobId, JobKind, JobRecord, JobStatus, MountHealth};
use rclone_manager::manager::{RcloneManager, TransferOptions};
use rclone_manager::rclone::{MountManager, MountOptions, RcloneRunner};

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Write an executable shell script that stands in for rclone.
fn fake_rclone(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("rclone");
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

fn manager_with(exe: PathBuf) -> RcloneManager {
    RcloneManager::new(Capabilities {
        rclone_path: Some(exe),
        rclone_version: None,
        fuse_available: false,
    })
}

fn wait_terminal(manager: &RcloneManager, id: JobId, timeout: Duration) -> JobRecord {
    let deadline = Instant::now() + timeout;
    loop {
        let record = manager.job(id).expect("job exists");
        if record.status.is_terminal() {
            return record;
        }
        assert!(Instant::now() < deadline, "job {} never reached a terminal state", id);
        std::thread::sleep(Duration::from_millis(25));
    }
}

fn wait_health(
    manager: &RcloneManager,
    id: JobId,
    wanted: MountHealth,
    timeout: Duration,
) -> JobRecord {
    let deadline = Instant::now() + timeout;
    loop {
        let record = manager.job(id).expect("job exists");
        if record.mount.as_ref().map(|m| m.health) == Some(wanted) {
            return record;
        }
        assert!(
            Instant::now() < deadline,
            "mount {} never became {:?} (currently {:?})",
            id,
            wanted,
            record.mount.map(|m| m.health)
        );
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn transfer_success_parses_progress() {
    let dir = tempfile::tempdir().unwrap();
    let exe = fake_rclone(
        dir.path(),
        r#"
echo "Transferred:        5.25 MiB / 100 MiB, 5%, 1.0 MiB/s, ETA 95s"
echo "Transferred:            1 / 10, 10%"
echo " *                              photos/img_0001.jpg:  42% /2.1Mi, 1.2Mi/s, 1s"
echo "Transferred:       10.5 MiB / 100 MiB, 10%, 1.2 MiB/s, ETA 75s"
exit 0
"#,
    );

    let manager = manager_with(exe);
    let record = manager
        .start_transfer(JobKind::Sync, "src", "dst", &TransferOptions::default())
        .unwrap();
    assert_eq!(record.status, JobStatus::Running);

    let finished = wait_terminal(&manager, record.id, Duration::from_secs(10));
    assert_eq!(finished.status, JobStatus::Succeeded);
    assert_eq!(finished.exit_code, Some(0));

    let progress = finished.progress.unwrap();
    assert_eq!(progress.bytes, (10.5 * 1024.0 * 1024.0) as u64);
    assert_eq!(progress.total_bytes, Some(100 * 1024 * 1024));
    assert_eq!(progress.rate, 1.2 * 1024.0 * 1024.0);
    assert_eq!(progress.eta, Some(Duration::from_secs(75)));
    assert_eq!(progress.files_done, 1);
    assert_eq!(progress.files_total, Some(10));
    assert_eq!(progress.current_file.as_deref(), Some("photos/img_0001.jpg"));
}

#[test]
fn transfer_failure_carries_parsed_error() {
    let dir = tempfile::tempdir().unwrap();
    let exe = fake_rclone(
        dir.path(),
        r#"
echo "Transferred:        1.0 MiB / 4.0 MiB, 25%, 1.0 MiB/s, ETA 3s"
echo "2024/01/02 15:04:05 ERROR : docs/report.pdf: Failed to copy: permission denied" >&2
exit 3
"#,
    );

    let manager = manager_with(exe);
    let record = manager
        .start_transfer(JobKind::Copy, "src", "dst", &TransferOptions::default())
        .unwrap();

    let finished = wait_terminal(&manager, record.id, Duration::from_secs(10));
    assert_eq!(finished.status, JobStatus::Failed);
    assert_eq!(finished.exit_code, Some(3));

    let error = finished.error.unwrap();
    assert_eq!(error.kind, ErrorKind::TransferFailed);
    assert!(error.message.contains("permission denied"));

    // Progress froze at the last parsed value instead of resetting.
    assert_eq!(finished.progress.unwrap().bytes, 1024 * 1024);
}

#[test]
fn nonzero_exit_without_error_line_still_fails() {
    let dir = tempfile::tempdir().unwrap();
    let exe = fake_rclone(dir.path(), "exit 7");

    let manager = manager_with(exe);
    let record = manager
        .start_transfer(JobKind::Copy, "src", "dst", &TransferOptions::default())
        .unwrap();

    let finished = wait_terminal(&manager, record.id, Duration::from_secs(10));
    assert_eq!(finished.status, JobStatus::Failed);
    assert_eq!(finished.exit_code, Some(7));
    assert!(finished.error.unwrap().message.contains("code 7"));
}

#[test]
fn cancel_terminates_running_job() {
    let dir = tempfile::tempdir().unwrap();
    let exe = fake_rclone(dir.path(), "sleep 30");

    let manager = manager_with(exe);
    let record = manager
        .start_transfer(JobKind::Copy, "src", "dst", &TransferOptions::default())
        .unwrap();
    assert_eq!(record.status, JobStatus::Running);

    manager.cancel_job(record.id).unwrap();
    let finished = wait_terminal(&manager, record.id, Duration::from_secs(10));
    assert_eq!(finished.status, JobStatus::Cancelled);
    // Cancellation is user-initiated, not an error.
    assert!(finished.error.is_none());
}

#[test]
fn cancel_after_success_is_noop() {
    let dir = tempfile::tempdir().unwrap();
    let exe = fake_rclone(dir.path(), "exit 0");

    let manager = manager_with(exe);
    let record = manager
        .start_transfer(JobKind::Copy, "src", "dst", &TransferOptions::default())
        .unwrap();
    let finished = wait_terminal(&manager, record.id, Duration::from_secs(10));
    assert_eq!(finished.status, JobStatus::Succeeded);

    assert!(manager.cancel_job(record.id).is_ok());
    assert_eq!(manager.job(record.id).unwrap().status, JobStatus::Succeeded);
}

#[test]
fn spawn_failure_yields_failed_job_not_error() {
    let dir = tempfile::tempdir().unwrap();
    // Present but not executable: spawn itself fails.
    let exe = dir.path().join("rclone");
    std::fs::write(&exe, "not a binary").unwrap();

    let manager = manager_with(exe);
    let record = manager
        .start_transfer(JobKind::Copy, "src", "dst", &TransferOptions::default())
        .unwrap();
    assert_eq!(record.status, JobStatus::Failed);
    assert_eq!(record.error.as_ref().unwrap().kind, ErrorKind::SpawnFailed);
}

#[test]
fn missing_executable_yields_executable_not_found() {
    let manager = manager_with(PathBuf::from("/nonexistent/rclone-bin"));
    let record = manager
        .start_transfer(JobKind::Copy, "src", "dst", &TransferOptions::default())
        .unwrap();
    assert_eq!(record.status, JobStatus::Failed);
    assert_eq!(
        record.error.as_ref().unwrap().kind,
        ErrorKind::ExecutableNotFound
    );
}

#[test]
fn size_query_summarizes_json_output() {
    let dir = tempfile::tempdir().unwrap();
    let exe = fake_rclone(
        dir.path(),
        r#"echo '{"count":3,"bytes":3145728,"sizeless":0}'"#,
    );

    let manager = manager_with(exe);
    let record = manager.size_query("remote:");
    let finished = wait_terminal(&manager, record.id, Duration::from_secs(10));

    assert_eq!(finished.status, JobStatus::Succeeded);
    assert_eq!(finished.message.as_deref(), Some("3 objects, 3.00 MB"));
}

#[test]
fn subscribers_see_running_and_terminal_events_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let exe = fake_rclone(
        dir.path(),
        r#"
echo "Transferred:        1.0 MiB / 2.0 MiB, 50%, 1.0 MiB/s, ETA 1s"
exit 0
"#,
    );

    let manager = manager_with(exe);
    let events = manager.subscribe();
    let record = manager
        .start_transfer(JobKind::Copy, "src", "dst", &TransferOptions::default())
        .unwrap();
    wait_terminal(&manager, record.id, Duration::from_secs(10));

    let mut seen = Vec::new();
    while let Ok(event) = events.recv_timeout(Duration::from_millis(200)) {
        if event.job.id == record.id {
            seen.push(event);
        }
        if seen.last().map(|e| e.job.status.is_terminal()) == Some(true) {
            break;
        }
    }

    assert!(seen.len() >= 2, "expected at least launch + terminal events");
    assert_eq!(seen.first().unwrap().job.status, JobStatus::Running);
    assert!(seen.last().unwrap().job.status.is_terminal());
    assert!(seen.windows(2).all(|w| w[0].seq < w[1].seq));
}

#[test]
fn registry_ids_are_unique_across_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let exe = fake_rclone(dir.path(), "exit 0");
    let manager = manager_with(exe);

    let mut ids = std::collections::HashSet::new();
    for _ in 0..10 {
        let record = manager
            .start_transfer(JobKind::Copy, "src", "dst", &TransferOptions::default())
            .unwrap();
        assert!(ids.insert(record.id));
    }
}

// Mount lifecycle tests use the MountManager directly: the mount point
// probe is a directory listing, so a plain directory plus a fake process
// exercises the state machine without a real FUSE mount.

fn mount_manager_with(exe: PathBuf) -> (RcloneManager, MountManager) {
    let manager = manager_with(exe.clone());
    let mounts = MountManager::new(
        RcloneRunner::new(exe),
        manager.registry().clone(),
    )
    .with_probe_interval(Duration::from_millis(100));
    (manager, mounts)
}

#[test]
fn mount_crash_goes_stale_not_unmounted() {
    let dir = tempfile::tempdir().unwrap();
    // The backing process dies with code 1 without an unmount request.
    let exe = fake_rclone(dir.path(), "sleep 1; exit 1");
    let (manager, mounts) = mount_manager_with(exe);
    let mount_point = dir.path().join("mnt");

    let record = mounts
        .mount("gdrive:", &mount_point, &MountOptions::default())
        .unwrap();
    wait_health(&manager, record.id, MountHealth::Active, Duration::from_secs(5));

    let finished = wait_terminal(&manager, record.id, Duration::from_secs(10));
    assert_eq!(finished.status, JobStatus::Failed);
    assert_eq!(
        finished.error.as_ref().unwrap().kind,
        ErrorKind::ProcessCrashed
    );

    // Stale, not Unmounted: crash and user unmount are distinguishable.
    let stale = wait_health(&manager, record.id, MountHealth::Stale, Duration::from_secs(5));
    assert_eq!(stale.mount.unwrap().health, MountHealth::Stale);
}

#[test]
fn mount_and_unmount_full_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let exe = fake_rclone(dir.path(), "sleep 30");
    let (manager, mounts) = mount_manager_with(exe);
    let mount_point = dir.path().join("mnt");

    let record = mounts
        .mount("gdrive:photos", &mount_point, &MountOptions::default())
        .unwrap();
    assert_eq!(record.kind, JobKind::Mount);
    wait_health(&manager, record.id, MountHealth::Active, Duration::from_secs(5));

    mounts.unmount(&mount_point).unwrap();
    let finished = wait_terminal(&manager, record.id, Duration::from_secs(10));
    // A requested unmount ends the mount job cleanly.
    assert_eq!(finished.status, JobStatus::Succeeded);

    wait_health(&manager, record.id, MountHealth::Unmounted, Duration::from_secs(10));

    // The path is free for a new mount once Unmounted.
    assert!(!mounts.is_path_claimed(&mount_point));
}

#[test]
fn duplicate_mount_path_rejected_while_active() {
    let dir = tempfile::tempdir().unwrap();
    let exe = fake_rclone(dir.path(), "sleep 30");
    let (manager, mounts) = mount_manager_with(exe);
    let mount_point = dir.path().join("mnt");

    let record = mounts
        .mount("gdrive:", &mount_point, &MountOptions::default())
        .unwrap();
    wait_health(&manager, record.id, MountHealth::Active, Duration::from_secs(5));

    let before = manager.list_jobs().len();
    let err = mounts
        .mount("other:", &mount_point, &MountOptions::default())
        .unwrap_err();
    assert!(err.to_string().contains("already in use"));
    // Rejected before any subprocess was spawned: no new job appeared.
    assert_eq!(manager.list_jobs().len(), before);

    manager.cancel_job(record.id).unwrap();
    wait_terminal(&manager, record.id, Duration::from_secs(10));
}

#[test]
fn remove_job_only_after_terminal() {
    let dir = tempfile::tempdir().unwrap();
    let exe = fake_rclone(dir.path(), "sleep 30");
    let manager = manager_with(exe);

    let record = manager
        .start_transfer(JobKind::Copy, "src", "dst", &TransferOptions::default())
        .unwrap();
    assert!(manager.remove_job(record.id).is_err());

    manager.cancel_job(record.id).unwrap();
    wait_terminal(&manager, record.id, Duration::from_secs(10));

    manager.remove_job(record.id).unwrap();
    assert!(manager.job(record.id).is_none());
}
