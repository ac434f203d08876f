//! Environment probing
//!
//! Locates the rclone executable and the platform's user-space filesystem
//! driver at startup. Both are reported as capability flags rather than
//! assumed, so the presentation layer can disable what the environment
//! cannot support instead of failing later.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::rclone::{MountManager, RcloneRunner};

/// What the current environment supports
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    /// Resolved rclone executable, if any
    pub rclone_path: Option<PathBuf>,
    /// First line of `rclone version` output, if the binary responded
    pub rclone_version: Option<String>,
    /// Whether FUSE/WinFsp/macFUSE is installed
    pub fuse_available: bool,
}

impl Capabilities {
    /// Probe the environment once, preferring an explicitly configured
    /// rclone path over discovery.
    pub fn probe(configured_path: Option<&Path>) -> Self {
        let rclone_path = find_rclone_path(configured_path);
        let rclone_version = rclone_path
            .as_ref()
            .and_then(|path| RcloneRunner::new(path).version().ok());
        Self {
            rclone_path,
            rclone_version,
            fuse_available: MountManager::check_fuse_available(),
        }
    }

    /// Transfers and diagnostics need only the rclone binary.
    pub fn can_transfer(&self) -> bool {
        self.rclone_path.is_some()
    }

    /// Mounting additionally needs the filesystem driver.
    pub fn can_mount(&self) -> bool {
        self.rclone_path.is_some() && self.fuse_available
    }
}

/// Locate the rclone executable.
///
/// Order: explicitly configured path, common install locations for the
/// platform, then the search path via `which`/`where`.
pub fn find_rclone_path(configured: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = configured {
        if is_executable(path) {
            return Some(path.to_path_buf());
        }
        tracing::warn!("configured rclone path {:?} is not usable, falling back to discovery", path);
    }

    for candidate in common_paths() {
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }

    search_path_lookup()
}

fn common_paths() -> Vec<PathBuf> {
    #[cfg(windows)]
    {
        let mut paths = vec![
            PathBuf::from(r"C:\rclone\rclone.exe"),
            PathBuf::from(r"C:\Program Files\rclone\rclone.exe"),
        ];
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join("rclone").join("rclone.exe"));
        }
        paths
    }

    #[cfg(not(windows))]
    {
        let mut paths = vec![
            PathBuf::from("/usr/bin/rclone"),
            PathBuf::from("/usr/local/bin/rclone"),
            PathBuf::from("/opt/homebrew/bin/rclone"),
        ];
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join("rclone"));
        }
        paths
    }
}

/// Ask the shell's lookup tool where rclone lives.
fn search_path_lookup() -> Option<PathBuf> {
    let (tool, exe) = if cfg!(windows) {
        ("where", "rclone.exe")
    } else {
        ("which", "rclone")
    };

    let output = Command::new(tool).arg(exe).output().ok()?;
    if !output.status.success() {
        return None;
    }
    // First line; `where` can report multiple matches.
    let stdout = String::from_utf8_lossy(&output.stdout);
    let first = stdout.lines().next()?.trim();
    if first.is_empty() {
        return None;
    }
    let path = PathBuf::from(first);
    if is_executable(&path) {
        Some(path)
    } else {
        None
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.is_file()
        && std::fs::metadata(path)
            .map(|m| m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
