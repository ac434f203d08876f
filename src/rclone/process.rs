//! Rclone process runner
//!
//! Builds and starts rclone subprocesses from discrete argument lists,
//! with Windows-specific handling for hiding console windows and capturing
//! output. Short diagnostic commands run blocking with captured output;
//! long-running operations are launched as tracked jobs whose streams are
//! drained by dedicated monitor threads.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Sender};
use std::thread;
use std::time::Duration;

use crate::jobs::monitor;
use crate::jobs::registry::JobRegistry;
use crate::jobs::{ErrorKind, JobKind, JobRecord};

/// Windows-specific: CREATE_NO_WINDOW flag
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x08000000;

/// Output from a blocking rclone command
#[derive(Debug, Clone)]
pub struct RcloneOutput {
    /// Standard output lines
    pub stdout: Vec<String>,
    /// Standard error lines
    pub stderr: Vec<String>,
    /// Exit status
    pub status: i32,
    /// Whether the process was killed due to timeout
    pub timed_out: bool,
}

impl RcloneOutput {
    /// Check if the command succeeded
    pub fn success(&self) -> bool {
        self.status == 0 && !self.timed_out
    }

    /// Get stdout as a single string
    pub fn stdout_string(&self) -> String {
        self.stdout.join("\n")
    }

    /// Get stderr as a single string
    pub fn stderr_string(&self) -> String {
        self.stderr.join("\n")
    }
}

/// Runs rclone processes with proper configuration
#[derive(Debug, Clone)]
pub struct RcloneRunner {
    /// Path to rclone executable
    exe_path: PathBuf,
    /// Path to rclone config file (optional)
    config_path: Option<PathBuf>,
    /// Default timeout for blocking commands
    default_timeout: Option<Duration>,
}

impl RcloneRunner {
    /// Create a new rclone runner
    pub fn new(exe_path: impl AsRef<Path>) -> Self {
        Self {
            exe_path: exe_path.as_ref().to_path_buf(),
            config_path: None,
            default_timeout: None,
        }
    }

    /// Set the config file path
    pub fn with_config(mut self, config_path: impl AsRef<Path>) -> Self {
        self.config_path = Some(config_path.as_ref().to_path_buf());
        self
    }

    /// Set default timeout for blocking commands
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Get the executable path
    pub fn exe_path(&self) -> &Path {
        &self.exe_path
    }

    /// Launch a long-running rclone operation as a tracked job.
    ///
    /// The caller always receives a job record, never a bare error: an
    /// unresolvable executable or a spawn failure produces a job already in
    /// Failed status carrying the corresponding error record. On success
    /// the job is registered Running and its streams are drained by
    /// dedicated monitor threads.
    pub fn launch(&self, kind: JobKind, args: Vec<String>, registry: &JobRegistry) -> JobRecord {
        if !self.exe_path.exists() && resolve_on_path(&self.exe_path).is_none() {
            return registry.insert_failed(
                kind,
                args,
                ErrorKind::ExecutableNotFound,
                format!("rclone executable not found: {:?}", self.exe_path),
            );
        }

        match self.spawn_streaming(&args) {
            Ok((child, stdout, stderr)) => {
                let (record, handles) = registry.insert_running(kind, args, child);
                tracing::info!("{}: started rclone {} process", record.id, kind);
                monitor::spawn_monitor(kind, handles, stdout, stderr, registry.clone());
                record
            }
            Err(e) => registry.insert_failed(
                kind,
                args,
                ErrorKind::SpawnFailed,
                format!("failed to spawn rclone: {}", e),
            ),
        }
    }

    /// Spawn rclone with both output streams piped.
    fn spawn_streaming(&self, args: &[String]) -> Result<(Child, ChildStdout, ChildStderr)> {
        let mut cmd = self.build_command(args);
        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn rclone: {:?}", self.exe_path))?;
        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");
        Ok((child, stdout, stderr))
    }

    /// Run a short rclone command and capture output
    pub fn run(&self, args: &[&str]) -> Result<RcloneOutput> {
        self.run_with_timeout(args, self.default_timeout)
    }

    /// Run a short rclone command with a specific timeout
    pub fn run_with_timeout(
        &self,
        args: &[&str],
        timeout: Option<Duration>,
    ) -> Result<RcloneOutput> {
        let owned: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let mut cmd = self.build_command(&owned);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn rclone: {:?}", self.exe_path))?;

        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");

        let (stdout_tx, stdout_rx) = mpsc::channel();
        let (stderr_tx, stderr_rx) = mpsc::channel();

        // Capture both streams so neither pipe can fill and stall the child.
        let stdout_thread = thread::spawn(move || capture_output(stdout, stdout_tx));
        let stderr_thread = thread::spawn(move || capture_output(stderr, stderr_tx));

        let (status, timed_out) = match timeout {
            Some(duration) => wait_with_timeout(&mut child, duration)?,
            None => (child.wait()?, false),
        };

        stdout_thread.join().expect("stdout thread panicked");
        stderr_thread.join().expect("stderr thread panicked");

        let stdout: Vec<String> = stdout_rx.try_iter().collect();
        let stderr: Vec<String> = stderr_rx.try_iter().collect();

        Ok(RcloneOutput {
            stdout,
            stderr,
            status: status.code().unwrap_or(-1),
            timed_out,
        })
    }

    /// Get rclone version
    pub fn version(&self) -> Result<String> {
        let output = self.run_with_timeout(&["version"], Some(Duration::from_secs(10)))?;
        if !output.success() {
            bail!("rclone version failed: {}", output.stderr_string());
        }
        // First line usually contains "rclone vX.Y.Z"
        Ok(output.stdout.first().cloned().unwrap_or_default())
    }

    /// List configured remotes
    pub fn list_remotes(&self) -> Result<Vec<String>> {
        let output = self.run_with_timeout(&["listremotes"], Some(Duration::from_secs(10)))?;
        if !output.success() {
            bail!("rclone listremotes failed: {}", output.stderr_string());
        }
        Ok(output
            .stdout
            .iter()
            .map(|s| s.trim_end_matches(':').to_string())
            .filter(|s| !s.is_empty())
            .collect())
    }

    /// Build the command with appropriate flags
    fn build_command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.exe_path);

        // Add config flag if set
        if let Some(ref config) = self.config_path {
            cmd.arg("--config").arg(config);
        }

        // Arguments are always a discrete list, never a shell string.
        cmd.args(args);

        // Output is captured, never inherited, so all of it flows through
        // the parser.
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null());

        // Windows: hide console window
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd
    }
}

/// Resolve a bare executable name against PATH.
fn resolve_on_path(exe: &Path) -> Option<PathBuf> {
    if exe.components().count() > 1 {
        return None;
    }
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(exe);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// Capture output from a reader and send it through a channel
fn capture_output<R: std::io::Read>(reader: R, tx: Sender<String>) {
    use std::io::{BufRead, BufReader};
    let reader = BufReader::new(reader);
    for line in reader.lines().map_while(|l| l.ok()) {
        let _ = tx.send(line);
    }
}

/// Wait for a child process with timeout
fn wait_with_timeout(child: &mut Child, timeout: Duration) -> Result<(ExitStatus, bool)> {
    let start = std::time::Instant::now();
    loop {
        match child.try_wait()? {
            Some(status) => return Ok((status, false)),
            None => {
                if start.elapsed() > timeout {
                    let _ = child.kill();
                    let status = child.wait()?;
                    return Ok((status, true));
                }
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
}
