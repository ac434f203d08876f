//! Per-job monitoring threads
//!
//! Each launched job gets two dedicated drain threads (one per output
//! stream) and one waiter thread, so a stall in one job's output can never
//! block another job's throughput. The drains feed parsed lines into the
//! registry; the waiter polls for process exit, joins the drains, and then
//! settles the terminal status — which is why the completion event always
//! sorts after every progress event for the job.

use std::io::Read;
use std::process::{ChildStderr, ChildStdout};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::jobs::registry::{JobHandles, JobRegistry};
use crate::jobs::{JobId, JobKind};
use crate::rclone::parser::{self, LineBuffer, ProgressLine};
use crate::utils::format::format_bytes;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Start the monitoring threads for a freshly spawned job.
pub(crate) fn spawn_monitor(
    kind: JobKind,
    handles: JobHandles,
    stdout: ChildStdout,
    stderr: ChildStderr,
    registry: JobRegistry,
) {
    let id = handles.id;

    // Size queries need the raw stdout to parse the JSON result from.
    let capture: Option<Arc<Mutex<Vec<String>>>> = if kind == JobKind::SizeQuery {
        Some(Arc::new(Mutex::new(Vec::new())))
    } else {
        None
    };

    let stdout_thread = {
        let registry = registry.clone();
        let capture = capture.clone();
        thread::spawn(move || drain_stream(id, &registry, stdout, capture.as_deref()))
    };
    let stderr_thread = {
        let registry = registry.clone();
        thread::spawn(move || drain_stream(id, &registry, stderr, None))
    };

    thread::spawn(move || {
        // The process's own exit is the authoritative completion signal;
        // poll briefly so a concurrent cancel can take the child lock to
        // deliver its kill.
        let exit_code = loop {
            let polled = {
                let mut child = handles.child.lock().expect("child lock poisoned");
                child.try_wait()
            };
            match polled {
                Ok(Some(status)) => break status.code(),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("wait for {} failed: {}", id, e);
                    break None;
                }
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        };

        // Streams close on exit; joining the drains here guarantees every
        // progress event has been applied before the terminal transition.
        let _ = stdout_thread.join();
        let _ = stderr_thread.join();

        if exit_code == Some(0) {
            if let Some(capture) = capture {
                let lines = capture.lock().expect("capture lock poisoned");
                match summarize_size_output(&lines) {
                    Some(summary) => registry.set_message(id, summary),
                    None => {
                        tracing::debug!("size output for {} did not parse as JSON", id);
                    }
                }
            }
        }

        registry.complete(id, exit_code);
    });
}

/// Drain one output stream to completion, feeding parsed lines into the
/// registry. Tolerates partial lines across read boundaries and never fails
/// the stream on unparseable output.
fn drain_stream<R: Read>(
    id: JobId,
    registry: &JobRegistry,
    mut reader: R,
    capture: Option<&Mutex<Vec<String>>>,
) {
    let mut buffer = LineBuffer::new();
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                for line in buffer.push(&chunk[..n]) {
                    handle_line(id, registry, &line, capture);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    if let Some(line) = buffer.finish() {
        handle_line(id, registry, &line, capture);
    }
}

fn handle_line(id: JobId, registry: &JobRegistry, line: &str, capture: Option<&Mutex<Vec<String>>>) {
    if let Some(capture) = capture {
        capture
            .lock()
            .expect("capture lock poisoned")
            .push(line.to_string());
    }
    if line.trim().is_empty() {
        return;
    }
    match parser::classify(line) {
        ProgressLine::Stats(update) => registry.apply_progress(id, &update),
        ProgressLine::FileEvent(event) => registry.set_current_file(id, &event.name),
        ProgressLine::ErrorLine(message) => {
            tracing::warn!("{}: rclone error: {}", id, message);
            registry.record_error_line(id, &message);
        }
        ProgressLine::Unrecognized(raw) => {
            tracing::debug!("{}: unrecognized rclone output: {}", id, raw);
            registry.add_diagnostic(id, raw);
        }
    }
}

/// Render the JSON output of `rclone size --json` as a one-line summary.
fn summarize_size_output(lines: &[String]) -> Option<String> {
    let joined = lines.join("\n");
    let json = joined.trim();
    let value: serde_json::Value = serde_json::from_str(json).ok()?;
    let count = value.get("count")?.as_u64()?;
    let bytes = value.get("bytes")?.as_u64()?;
    Some(format!("{} objects, {}", count, format_bytes(bytes as f64)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summarize_size_output() {
        let lines = vec![r#"{"count":42,"bytes":1048576,"sizeless":0}"#.to_string()];
        assert_eq!(
            summarize_size_output(&lines).as_deref(),
            Some("42 objects, 1.00 MB")
        );
    }

    #[test]
    fn test_summarize_size_output_rejects_junk() {
        let lines = vec!["not json at all".to_string()];
        assert_eq!(summarize_size_output(&lines), None);
    }
}
