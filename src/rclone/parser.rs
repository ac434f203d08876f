//! Rclone output stream parser
//!
//! Converts the human-readable progress output of a running rclone process
//! into structured events. rclone's text output is not a committed contract,
//! so every format-specific pattern lives here and nowhere else: parsing
//! degrades to [`ProgressLine::Unrecognized`] on drift instead of failing
//! the stream.
//!
//! With `--progress --stats 1s` rclone periodically emits a stats block:
//!
//! ```text
//! Transferred:       10.5 MiB / 100 MiB, 10%, 1.2 MiB/s, ETA 75s
//! Errors:                 1 (retrying may help)
//! Checks:                 0 / 0, -
//! Transferred:            3 / 10, 30%
//! Elapsed time:         9.5s
//! Transferring:
//!  *                            photos/img_0001.jpg:  42% /2.1Mi, 1.2Mi/s, 1s
//! ```
//!
//! plus timestamped log lines (`2024/01/02 15:04:05 ERROR : path: message`)
//! on stderr.

use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

/// Classification of a single output line
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressLine {
    /// A global stats line; carries whichever fields parsed cleanly
    Stats(StatsUpdate),
    /// A per-file event (transfer in flight or completed)
    FileEvent(FileEvent),
    /// An error line from rclone's log output
    ErrorLine(String),
    /// Anything else; retained as raw diagnostic text only
    Unrecognized(String),
}

/// Fields extracted from one stats line.
///
/// Every field is optional: extraction is per-field and a missing or
/// malformed field is simply absent, leaving the consumer's previous value
/// untouched (see `TransferProgress::apply`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsUpdate {
    pub bytes: Option<u64>,
    pub total_bytes: Option<u64>,
    /// Bytes per second
    pub rate: Option<f64>,
    pub eta: Option<Duration>,
    pub files_done: Option<u64>,
    pub files_total: Option<u64>,
}

impl StatsUpdate {
    pub fn is_empty(&self) -> bool {
        *self == StatsUpdate::default()
    }
}

/// A per-file transfer event
#[derive(Debug, Clone, PartialEq)]
pub struct FileEvent {
    pub name: String,
    pub percent: Option<u8>,
}

// In-flight entry under the "Transferring:" header, e.g.
// ` *        photos/img_0001.jpg:  42% /2.1Mi, 1.2Mi/s, 1s`
static TRANSFERRING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\*\s+(.+?):\s+(\d{1,3})%").expect("valid regex"));

// Timestamped rclone log line: `2024/01/02 15:04:05 LEVEL : target: message`
static LOG_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{4}/\d{2}/\d{2} \d{2}:\d{2}:\d{2}(?:\.\d+)?\s+([A-Z]+)\s*:\s*(.*)$")
        .expect("valid regex")
});

// `INFO : path/to/file: Copied (new)` payload — target plus action
static FILE_ACTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.+?):\s+(Copied|Moved|Deleted|Updated|Transferred)\b").expect("valid regex"));

// Numeric size with optional unit: `10.5 MiB`, `0 B`, `1.2k`
static SIZE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([0-9]+(?:\.[0-9]+)?)\s*([A-Za-z]*)$").expect("valid regex")
});

// ETA segments: `75s`, `1m15s`, `2h3m`, `1d2h3m4.5s`
static ETA_SEGMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([0-9]+(?:\.[0-9]+)?)([dhms])").expect("valid regex"));

/// Classify one complete output line.
///
/// Never fails: a line matching no known pattern comes back as
/// [`ProgressLine::Unrecognized`] carrying the raw text.
pub fn classify(line: &str) -> ProgressLine {
    let trimmed = line.trim_end();

    if let Some(rest) = trimmed.trim_start().strip_prefix("Transferred:") {
        let update = parse_stats_fields(rest);
        if update.is_empty() {
            return ProgressLine::Unrecognized(trimmed.to_string());
        }
        return ProgressLine::Stats(update);
    }

    if let Some(caps) = TRANSFERRING_RE.captures(trimmed) {
        return ProgressLine::FileEvent(FileEvent {
            name: caps[1].to_string(),
            percent: caps[2].parse().ok(),
        });
    }

    if let Some(caps) = LOG_LINE_RE.captures(trimmed) {
        let level = &caps[1];
        let payload = caps[2].to_string();
        return match level {
            "ERROR" | "CRITICAL" | "FATAL" => ProgressLine::ErrorLine(payload),
            "INFO" | "NOTICE" => {
                if let Some(action) = FILE_ACTION_RE.captures(&payload) {
                    ProgressLine::FileEvent(FileEvent {
                        name: action[1].to_string(),
                        percent: None,
                    })
                } else {
                    ProgressLine::Unrecognized(trimmed.to_string())
                }
            }
            _ => ProgressLine::Unrecognized(trimmed.to_string()),
        };
    }

    // Un-timestamped error lines show up when rclone is run with
    // `--log-format ""` or writes its final failure summary.
    if trimmed.starts_with("ERROR") || trimmed.starts_with("Failed to") {
        return ProgressLine::ErrorLine(trimmed.to_string());
    }

    ProgressLine::Unrecognized(trimmed.to_string())
}

/// Parse the comma-separated fields after `Transferred:`.
///
/// Two variants share the prefix: the byte line (`10.5 MiB / 100 MiB, 10%,
/// 1.2 MiB/s, ETA 75s`) and the file-count line (`3 / 10, 30%`). The byte
/// line always carries a unit suffix, which is the discriminator.
fn parse_stats_fields(rest: &str) -> StatsUpdate {
    let mut update = StatsUpdate::default();
    let mut parts = rest.split(',').map(str::trim);

    if let Some(first) = parts.next() {
        if let Some((done, total)) = first.split_once('/') {
            let done = done.trim();
            let total = total.trim();
            let has_unit =
                done.chars().any(|c| c.is_ascii_alphabetic()) || total.chars().any(|c| c.is_ascii_alphabetic());
            if has_unit {
                update.bytes = parse_size(done).map(|b| b.round() as u64);
                if total != "-" {
                    update.total_bytes = parse_size(total).map(|b| b.round() as u64);
                }
            } else {
                update.files_done = done.parse().ok();
                if total != "-" {
                    update.files_total = total.parse().ok();
                }
            }
        }
    }

    for part in parts {
        if let Some(eta) = part.strip_prefix("ETA") {
            update.eta = parse_eta(eta.trim());
        } else if let Some(rate) = part.strip_suffix("/s") {
            update.rate = parse_size(rate.trim());
        }
        // The percent field is derivable from bytes/total and ignored here.
    }

    update
}

/// Parse a size with rclone's unit vocabulary into bytes.
///
/// Binary suffixes (`Ki`, `MiB`, bare `K`/`M`/...) are 1024-based; explicit
/// decimal suffixes (`kB`, `MB`) are 1000-based. Returns `None` for `-`,
/// empty input, or an unknown suffix.
pub fn parse_size(text: &str) -> Option<f64> {
    let text = text.trim();
    if text.is_empty() || text == "-" {
        return None;
    }
    let caps = SIZE_RE.captures(text)?;
    let value: f64 = caps[1].parse().ok()?;
    let multiplier = match &caps[2] {
        "" | "B" => 1.0,
        "k" | "K" | "Ki" | "KiB" => 1024.0,
        "M" | "Mi" | "MiB" => 1024.0 * 1024.0,
        "G" | "Gi" | "GiB" => 1024.0 * 1024.0 * 1024.0,
        "T" | "Ti" | "TiB" => 1024.0_f64.powi(4),
        "P" | "Pi" | "PiB" => 1024.0_f64.powi(5),
        "kB" | "KB" => 1000.0,
        "MB" => 1000.0 * 1000.0,
        "GB" => 1000.0 * 1000.0 * 1000.0,
        "TB" => 1000.0_f64.powi(4),
        "PB" => 1000.0_f64.powi(5),
        _ => return None,
    };
    Some(value * multiplier)
}

/// Parse an ETA field (`75s`, `1m15s`, `2h3m`, `-`, bare seconds).
pub fn parse_eta(text: &str) -> Option<Duration> {
    let text = text.trim();
    if text.is_empty() || text == "-" {
        return None;
    }

    // Bare number of seconds.
    if let Ok(secs) = text.parse::<f64>() {
        return Some(Duration::from_secs_f64(secs.max(0.0)));
    }

    let mut total = 0.0_f64;
    let mut matched = false;
    for caps in ETA_SEGMENT_RE.captures_iter(text) {
        let value: f64 = caps[1].parse().ok()?;
        let unit = match &caps[2] {
            "d" => 86_400.0,
            "h" => 3_600.0,
            "m" => 60.0,
            "s" => 1.0,
            _ => return None,
        };
        total += value * unit;
        matched = true;
    }

    if matched {
        Some(Duration::from_secs_f64(total))
    } else {
        None
    }
}

/// Accumulates raw bytes and yields complete lines.
///
/// rclone redraws its progress block with carriage returns, so both `\n`
/// and `\r` terminate a line. Bytes after the last terminator stay buffered
/// until the next read, which makes the parser safe against lines split
/// across read boundaries.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of raw bytes; returns the complete lines it finished.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' || byte == b'\r' {
                if !self.buf.is_empty() {
                    lines.push(String::from_utf8_lossy(&self.buf).into_owned());
                    self.buf.clear();
                }
            } else {
                self.buf.push(byte);
            }
        }
        lines
    }

    /// Drain any trailing partial line at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        Some(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_line_full() {
        let line = "Transferred:   \t   10.5 MiB / 100 MiB, 10%, 1.2 MiB/s, ETA 75s";
        match classify(line) {
            ProgressLine::Stats(update) => {
                assert_eq!(update.bytes, Some((10.5 * 1024.0 * 1024.0) as u64));
                assert_eq!(update.total_bytes, Some(100 * 1024 * 1024));
                assert_eq!(update.rate, Some(1.2 * 1024.0 * 1024.0));
                assert_eq!(update.eta, Some(Duration::from_secs(75)));
            }
            other => panic!("expected stats, got {:?}", other),
        }
    }

    #[test]
    fn test_stats_line_file_counts() {
        match classify("Transferred:            3 / 10, 30%") {
            ProgressLine::Stats(update) => {
                assert_eq!(update.files_done, Some(3));
                assert_eq!(update.files_total, Some(10));
                assert_eq!(update.bytes, None);
            }
            other => panic!("expected stats, got {:?}", other),
        }
    }

    #[test]
    fn test_stats_line_unknown_total() {
        match classify("Transferred:       5.0 MiB / -, -, 512 KiB/s, ETA -") {
            ProgressLine::Stats(update) => {
                assert_eq!(update.bytes, Some(5 * 1024 * 1024));
                assert_eq!(update.total_bytes, None);
                assert_eq!(update.rate, Some(512.0 * 1024.0));
                assert_eq!(update.eta, None);
            }
            other => panic!("expected stats, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_stats_fields_are_absent_not_zero() {
        match classify("Transferred:       garbage / junk, x%, y/s, ETA z") {
            // Unit letters make this take the byte-line path; every field
            // fails to parse and must come back absent, not zeroed.
            ProgressLine::Stats(update) => {
                assert_eq!(update.bytes, None);
                assert_eq!(update.total_bytes, None);
                assert_eq!(update.rate, None);
                assert_eq!(update.eta, None);
            }
            ProgressLine::Unrecognized(_) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_transferring_entry() {
        let line = " *         photos/img_0001.jpg:  42% /2.1Mi, 1.2Mi/s, 1s";
        match classify(line) {
            ProgressLine::FileEvent(event) => {
                assert_eq!(event.name, "photos/img_0001.jpg");
                assert_eq!(event.percent, Some(42));
            }
            other => panic!("expected file event, got {:?}", other),
        }
    }

    #[test]
    fn test_error_log_line() {
        let line = "2024/01/02 15:04:05 ERROR : docs/report.pdf: Failed to copy: permission denied";
        match classify(line) {
            ProgressLine::ErrorLine(message) => {
                assert!(message.contains("docs/report.pdf"));
                assert!(message.contains("permission denied"));
            }
            other => panic!("expected error line, got {:?}", other),
        }
    }

    #[test]
    fn test_info_copied_line_is_file_event() {
        let line = "2024/01/02 15:04:05 INFO  : photos/img_0002.jpg: Copied (new)";
        match classify(line) {
            ProgressLine::FileEvent(event) => {
                assert_eq!(event.name, "photos/img_0002.jpg");
            }
            other => panic!("expected file event, got {:?}", other),
        }
    }

    #[test]
    fn test_unrecognized_lines_are_retained() {
        for line in [
            "Elapsed time:         9.5s",
            "Checks:                 0 / 0, -",
            "Transferring:",
            "some completely unexpected output",
        ] {
            match classify(line) {
                ProgressLine::Unrecognized(raw) => assert_eq!(raw, line),
                other => panic!("expected unrecognized for {:?}, got {:?}", line, other),
            }
        }
    }

    #[test]
    fn test_parse_size_units() {
        assert_eq!(parse_size("0"), Some(0.0));
        assert_eq!(parse_size("512 B"), Some(512.0));
        assert_eq!(parse_size("1 KiB"), Some(1024.0));
        assert_eq!(parse_size("1.5 MiB"), Some(1.5 * 1024.0 * 1024.0));
        assert_eq!(parse_size("2 GiB"), Some(2.0 * 1024.0 * 1024.0 * 1024.0));
        assert_eq!(parse_size("1 kB"), Some(1000.0));
        assert_eq!(parse_size("-"), None);
        assert_eq!(parse_size("1 XiB"), None);
    }

    #[test]
    fn test_parse_eta_formats() {
        assert_eq!(parse_eta("75s"), Some(Duration::from_secs(75)));
        assert_eq!(parse_eta("1m15s"), Some(Duration::from_secs(75)));
        assert_eq!(parse_eta("2h3m"), Some(Duration::from_secs(2 * 3600 + 180)));
        assert_eq!(parse_eta("90"), Some(Duration::from_secs(90)));
        assert_eq!(parse_eta("-"), None);
        assert_eq!(parse_eta("soon"), None);
    }

    #[test]
    fn test_line_buffer_partial_lines() {
        let mut buffer = LineBuffer::new();
        assert!(buffer.push(b"Transferred:  10.5 Mi").is_empty());
        let lines = buffer.push(b"B / 100 MiB, 10%, 1.2 MiB/s, ETA 75s\nTransfer");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("Transferred:"));
        assert!(lines[0].ends_with("ETA 75s"));
        assert_eq!(buffer.finish().as_deref(), Some("Transfer"));
        assert_eq!(buffer.finish(), None);
    }

    #[test]
    fn test_line_buffer_carriage_returns() {
        let mut buffer = LineBuffer::new();
        let lines = buffer.push(b"first\rsecond\r\nthird\n");
        assert_eq!(lines, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_classify_never_panics_on_junk() {
        for line in [
            "",
            "Transferred:",
            "Transferred: / ,,,,",
            "\u{fffd}\u{fffd}\u{fffd}",
            " * : %",
            "2024/13/99 99:99:99 WAT : ???",
        ] {
            let _ = classify(line);
        }
    }
}
