//! Sync progress reporting.
//!
//! Reports what the driver is doing batch by batch during `csync sync` and
//! `csync tick`. Progress is emitted on **stderr** so stdout remains parseable
//! for scripts.

use std::io::Write;

/// A single progress event for sync.
#[derive(Clone, Debug, PartialEq)]
pub enum SyncProgressEvent {
    /// Candidates counted; `background` tells which mode was chosen.
    Started { total: u64, background: bool },
    /// A batch was dispatched and marked.
    Batch {
        batch_index: u64,
        sent: usize,
        rejected: usize,
        processed: u64,
        total: u64,
    },
    /// The run finished successfully.
    Finished { processed: u64, elapsed_secs: f64 },
}

/// Reports sync progress. Implementations write to stderr (human or JSON).
pub trait SyncProgressReporter: Send + Sync {
    /// Emit a progress event. Called from the sync driver.
    fn report(&self, event: SyncProgressEvent);
}

/// Human-friendly progress on stderr: "sync  batch 3  150 / 1,200 items".
pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, event: SyncProgressEvent) {
        let line = match &event {
            SyncProgressEvent::Started { total, background } => format!(
                "sync  {} candidates ({})\n",
                format_number(*total),
                if *background { "background" } else { "direct" }
            ),
            SyncProgressEvent::Batch {
                batch_index,
                sent,
                rejected,
                processed,
                total,
            } => {
                let mut line = format!(
                    "sync  batch {}  {} / {} items  sent {}",
                    batch_index + 1,
                    format_number(*processed),
                    format_number(*total),
                    sent
                );
                if *rejected > 0 {
                    line.push_str(&format!("  rejected {}", rejected));
                }
                line.push('\n');
                line
            }
            SyncProgressEvent::Finished {
                processed,
                elapsed_secs,
            } => format!(
                "sync  done  {} items in {:.1}s\n",
                format_number(*processed),
                elapsed_secs
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl SyncProgressReporter for JsonProgress {
    fn report(&self, event: SyncProgressEvent) {
        let obj = match &event {
            SyncProgressEvent::Started { total, background } => serde_json::json!({
                "event": "started",
                "total": total,
                "mode": if *background { "background" } else { "direct" }
            }),
            SyncProgressEvent::Batch {
                batch_index,
                sent,
                rejected,
                processed,
                total,
            } => serde_json::json!({
                "event": "batch",
                "batch_index": batch_index,
                "sent": sent,
                "rejected": rejected,
                "processed": processed,
                "total": total
            }),
            SyncProgressEvent::Finished {
                processed,
                elapsed_secs,
            } => serde_json::json!({
                "event": "finished",
                "processed": processed,
                "elapsed_secs": elapsed_secs
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    /// Build a reporter for this mode. Caller hands it to the driver.
    pub fn reporter(&self) -> Box<dyn SyncProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1234567), "1,234,567");
    }
}
