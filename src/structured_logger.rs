//! JSONL lifecycle sink for offline inspection and event reconstruction.
//!
//! Every line carries:
//! - a monotonic sequence number, unique for the lifetime of the sink
//! - an ISO 8601 timestamp with microsecond precision
//! - the node id and the emitting component
//! - the structured event as JSON

use crate::engine::{LifecycleEvent, LifecycleSink};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

pub const LOG_FILE_NAME: &str = "lifecycle.jsonl";

/// Lifecycle sink appending one JSON object per line.
pub struct JsonlLifecycleSink {
    node_id: String,
    seq: AtomicU64,
    log_file: Mutex<File>,
    log_path: PathBuf,
}

/// A single log line.
#[derive(Debug, Serialize, Deserialize)]
pub struct LogEntry {
    pub seq: u64,
    /// ISO 8601 timestamp with microseconds
    pub ts: String,
    pub node_id: String,
    pub component: String,
    pub event: Value,
}

impl JsonlLifecycleSink {
    /// Opens `<logs_dir>/lifecycle.jsonl` for appending, creating the directory
    /// if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the file cannot
    /// be opened.
    pub fn new(node_id: &str, logs_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(logs_dir)?;
        let log_path = logs_dir.join(LOG_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        Ok(Self {
            node_id: node_id.to_string(),
            seq: AtomicU64::new(0),
            log_file: Mutex::new(file),
            log_path,
        })
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Writes an arbitrary structured record tagged with `component`.
    ///
    /// Thread-safe. Write failures are reported through `tracing` and
    /// otherwise ignored so a full disk never stalls the engine.
    pub fn log(&self, component: &str, event: impl Serialize) {
        // Sequence is taken under the lock so lines land in seq order.
        let mut file = self.log_file.lock();
        let entry = LogEntry {
            seq: self.next_seq(),
            ts: Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string(),
            node_id: self.node_id.clone(),
            component: component.to_string(),
            event: serde_json::to_value(event).unwrap_or(Value::Null),
        };

        let written = serde_json::to_string(&entry)
            .map_err(std::io::Error::from)
            .and_then(|line| writeln!(file, "{line}"))
            .and_then(|()| file.flush());
        if let Err(error) = written {
            tracing::warn!(path = %self.log_path.display(), %error, "Failed to write lifecycle log line");
        }
    }

    pub fn path(&self) -> &Path {
        &self.log_path
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

impl LifecycleSink for JsonlLifecycleSink {
    fn emit(&self, event: &LifecycleEvent) {
        self.log(event.component(), event);
    }
}

#[cfg(test)]
#[path = "tests/structured_logger_tests.rs"]
mod tests;
