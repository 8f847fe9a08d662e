//! Logging helpers
//!
//! The library only emits `tracing` events; installing a subscriber is the
//! binary's job. Two helpers live here:
//!
//! - [`init_for_tests`]: an idempotent fmt subscriber wired to the test
//!   writer, so `cargo test -- --nocapture` shows engine logs.
//! - [`JsonlLayer`]: a layer appending one JSON object per event to a file,
//!   used by the CLI for `<data-dir>/logs/vaultsync.jsonl`.
//!
//! ```bash
//! # Every rejected record
//! jq 'select(.msg | test("authentication"))' logs/vaultsync.jsonl
//! ```

mod layer;

use std::io::{BufRead, BufReader};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

pub use layer::JsonlLayer;

/// One line of the JSONL event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// RFC 3339 timestamp with milliseconds
    pub ts: String,
    pub level: String,
    pub target: String,
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Value>,
}

impl LogEntry {
    pub fn new(level: impl Into<String>, target: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            level: level.into(),
            target: target.into(),
            msg: msg.into(),
            fields: None,
        }
    }

    /// Structured field by name, if recorded.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.as_ref()?.get(name)
    }
}

/// Read a JSONL log back. Lines that fail to parse are skipped.
pub fn read_log(path: impl AsRef<Path>) -> std::io::Result<Vec<LogEntry>> {
    let file = std::fs::File::open(path)?;
    let mut entries = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(entry) = serde_json::from_str(&line) {
            entries.push(entry);
        }
    }
    Ok(entries)
}

/// Install a test subscriber once per process; later calls are no-ops.
///
/// Honors `RUST_LOG`, defaulting to `vaultsync_core=debug`.
pub fn init_for_tests() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("vaultsync_core=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
