// src/trace/mod.rs

pub mod sink;

pub use sink::TraceSink;

use crate::config::ProxyConfig;
use crate::error::Result;
use crate::storage::lock::{harden_dir, harden_file, FileLock};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const TRACE_SCHEMA: u32 = 1;

/// Default window of recent entries for fairness scoring.
pub const DEFAULT_TRACE_WINDOW: usize = 200;

/// Error code recorded on a trace entry: either a named condition or the
/// raw upstream status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TraceErrorCode {
    Named(String),
    Status(u16),
}

impl TraceErrorCode {
    pub fn named(code: &str) -> Self {
        Self::Named(code.to_string())
    }
}

/// One line of the request trace. Append-only; consumed by external
/// validators and the trace viewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    #[serde(default = "default_schema")]
    pub schema: u32,
    pub ts: String,
    pub request_id: String,
    pub method: String,
    pub endpoint: String,
    pub status: u16,
    pub latency_ms: u64,
    pub key_label: String,
    pub key_hash: String,
    pub rotation_index: usize,
    #[serde(default)]
    pub prompt_hint: String,
    #[serde(default)]
    pub prompt_head: String,
    #[serde(default)]
    pub error_code: Option<TraceErrorCode>,
}

fn default_schema() -> u32 {
    TRACE_SCHEMA
}

/// File-level settings for the trace log, lifted out of the full config so
/// the sink task owns a small copy.
#[derive(Debug, Clone)]
pub struct TraceSettings {
    pub path: PathBuf,
    pub max_bytes: u64,
    pub max_backups: u32,
    pub enforce_permissions: bool,
}

impl TraceSettings {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            path: config.trace_file(),
            max_bytes: config.trace_max_bytes,
            max_backups: config.trace_max_backups,
            enforce_permissions: config.enforce_permissions,
        }
    }
}

/// Appends one entry, rotating first when the size threshold is crossed.
/// Rotation and append happen under the same file lock.
pub fn append_entry(settings: &TraceSettings, entry: &TraceEntry) -> Result<()> {
    let path = &settings.path;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
        if settings.enforce_permissions {
            harden_dir(parent);
        }
    }
    let line = serde_json::to_string(entry)?;

    let _lock = FileLock::acquire(path)?;
    rotate_if_needed(settings)?;
    let created = !path.exists();
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    if created && settings.enforce_permissions {
        harden_file(path);
    }
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    Ok(())
}

fn backup_path(path: &Path, n: u32) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|f| f.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{n}"));
    path.with_file_name(name)
}

/// Shifts `trace.jsonl.N` to `.N+1` (dropping the oldest) and moves the
/// live file to `.1`. With `max_backups <= 0` the file is deleted instead.
fn rotate_if_needed(settings: &TraceSettings) -> Result<()> {
    let path = &settings.path;
    if settings.max_bytes == 0 {
        return Ok(());
    }
    let Ok(meta) = fs::metadata(path) else {
        return Ok(());
    };
    if meta.len() < settings.max_bytes {
        return Ok(());
    }

    if settings.max_backups == 0 {
        fs::remove_file(path)?;
        return Ok(());
    }

    let oldest = backup_path(path, settings.max_backups);
    if oldest.exists() {
        fs::remove_file(&oldest)?;
    }
    for n in (1..settings.max_backups).rev() {
        let from = backup_path(path, n);
        if from.exists() {
            fs::rename(&from, backup_path(path, n + 1))?;
        }
    }
    fs::rename(path, backup_path(path, 1))?;
    Ok(())
}

/// Loads the last `window` parseable entries from a trace file. Unparseable
/// lines are skipped; a missing file is an empty trace.
pub fn load_recent_entries(path: &Path, window: usize) -> Vec<TraceEntry> {
    let Ok(raw) = fs::read_to_string(path) else {
        return Vec::new();
    };
    let lines: Vec<&str> = raw.lines().collect();
    let start = lines.len().saturating_sub(window);
    lines[start..]
        .iter()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}

/// Rotation-fairness confidence over a window of trace entries:
/// `100 - max(|count - expected| / expected) * 100`, where `expected` is the
/// uniform share per distinct label. Rounded to two decimals; an empty
/// window scores 100.
pub fn compute_confidence(entries: &[TraceEntry]) -> f64 {
    if entries.is_empty() {
        return 100.0;
    }
    let mut counts: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();
    for entry in entries {
        *counts.entry(entry.key_label.as_str()).or_default() += 1;
    }
    let total = entries.len() as f64;
    let expected = total / counts.len().max(1) as f64;
    if expected == 0.0 {
        return 100.0;
    }
    let max_dev = counts
        .values()
        .map(|&count| (count as f64 - expected).abs() / expected)
        .fold(0.0f64, f64::max);
    let confidence = (100.0 - max_dev * 100.0).max(0.0);
    (confidence * 100.0).round() / 100.0
}
