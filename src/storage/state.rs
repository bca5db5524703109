// src/storage/state.rs

use crate::config::ProxyConfig;
use crate::error::{AppError, Result};
use crate::keys::Registry;
use crate::storage::lock::{atomic_write, FileLock};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

pub const CURRENT_STATE_SCHEMA: u32 = 2;

/// Why a key is blocked from selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    Auth,
    PaymentRequired,
    Manual,
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auth => write!(f, "auth"),
            Self::PaymentRequired => write!(f, "payment_required"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// Mutable per-key accounting. Counters only move forward within a process
/// lifetime; zero does not mean "never failed" since state can be reset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyState {
    #[serde(default)]
    pub last_used: Option<DateTime<Utc>>,
    #[serde(default)]
    pub request_count: u64,
    #[serde(default)]
    pub err_401: u64,
    #[serde(default)]
    pub err_403: u64,
    #[serde(default)]
    pub err_429: u64,
    #[serde(default)]
    pub err_5xx: u64,
    #[serde(default)]
    pub exhausted_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub blocked_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub blocked_reason: Option<BlockReason>,
}

/// The singleton rotation state persisted as `<state_dir>/state.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationState {
    #[serde(default = "current_schema")]
    pub schema_version: u32,
    #[serde(default)]
    pub active_index: usize,
    #[serde(default)]
    pub rotation_index: usize,
    #[serde(default)]
    pub auto_rotate: bool,
    #[serde(default)]
    pub last_health_refresh: Option<DateTime<Utc>>,
    #[serde(default)]
    pub keys: BTreeMap<String, KeyState>,
}

fn current_schema() -> u32 {
    CURRENT_STATE_SCHEMA
}

impl Default for RotationState {
    fn default() -> Self {
        Self {
            schema_version: CURRENT_STATE_SCHEMA,
            active_index: 0,
            rotation_index: 0,
            auto_rotate: false,
            last_health_refresh: None,
            keys: BTreeMap::new(),
        }
    }
}

impl RotationState {
    pub fn key_state(&self, label: &str) -> Option<&KeyState> {
        self.keys.get(label)
    }

    pub fn mark_last_used(&mut self, label: &str) {
        self.keys.entry(label.to_string()).or_default().last_used = Some(Utc::now());
    }

    /// Bumps the request counter and the error counter matching `status`,
    /// and stamps `last_used`. Called exactly once per proxied request.
    pub fn record_request(&mut self, label: &str, status: u16) {
        let key_state = self.keys.entry(label.to_string()).or_default();
        key_state.request_count += 1;
        key_state.last_used = Some(Utc::now());
        match status {
            401 => key_state.err_401 += 1,
            403 => key_state.err_403 += 1,
            429 => key_state.err_429 += 1,
            500..=599 => key_state.err_5xx += 1,
            _ => {}
        }
    }

    pub fn mark_exhausted(&mut self, label: &str, cooldown_seconds: u64) {
        let until = Utc::now() + Duration::seconds(cooldown_seconds as i64);
        self.keys.entry(label.to_string()).or_default().exhausted_until = Some(until);
    }

    /// `block_seconds <= 0` blocks indefinitely; only a manual clear unblocks.
    pub fn mark_blocked(&mut self, label: &str, reason: BlockReason, block_seconds: i64) {
        let key_state = self.keys.entry(label.to_string()).or_default();
        key_state.blocked_reason = Some(reason);
        key_state.blocked_until = if block_seconds <= 0 {
            None
        } else {
            Some(Utc::now() + Duration::seconds(block_seconds))
        };
    }

    /// Clears the block on one label, or on every key when `label` is `None`.
    /// Returns how many keys were actually cleared.
    pub fn clear_blocked(&mut self, label: Option<&str>) -> usize {
        let mut cleared = 0;
        let labels: Vec<String> = match label {
            Some(l) => vec![l.to_string()],
            None => self.keys.keys().cloned().collect(),
        };
        for l in labels {
            if let Some(key_state) = self.keys.get_mut(&l) {
                if key_state.blocked_reason.is_some() || key_state.blocked_until.is_some() {
                    key_state.blocked_reason = None;
                    key_state.blocked_until = None;
                    cleared += 1;
                }
            }
        }
        cleared
    }

    pub fn is_blocked(&self, label: &str) -> bool {
        let Some(key_state) = self.keys.get(label) else {
            return false;
        };
        if key_state.blocked_reason.is_none() && key_state.blocked_until.is_none() {
            return false;
        }
        match key_state.blocked_until {
            Some(until) => Utc::now() < until,
            None => true,
        }
    }

    pub fn is_exhausted(&self, label: &str) -> bool {
        self.keys
            .get(label)
            .and_then(|k| k.exhausted_until)
            .is_some_and(|until| Utc::now() < until)
    }
}

/// Applies schema migrations to a raw state document. Each step is a pure
/// `doc -> doc` function raising the version by one. Documents newer than
/// this build refuse to load.
pub fn migrate_document(mut doc: Value) -> Result<Value> {
    let mut version = doc
        .get("schema_version")
        .and_then(Value::as_u64)
        .unwrap_or(1) as u32;
    if version > CURRENT_STATE_SCHEMA {
        return Err(AppError::StateSchemaTooNew {
            found: version,
            supported: CURRENT_STATE_SCHEMA,
        });
    }
    while version < CURRENT_STATE_SCHEMA {
        doc = match version {
            1 => migrate_v1_to_v2(doc),
            other => {
                return Err(AppError::Internal(format!(
                    "no migration registered from state schema {other}"
                )))
            }
        };
        version += 1;
    }
    Ok(doc)
}

/// v1 named the error counters `error_401`-style and predates block fields
/// and the health refresh stamp. Renames counters; serde defaults fill the
/// rest.
fn migrate_v1_to_v2(mut doc: Value) -> Value {
    const RENAMES: [(&str, &str); 4] = [
        ("error_401", "err_401"),
        ("error_403", "err_403"),
        ("error_429", "err_429"),
        ("error_5xx", "err_5xx"),
    ];
    if let Some(keys) = doc.get_mut("keys").and_then(Value::as_object_mut) {
        for key_doc in keys.values_mut() {
            if let Some(map) = key_doc.as_object_mut() {
                for (old, new) in RENAMES {
                    if let Some(value) = map.remove(old) {
                        map.entry(new.to_string()).or_insert(value);
                    }
                }
            }
        }
    }
    if let Some(map) = doc.as_object_mut() {
        map.insert("schema_version".to_string(), Value::from(2u32));
    }
    doc
}

/// Loads rotation state from disk under the file lock.
///
/// A missing file yields a fresh zeroed state. A corrupt file is moved aside
/// with a timestamped suffix and replaced by zeroed state. Registry labels
/// missing from the document are initialized; orphan labels are left intact.
pub fn load_state(config: &ProxyConfig, registry: &Registry) -> Result<RotationState> {
    let path = config.state_file();
    let mut changed = false;

    let mut state = if path.exists() {
        let _lock = FileLock::acquire(&path)?;
        match read_document(&path) {
            Ok(doc) => {
                let migrated = migrate_document(doc)?;
                match serde_json::from_value::<RotationState>(migrated) {
                    Ok(mut state) => {
                        state.schema_version = CURRENT_STATE_SCHEMA;
                        state
                    }
                    Err(e) => {
                        move_corrupt_aside(&path, &e.to_string())?;
                        changed = true;
                        RotationState::default()
                    }
                }
            }
            Err(ReadError::Corrupt(detail)) => {
                move_corrupt_aside(&path, &detail)?;
                changed = true;
                RotationState::default()
            }
            Err(ReadError::Io(e)) => return Err(e.into()),
        }
    } else {
        changed = true;
        RotationState::default()
    };

    for key in registry.iter() {
        if !state.keys.contains_key(&key.label) {
            state.keys.insert(key.label.clone(), KeyState::default());
            changed = true;
        }
    }

    let clamped_active = clamp_index(state.active_index, registry.len());
    if clamped_active != state.active_index {
        state.active_index = clamped_active;
        changed = true;
    }
    let clamped_rotation = clamp_index(state.rotation_index, registry.len());
    if clamped_rotation != state.rotation_index {
        state.rotation_index = clamped_rotation;
        changed = true;
    }

    if changed {
        save_state(config, &state)?;
    }
    Ok(state)
}

fn clamp_index(index: usize, len: usize) -> usize {
    if len == 0 {
        0
    } else {
        index.min(len - 1)
    }
}

enum ReadError {
    Corrupt(String),
    Io(std::io::Error),
}

fn read_document(path: &Path) -> std::result::Result<Value, ReadError> {
    let raw = std::fs::read_to_string(path).map_err(ReadError::Io)?;
    serde_json::from_str(&raw).map_err(|e| ReadError::Corrupt(e.to_string()))
}

fn move_corrupt_aside(path: &Path, detail: &str) -> Result<()> {
    let stamp = Utc::now().format("%Y%m%d%H%M%S");
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".corrupt.{stamp}"));
    let aside = path.with_file_name(name);
    warn!(
        path = %path.display(),
        moved_to = %aside.display(),
        error = %detail,
        "State file is corrupt; starting from zeroed state"
    );
    std::fs::rename(path, &aside)?;
    Ok(())
}

/// Serializes the full document and writes it atomically under the file lock.
pub fn save_state(config: &ProxyConfig, state: &RotationState) -> Result<()> {
    let path = config.state_file();
    let mut payload = serde_json::to_vec_pretty(state)?;
    payload.push(b'\n');
    let _lock = FileLock::acquire(&path)?;
    atomic_write(&path, &payload, config.enforce_permissions)?;
    Ok(())
}

/// Loads state and logs the reconciliation outcome. Startup convenience.
pub fn load_state_logged(config: &ProxyConfig, registry: &Registry) -> Result<RotationState> {
    let state = load_state(config, registry)?;
    info!(
        keys = state.keys.len(),
        active_index = state.active_index,
        rotation_index = state.rotation_index,
        auto_rotate = state.auto_rotate,
        "Rotation state loaded"
    );
    Ok(state)
}
