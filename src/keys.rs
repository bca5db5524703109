// src/keys.rs

use crate::error::{AppError, Result};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};

/// One credential with a stable label. Constructed at load time from the
/// auth sources; never mutated afterwards.
#[derive(Debug, Clone)]
pub struct KeyRecord {
    pub label: String,
    secret: SecretString,
    /// First 12 hex chars of SHA-256 over the secret. Safe for traces.
    pub key_hash: String,
    /// Per-key upstream override. Host must pass the same allowlist as the
    /// global upstream.
    pub base_url: Option<String>,
    /// Higher sorts first.
    pub priority: i32,
    pub disabled: bool,
}

impl KeyRecord {
    pub fn new(label: impl Into<String>, secret: impl Into<String>) -> Self {
        let secret = secret.into();
        let key_hash = hash_secret(&secret);
        Self {
            label: label.into(),
            secret: SecretString::new(secret),
            key_hash,
            base_url: None,
            priority: 0,
            disabled: false,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// The raw secret, for the Dispatcher and the usage fetcher only.
    pub fn expose_secret(&self) -> &str {
        self.secret.expose_secret()
    }

    pub fn masked(&self) -> String {
        mask_key(self.secret.expose_secret())
    }
}

fn hash_secret(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..12].to_string()
}

/// Masks a secret for display: first five and last four characters around
/// three asterisks. Secrets too short to mask safely collapse to `***`.
pub fn mask_key(secret: &str) -> String {
    if secret.is_empty() {
        return String::new();
    }
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() < 10 {
        return "***".to_string();
    }
    let head: String = chars[..5].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}***{tail}")
}

/// Immutable ordered set of credentials. Order is priority descending, then
/// label ascending (case-insensitive), and is stable across loads.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    keys: Vec<KeyRecord>,
}

impl Registry {
    /// Sorts the records into registry order and rejects duplicate labels.
    pub fn new(mut records: Vec<KeyRecord>) -> Result<Self> {
        let mut seen = std::collections::HashSet::new();
        for record in &records {
            if !seen.insert(record.label.clone()) {
                return Err(AppError::Config(format!(
                    "duplicate key label '{}' in registry",
                    record.label
                )));
            }
        }
        records.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.label.to_lowercase().cmp(&b.label.to_lowercase()))
        });
        Ok(Self { keys: records })
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn keys(&self) -> &[KeyRecord] {
        &self.keys
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeyRecord> {
        self.keys.iter()
    }

    pub fn get(&self, index: usize) -> Option<&KeyRecord> {
        self.keys.get(index)
    }

    pub fn find_by_label(&self, label: &str) -> Option<&KeyRecord> {
        self.keys.iter().find(|key| key.label == label)
    }

    /// The credential at `active_index`, clamped into range; `None` when empty.
    pub fn active_key(&self, active_index: usize) -> Option<&KeyRecord> {
        if self.keys.is_empty() {
            return None;
        }
        let idx = active_index.min(self.keys.len() - 1);
        self.keys.get(idx)
    }
}
