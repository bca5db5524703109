// src/config/app.rs

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_BASE_PATH: &str = "/kmi-rotor/v1";
pub const DEFAULT_UPSTREAM_BASE_URL: &str = "https://api.kimi.com/coding/v1";
pub const DEFAULT_LISTEN: &str = "127.0.0.1:54123";

/// Full proxy configuration. Loaded from an optional YAML file, overridden
/// by `KMI_*` environment variables, and validated before the server starts.
#[derive(Debug, Deserialize, Clone, PartialEq, Serialize)]
pub struct ProxyConfig {
    /// `host:port` to bind. Non-local hosts require `allow_remote` and a token.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Base path of the catch-all proxy route.
    #[serde(default = "default_base_path")]
    pub base_path: String,
    #[serde(default = "default_upstream_base_url")]
    pub upstream_base_url: String,
    /// Hosts (exact or `*.domain`) allowed as upstream targets. Empty allows
    /// any https host.
    #[serde(default)]
    pub upstream_allowlist: Vec<String>,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Display zone for trace timestamps (`local`, `UTC`, `+03:00`, IANA name).
    #[serde(default = "default_time_zone")]
    pub time_zone: String,
    /// When true, never contact the upstream; selection and accounting still run.
    #[serde(default = "default_true")]
    pub dry_run: bool,
    /// Policy gate. When false, selection always uses "active or next eligible"
    /// regardless of the persisted `auto_rotate` flag.
    #[serde(default)]
    pub auto_rotate_allowed: bool,
    #[serde(default = "default_rotation_cooldown")]
    pub rotation_cooldown_seconds: u64,
    /// Shared secret required from clients when non-empty.
    #[serde(default)]
    pub proxy_token: String,
    #[serde(default)]
    pub allow_remote: bool,
    #[serde(default)]
    pub max_rps: i64,
    #[serde(default)]
    pub max_rpm: i64,
    #[serde(default)]
    pub max_rps_per_key: i64,
    #[serde(default)]
    pub max_rpm_per_key: i64,
    #[serde(default)]
    pub retry_max: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    /// Strict mode: keys without a health cache entry are not selectable.
    #[serde(default)]
    pub require_usage_before_request: bool,
    /// With strict mode, an entirely empty cache is treated as "unknown"
    /// instead of forbidding every key.
    #[serde(default = "default_true")]
    pub fail_open_on_empty_cache: bool,
    /// Whether the round-robin fallback pass may pick keys scored `warn`.
    #[serde(default = "default_true")]
    pub rotate_include_warn: bool,
    #[serde(default = "default_usage_cache_seconds")]
    pub usage_cache_seconds: u64,
    /// Block duration for payment-classified failures; `<= 0` blocks until
    /// manually cleared.
    #[serde(default = "default_payment_block_seconds")]
    pub payment_block_seconds: i64,
    /// Extra body tokens (beyond the built-in set) that classify a response
    /// as a billing failure.
    #[serde(default)]
    pub payment_error_tokens: Vec<String>,
    #[serde(default = "default_blocklist_recheck_seconds")]
    pub blocklist_recheck_seconds: u64,
    #[serde(default = "default_blocklist_recheck_max")]
    pub blocklist_recheck_max: usize,
    #[serde(default = "default_trace_max_bytes")]
    pub trace_max_bytes: u64,
    #[serde(default = "default_trace_max_backups")]
    pub trace_max_backups: u32,
    /// POSIX permission hardening for state files (0700 dirs / 0600 files).
    #[serde(default = "default_true")]
    pub enforce_permissions: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            base_path: default_base_path(),
            upstream_base_url: default_upstream_base_url(),
            upstream_allowlist: Vec::new(),
            state_dir: default_state_dir(),
            time_zone: default_time_zone(),
            dry_run: true,
            auto_rotate_allowed: false,
            rotation_cooldown_seconds: default_rotation_cooldown(),
            proxy_token: String::new(),
            allow_remote: false,
            max_rps: 0,
            max_rpm: 0,
            max_rps_per_key: 0,
            max_rpm_per_key: 0,
            retry_max: 0,
            retry_base_ms: default_retry_base_ms(),
            require_usage_before_request: false,
            fail_open_on_empty_cache: true,
            rotate_include_warn: true,
            usage_cache_seconds: default_usage_cache_seconds(),
            payment_block_seconds: default_payment_block_seconds(),
            payment_error_tokens: Vec::new(),
            blocklist_recheck_seconds: default_blocklist_recheck_seconds(),
            blocklist_recheck_max: default_blocklist_recheck_max(),
            trace_max_bytes: default_trace_max_bytes(),
            trace_max_backups: default_trace_max_backups(),
            enforce_permissions: true,
        }
    }
}

impl ProxyConfig {
    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join("state.json")
    }

    pub fn trace_file(&self) -> PathBuf {
        self.state_dir.join("trace").join("trace.jsonl")
    }
}

fn default_listen() -> String {
    DEFAULT_LISTEN.to_string()
}

fn default_base_path() -> String {
    DEFAULT_BASE_PATH.to_string()
}

fn default_upstream_base_url() -> String {
    DEFAULT_UPSTREAM_BASE_URL.to_string()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".kmi")
}

fn default_time_zone() -> String {
    "local".to_string()
}

fn default_true() -> bool {
    true
}

fn default_rotation_cooldown() -> u64 {
    300
}

fn default_retry_base_ms() -> u64 {
    250
}

fn default_usage_cache_seconds() -> u64 {
    30
}

fn default_payment_block_seconds() -> i64 {
    3600
}

fn default_blocklist_recheck_seconds() -> u64 {
    300
}

fn default_blocklist_recheck_max() -> usize {
    2
}

fn default_trace_max_bytes() -> u64 {
    5 * 1024 * 1024
}

fn default_trace_max_backups() -> u32 {
    3
}
