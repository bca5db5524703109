// src/config/loader.rs

use crate::config::{ConfigValidator, ProxyConfig};
use crate::error::{AppError, Result};
use std::path::Path;
use tracing::{debug, info, warn};

/// Load configuration from an optional YAML file, then apply `KMI_*`
/// environment overrides and validate the result.
pub fn load_config(config_path: &Path) -> Result<ProxyConfig> {
    let mut config = if config_path.exists() {
        info!(config.path = %config_path.display(), "Loading configuration from file");
        load_from_file(config_path)?
    } else {
        info!("Configuration file not found, using defaults");
        ProxyConfig::default()
    };

    override_with_env(&mut config);
    ConfigValidator::validate(&config)?;

    debug!("Configuration loaded and validated successfully");
    Ok(config)
}

fn load_from_file(config_path: &Path) -> Result<ProxyConfig> {
    let content = std::fs::read_to_string(config_path).map_err(|e| {
        AppError::Config(format!(
            "failed to read config file {}: {e}",
            config_path.display()
        ))
    })?;
    serde_yaml::from_str(&content).map_err(AppError::from)
}

fn env_string(name: &str, target: &mut String) {
    if let Ok(value) = std::env::var(name) {
        *target = value;
    }
}

fn env_bool(name: &str, target: &mut bool) {
    if let Ok(value) = std::env::var(name) {
        *target = matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        );
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, target: &mut T) {
    if let Ok(value) = std::env::var(name) {
        match value.trim().parse::<T>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(variable = name, value = %value, "Ignoring unparsable environment override"),
        }
    }
}

fn override_with_env(config: &mut ProxyConfig) {
    env_string("KMI_PROXY_LISTEN", &mut config.listen);
    env_string("KMI_PROXY_BASE_PATH", &mut config.base_path);
    env_string("KMI_UPSTREAM_BASE_URL", &mut config.upstream_base_url);
    env_string("KMI_PROXY_TOKEN", &mut config.proxy_token);
    env_string("KMI_TIME_ZONE", &mut config.time_zone);
    if let Ok(value) = std::env::var("KMI_UPSTREAM_ALLOWLIST") {
        config.upstream_allowlist = value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
    }
    if let Ok(value) = std::env::var("KMI_STATE_DIR") {
        config.state_dir = value.into();
    }
    env_bool("KMI_DRY_RUN", &mut config.dry_run);
    env_bool("KMI_AUTO_ROTATE_ALLOWED", &mut config.auto_rotate_allowed);
    env_bool("KMI_PROXY_ALLOW_REMOTE", &mut config.allow_remote);
    env_bool(
        "KMI_REQUIRE_USAGE_BEFORE_REQUEST",
        &mut config.require_usage_before_request,
    );
    env_bool(
        "KMI_FAIL_OPEN_ON_EMPTY_CACHE",
        &mut config.fail_open_on_empty_cache,
    );
    env_bool("KMI_ROTATE_INCLUDE_WARN", &mut config.rotate_include_warn);
    env_bool("KMI_ENFORCE_PERMISSIONS", &mut config.enforce_permissions);
    env_parse(
        "KMI_ROTATION_COOLDOWN_SECONDS",
        &mut config.rotation_cooldown_seconds,
    );
    env_parse("KMI_PROXY_MAX_RPS", &mut config.max_rps);
    env_parse("KMI_PROXY_MAX_RPM", &mut config.max_rpm);
    env_parse("KMI_PROXY_MAX_RPS_PER_KEY", &mut config.max_rps_per_key);
    env_parse("KMI_PROXY_MAX_RPM_PER_KEY", &mut config.max_rpm_per_key);
    env_parse("KMI_PROXY_RETRY_MAX", &mut config.retry_max);
    env_parse("KMI_PROXY_RETRY_BASE_MS", &mut config.retry_base_ms);
    env_parse("KMI_USAGE_CACHE_SECONDS", &mut config.usage_cache_seconds);
    env_parse(
        "KMI_PAYMENT_BLOCK_SECONDS",
        &mut config.payment_block_seconds,
    );
    env_parse(
        "KMI_BLOCKLIST_RECHECK_SECONDS",
        &mut config.blocklist_recheck_seconds,
    );
    env_parse(
        "KMI_BLOCKLIST_RECHECK_MAX",
        &mut config.blocklist_recheck_max,
    );
    env_parse("KMI_TRACE_MAX_BYTES", &mut config.trace_max_bytes);
    env_parse("KMI_TRACE_BACKUPS", &mut config.trace_max_backups);
}
