// src/config/validation.rs

use crate::config::ProxyConfig;
use crate::error::{AppError, Result};
use url::Url;

/// Validates the assembled configuration before any component consumes it.
pub struct ConfigValidator;

impl ConfigValidator {
    pub fn validate(config: &ProxyConfig) -> Result<()> {
        validate_listen(&config.listen)?;
        validate_base_path(&config.base_path)?;
        validate_base_url(
            "upstream_base_url",
            &config.upstream_base_url,
            &config.upstream_allowlist,
        )?;
        if config.usage_cache_seconds == 0 {
            return Err(AppError::Config(
                "usage_cache_seconds must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn validate_listen(listen: &str) -> Result<(String, u16)> {
    let (host, port) = listen.rsplit_once(':').ok_or_else(|| {
        AppError::Config(format!("listen '{listen}' must be in host:port form"))
    })?;
    if host.is_empty() {
        return Err(AppError::Config(format!(
            "listen '{listen}' is missing a host"
        )));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| AppError::Config(format!("listen '{listen}' has an invalid port")))?;
    Ok((host.to_string(), port))
}

pub fn validate_base_path(value: &str) -> Result<()> {
    if value.is_empty() || !value.starts_with('/') {
        return Err(AppError::Config(format!(
            "base_path '{value}' must start with '/'"
        )));
    }
    if value.len() > 1 && value.ends_with('/') {
        return Err(AppError::Config(format!(
            "base_path '{value}' must not end with '/'"
        )));
    }
    Ok(())
}

/// A host is allowed when the allowlist is empty (any https host), matches
/// exactly, or matches a `*.domain` wildcard entry.
pub fn host_allowed(host: &str, allowlist: &[String]) -> bool {
    if allowlist.is_empty() {
        return true;
    }
    let host = host.to_ascii_lowercase();
    allowlist.iter().any(|entry| {
        let entry = entry.trim().to_ascii_lowercase();
        if let Some(suffix) = entry.strip_prefix("*.") {
            host.ends_with(&format!(".{suffix}")) || host == suffix
        } else {
            host == entry
        }
    })
}

/// Validates an upstream base URL: parseable, has a host, and uses https
/// unless the host is explicitly allowlisted.
pub fn validate_base_url(name: &str, value: &str, allowlist: &[String]) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(AppError::Config(format!("{name} must not be empty")));
    }
    let parsed = Url::parse(trimmed)
        .map_err(|e| AppError::Config(format!("{name} '{trimmed}' is not a valid URL: {e}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::Config(format!("{name} must include a host")))?;
    if !host_allowed(host, allowlist) {
        return Err(AppError::Config(format!(
            "{name} host '{host}' is not in the upstream allowlist"
        )));
    }
    if parsed.scheme() != "https" && allowlist.is_empty() {
        return Err(AppError::Config(format!("{name} must use https://")));
    }
    Ok(trimmed.trim_end_matches('/').to_string())
}

pub fn is_local_host(host: &str) -> bool {
    matches!(host, "127.0.0.1" | "localhost" | "::1")
}
