// src/health/mod.rs

pub mod refresher;

pub use refresher::{HealthCache, Refresher};

use crate::storage::KeyState;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Health classification used by selection preference and operator views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warn,
    Blocked,
    Exhausted,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Warn => write!(f, "warn"),
            Self::Blocked => write!(f, "blocked"),
            Self::Exhausted => write!(f, "exhausted"),
        }
    }
}

/// One window-specific limit from the upstream usage payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitInfo {
    pub label: String,
    pub used: Option<u64>,
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
    pub reset_hint: Option<String>,
    pub window_hours: Option<f64>,
}

/// Immutable usage snapshot parsed from the upstream `/usages` payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Usage {
    pub remaining_percent: Option<f64>,
    pub used: Option<u64>,
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
    pub reset_hint: Option<String>,
    pub limits: Vec<LimitInfo>,
    /// Original payload, retained for debugging only.
    pub raw: Value,
    /// Account email if the payload carries one; observability only.
    pub email: Option<String>,
}

/// Derived per-key health, stored in the cache and superseded on refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthInfo {
    pub status: HealthStatus,
    pub remaining_percent: Option<f64>,
    pub used: Option<u64>,
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
    pub reset_hint: Option<String>,
    pub limits: Vec<LimitInfo>,
    /// Lifetime `(403 + 429 + 5xx) / requests` as surfaced to operators.
    pub error_rate: f64,
    /// Whether the latest usage fetch for this key succeeded. Strict
    /// selection mode requires this.
    pub usage_ok: bool,
    pub email: Option<String>,
}

fn to_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }
}

fn to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn percent_of(remaining: f64, total: f64) -> f64 {
    if total > 0.0 {
        (remaining / total) * 100.0
    } else {
        0.0
    }
}

/// Explicit percent forms: a top-level `remaining_percent`, a top-level
/// `(remaining, total)` pair, or the same pair nested under `data`.
fn extract_remaining_percent(payload: &Value) -> Option<f64> {
    if let Some(value) = payload.get("remaining_percent") {
        return to_f64(value);
    }
    if let (Some(remaining), Some(total)) = (payload.get("remaining"), payload.get("total")) {
        let remaining = to_f64(remaining)?;
        let total = to_f64(total)?;
        return Some(percent_of(remaining, total));
    }
    let data = payload.get("data")?.as_object()?;
    let total = to_f64(data.get("total")?)?;
    for key in ["remaining", "remaining_quota", "remain"] {
        if let Some(value) = data.get(key) {
            let remaining = to_f64(value)?;
            return Some(percent_of(remaining, total));
        }
    }
    None
}

fn extract_reset_hint(payload: &Value) -> Option<String> {
    for key in ["reset_at", "resetAt", "reset_time", "resetTime"] {
        if let Some(value) = payload.get(key) {
            if !value.is_null() {
                return Some(match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                });
            }
        }
    }
    for key in ["reset_in", "resetIn", "ttl", "window"] {
        if let Some(value) = payload.get(key) {
            if !value.is_null() {
                let rendered = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                return Some(format!("resets in {rendered}s"));
            }
        }
    }
    None
}

fn looks_like_email(value: &Value) -> Option<String> {
    let s = value.as_str()?;
    if s.contains('@') && s.contains('.') {
        Some(s.trim().to_string())
    } else {
        None
    }
}

/// Recognizes an account email under common key names at the top level or
/// nested under `data` / `account`.
fn extract_email(payload: &Value) -> Option<String> {
    const EMAIL_KEYS: [&str; 3] = ["email", "account_email", "user_email"];
    let scopes = [Some(payload), payload.get("data"), payload.get("account")];
    for scope in scopes.into_iter().flatten() {
        for key in EMAIL_KEYS {
            if let Some(email) = scope.get(key).and_then(looks_like_email) {
                return Some(email);
            }
        }
    }
    None
}

fn window_hours(window: &Value) -> Option<f64> {
    let duration = to_u64(window.get("duration")?)? as f64;
    let unit = window
        .get("timeUnit")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_uppercase();
    if unit.contains("MINUTE") {
        Some(duration / 60.0)
    } else if unit.contains("HOUR") {
        Some(duration)
    } else if unit.contains("DAY") {
        Some(duration * 24.0)
    } else if unit.contains("WEEK") {
        Some(duration * 24.0 * 7.0)
    } else {
        None
    }
}

fn limit_label(item: &Value, detail: &Value, window: &Value, idx: usize) -> String {
    for key in ["name", "title", "scope"] {
        for source in [item, detail] {
            if let Some(value) = source.get(key).and_then(Value::as_str) {
                if !value.is_empty() {
                    return value.to_string();
                }
            }
        }
    }
    if let Some(hours) = window_hours(window) {
        if hours >= 24.0 && hours % 24.0 == 0.0 {
            return format!("{}d limit", (hours / 24.0) as u64);
        }
        if hours.fract() == 0.0 {
            return format!("{}h limit", hours as u64);
        }
        return format!("{hours:.1}h limit");
    }
    format!("Limit #{}", idx + 1)
}

fn parse_limits(payload: &Value) -> Vec<LimitInfo> {
    static NULL_WINDOW: Value = Value::Null;
    let Some(items) = payload.get("limits").and_then(Value::as_array) else {
        return Vec::new();
    };
    let mut limits = Vec::new();
    for (idx, item) in items.iter().enumerate() {
        if !item.is_object() {
            continue;
        }
        let detail = match item.get("detail") {
            Some(d) if d.is_object() => d,
            _ => item,
        };
        let window = item
            .get("window")
            .filter(|w| w.is_object())
            .unwrap_or(&NULL_WINDOW);
        limits.push(LimitInfo {
            label: limit_label(item, detail, window, idx),
            used: detail.get("used").and_then(to_u64),
            limit: detail.get("limit").and_then(to_u64),
            remaining: detail.get("remaining").and_then(to_u64),
            reset_hint: extract_reset_hint(detail),
            window_hours: window_hours(window),
        });
    }
    limits
}

type UsageSummary = (Option<u64>, Option<u64>, Option<u64>, Option<String>);

fn extract_usage_summary(payload: &Value) -> UsageSummary {
    let mut used = None;
    let mut limit = None;
    let mut remaining = None;
    let mut reset_hint = None;

    if let Some(usage) = payload.get("usage").filter(|u| u.is_object()) {
        used = usage.get("used").and_then(to_u64);
        limit = usage.get("limit").and_then(to_u64);
        remaining = usage.get("remaining").and_then(to_u64);
        reset_hint = extract_reset_hint(usage);
    }

    if let Some(first) = payload
        .get("limits")
        .and_then(Value::as_array)
        .and_then(|items| items.first())
        .filter(|item| item.is_object())
    {
        let detail = match first.get("detail") {
            Some(d) if d.is_object() => d,
            _ => first,
        };
        used = used.or_else(|| detail.get("used").and_then(to_u64));
        limit = limit.or_else(|| detail.get("limit").and_then(to_u64));
        remaining = remaining.or_else(|| detail.get("remaining").and_then(to_u64));
        if reset_hint.is_none() {
            reset_hint = extract_reset_hint(detail);
        }
    }

    (used, limit, remaining, reset_hint)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Parses a usage payload of any of the recognized shapes into a snapshot.
///
/// When an explicit percent and a `(used, limit)`-derived percent disagree
/// by more than one point, the derived value wins.
pub fn parse_usage(payload: Value) -> Usage {
    let limits = parse_limits(&payload);
    let email = extract_email(&payload);
    let (mut used, mut limit, mut remaining, reset_hint) = extract_usage_summary(&payload);
    let mut remaining_percent = extract_remaining_percent(&payload);

    if remaining_percent.is_none() {
        if let (Some(r), Some(l)) = (remaining, limit) {
            if l > 0 {
                remaining_percent = Some(round2(percent_of(r as f64, l as f64)));
            }
        }
    }
    if remaining_percent.is_none() {
        if let (Some(u), Some(l)) = (used, limit) {
            if l > 0 {
                let r = remaining.unwrap_or(l.saturating_sub(u));
                remaining = Some(r);
                remaining_percent = Some(round2(percent_of(r as f64, l as f64)));
            }
        }
    }
    if let (Some(percent), Some(u), Some(l)) = (remaining_percent, used, limit) {
        if l > 0 {
            let computed = round2(percent_of(l.saturating_sub(u) as f64, l as f64));
            if (percent - computed).abs() > 1.0 {
                remaining_percent = Some(computed);
            }
        }
    }
    if remaining_percent.is_none() && !limits.is_empty() {
        // Fall back to the broadest declared window.
        let candidate = limits
            .iter()
            .filter(|l| l.limit.is_some())
            .max_by(|a, b| {
                let wa = a.window_hours.unwrap_or(-1.0);
                let wb = b.window_hours.unwrap_or(-1.0);
                wa.partial_cmp(&wb).unwrap_or(std::cmp::Ordering::Equal)
            });
        if let Some(candidate) = candidate {
            let l = candidate.limit.unwrap_or(0);
            used = used.or(candidate.used);
            limit = limit.or(candidate.limit);
            remaining = remaining.or(candidate.remaining);
            if let (Some(u), true) = (used, l > 0) {
                let r = remaining.unwrap_or(l.saturating_sub(u));
                remaining = Some(r);
                remaining_percent = Some(round2(percent_of(r as f64, l as f64)));
            }
        }
    }

    Usage {
        remaining_percent,
        used,
        limit,
        remaining,
        reset_hint,
        limits,
        raw: payload,
        email,
    }
}

/// Synthesized full-quota snapshot used when `dry_run` is on.
pub fn dry_run_usage() -> Usage {
    Usage {
        remaining_percent: Some(100.0),
        used: Some(0),
        limit: Some(100),
        remaining: Some(100),
        reset_hint: None,
        limits: Vec::new(),
        raw: serde_json::json!({"dry_run": true}),
        email: None,
    }
}

/// Fetches `GET <base_url>/usages` for one key. Failures are logged and
/// yield `None`; the caller decides whether to keep a prior cache entry.
pub async fn fetch_usage(
    client: &Client,
    base_url: &str,
    secret: &SecretString,
    dry_run: bool,
    label: &str,
) -> Option<Usage> {
    if dry_run {
        return Some(dry_run_usage());
    }
    let url = format!("{}/usages", base_url.trim_end_matches('/'));
    let result = client
        .get(&url)
        .bearer_auth(secret.expose_secret())
        .send()
        .await
        .and_then(|resp| resp.error_for_status());
    let response = match result {
        Ok(resp) => resp,
        Err(e) => {
            warn!(key_label = %label, error = %e, "Usage fetch failed");
            return None;
        }
    };
    let payload: Value = match response.json().await {
        Ok(payload) => payload,
        Err(e) => {
            warn!(key_label = %label, error = %e, "Usage payload was not valid JSON");
            return None;
        }
    };
    Some(parse_usage(payload))
}

/// Classifies a key from its usage snapshot and accounting counters.
/// The scoring error rate counts only 429s and 5xx failures.
pub fn score_key(
    usage: Option<&Usage>,
    key_state: &KeyState,
    exhausted: bool,
    blocked: bool,
) -> HealthStatus {
    if blocked {
        return HealthStatus::Blocked;
    }
    if exhausted {
        return HealthStatus::Exhausted;
    }
    if key_state.err_401 > 0 {
        return HealthStatus::Blocked;
    }
    if let Some(percent) = usage.and_then(|u| u.remaining_percent) {
        if percent <= 0.0 {
            return HealthStatus::Blocked;
        }
    }
    if key_state.err_403 > 0 {
        return HealthStatus::Warn;
    }
    let Some(usage) = usage else {
        return HealthStatus::Warn;
    };
    if usage.remaining_percent.is_some_and(|p| p < 20.0) {
        return HealthStatus::Warn;
    }
    let total = key_state.request_count.max(1) as f64;
    let error_rate = (key_state.err_429 + key_state.err_5xx) as f64 / total;
    if key_state.err_429 > 0 || key_state.err_5xx > 0 || error_rate >= 0.05 {
        return HealthStatus::Warn;
    }
    HealthStatus::Healthy
}

/// Assembles the cache entry for one key.
pub fn build_health_info(
    usage: Option<Usage>,
    key_state: &KeyState,
    exhausted: bool,
    blocked: bool,
) -> HealthInfo {
    let status = score_key(usage.as_ref(), key_state, exhausted, blocked);
    let total = key_state.request_count.max(1) as f64;
    let error_rate = (key_state.err_403 + key_state.err_429 + key_state.err_5xx) as f64 / total;
    match usage {
        Some(usage) => HealthInfo {
            status,
            remaining_percent: usage.remaining_percent,
            used: usage.used,
            limit: usage.limit,
            remaining: usage.remaining,
            reset_hint: usage.reset_hint,
            limits: usage.limits,
            error_rate,
            usage_ok: true,
            email: usage.email,
        },
        None => HealthInfo {
            status,
            remaining_percent: None,
            used: None,
            limit: None,
            remaining: None,
            reset_hint: None,
            limits: Vec::new(),
            error_rate,
            usage_ok: false,
            email: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn explicit_remaining_percent_wins() {
        let usage = parse_usage(json!({"remaining_percent": 73.5}));
        assert_eq!(usage.remaining_percent, Some(73.5));
    }

    #[test]
    fn remaining_total_pair_computes_percent() {
        let usage = parse_usage(json!({"remaining": 25, "total": 100}));
        assert_eq!(usage.remaining_percent, Some(25.0));
        let usage = parse_usage(json!({"data": {"remaining_quota": 50, "total": 200}}));
        assert_eq!(usage.remaining_percent, Some(25.0));
    }

    #[test]
    fn used_limit_pair_derives_remaining() {
        let usage = parse_usage(json!({"usage": {"used": 30, "limit": 120}}));
        assert_eq!(usage.used, Some(30));
        assert_eq!(usage.limit, Some(120));
        assert_eq!(usage.remaining, Some(90));
        assert_eq!(usage.remaining_percent, Some(75.0));
    }

    #[test]
    fn disagreement_over_one_point_prefers_derived_value() {
        let usage = parse_usage(json!({
            "remaining_percent": 90.0,
            "usage": {"used": 50, "limit": 100}
        }));
        assert_eq!(usage.remaining_percent, Some(50.0));
    }

    #[test]
    fn small_disagreement_keeps_explicit_value() {
        let usage = parse_usage(json!({
            "remaining_percent": 50.5,
            "usage": {"used": 50, "limit": 100}
        }));
        assert_eq!(usage.remaining_percent, Some(50.5));
    }

    #[test]
    fn windowed_limits_prefer_the_largest_window() {
        let usage = parse_usage(json!({
            "limits": [
                {
                    "detail": {"used": 9, "limit": 10},
                    "window": {"duration": 1, "timeUnit": "HOUR"}
                },
                {
                    "detail": {"used": 100, "limit": 1000},
                    "window": {"duration": 7, "timeUnit": "DAY"}
                }
            ]
        }));
        // The summary row comes from the first limit; the percent fallback
        // would use the weekly window if the first had no usable pair.
        assert_eq!(usage.limits.len(), 2);
        assert_eq!(usage.limits[1].window_hours, Some(168.0));
        assert_eq!(usage.remaining_percent, Some(10.0));
    }

    #[test]
    fn limit_labels_from_names_and_windows() {
        let usage = parse_usage(json!({
            "limits": [
                {"name": "daily", "detail": {"limit": 10}},
                {"detail": {"limit": 10}, "window": {"duration": 3, "timeUnit": "DAY"}},
                {"detail": {"limit": 10}, "window": {"duration": 90, "timeUnit": "MINUTE"}},
                {"detail": {"limit": 10}}
            ]
        }));
        let labels: Vec<&str> = usage.limits.iter().map(|l| l.label.as_str()).collect();
        assert_eq!(labels, ["daily", "3d limit", "1.5h limit", "Limit #4"]);
    }

    #[test]
    fn reset_hints_cover_absolute_and_relative_forms() {
        let usage = parse_usage(json!({"usage": {"used": 1, "limit": 2, "reset_at": "2024-03-01T00:00:00Z"}}));
        assert_eq!(usage.reset_hint.as_deref(), Some("2024-03-01T00:00:00Z"));
        let usage = parse_usage(json!({"usage": {"used": 1, "limit": 2, "ttl": 3600}}));
        assert_eq!(usage.reset_hint.as_deref(), Some("resets in 3600s"));
    }

    #[test]
    fn email_is_found_in_nested_scopes() {
        let usage = parse_usage(json!({"account": {"user_email": "dev@example.com"}}));
        assert_eq!(usage.email.as_deref(), Some("dev@example.com"));
        let usage = parse_usage(json!({"email": "not-an-email"}));
        assert_eq!(usage.email, None);
    }

    fn key_state(count: u64, e401: u64, e403: u64, e429: u64, e5xx: u64) -> KeyState {
        KeyState {
            request_count: count,
            err_401: e401,
            err_403: e403,
            err_429: e429,
            err_5xx: e5xx,
            ..KeyState::default()
        }
    }

    fn full_usage(percent: f64) -> Usage {
        Usage {
            remaining_percent: Some(percent),
            ..dry_run_usage()
        }
    }

    #[test]
    fn scoring_order_matches_the_table() {
        let clean = key_state(100, 0, 0, 0, 0);
        let usage = full_usage(80.0);

        assert_eq!(
            score_key(Some(&usage), &clean, false, true),
            HealthStatus::Blocked
        );
        assert_eq!(
            score_key(Some(&usage), &clean, true, false),
            HealthStatus::Exhausted
        );
        assert_eq!(
            score_key(Some(&usage), &key_state(10, 1, 0, 0, 0), false, false),
            HealthStatus::Blocked
        );
        assert_eq!(
            score_key(Some(&full_usage(0.0)), &clean, false, false),
            HealthStatus::Blocked
        );
        assert_eq!(
            score_key(Some(&usage), &key_state(10, 0, 1, 0, 0), false, false),
            HealthStatus::Warn
        );
        assert_eq!(score_key(None, &clean, false, false), HealthStatus::Warn);
        assert_eq!(
            score_key(Some(&full_usage(19.9)), &clean, false, false),
            HealthStatus::Warn
        );
        assert_eq!(
            score_key(Some(&usage), &key_state(100, 0, 0, 1, 0), false, false),
            HealthStatus::Warn
        );
        assert_eq!(
            score_key(Some(&usage), &clean, false, false),
            HealthStatus::Healthy
        );
    }

    #[test]
    fn surfaced_error_rate_includes_403s() {
        let info = build_health_info(
            Some(full_usage(90.0)),
            &key_state(10, 0, 1, 1, 0),
            false,
            false,
        );
        assert!((info.error_rate - 0.2).abs() < f64::EPSILON);
        assert!(info.usage_ok);

        let info = build_health_info(None, &key_state(0, 0, 0, 0, 0), false, false);
        assert!(!info.usage_ok);
        assert_eq!(info.error_rate, 0.0);
    }
}
