// src/classify.rs

use crate::storage::BlockReason;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Body tokens that mark a response as a billing failure. English plus the
/// Chinese phrasings the upstream emits; extensible via configuration.
const PAYMENT_ERROR_TOKENS: &[&str] = &[
    "payment",
    "payment_required",
    "billing",
    "balance",
    "insufficient_balance",
    "insufficient_quota",
    "insufficient quota",
    "balance_insufficient",
    "credit",
    "subscription",
    "top up",
    "top-up",
    "recharge",
    "余额不足",
    "账户余额不足",
    "请充值",
    "充值",
    "欠费",
    "未付费",
    "未支付",
];

/// JSON field names whose values typically carry the upstream error text.
const ERROR_FIELDS: &[&str] = &[
    "error",
    "message",
    "code",
    "error_code",
    "errorcode",
    "err_code",
    "errcode",
    "type",
    "detail",
    "title",
    "status",
    "status_code",
    "reason",
];

const MAX_HINT_DEPTH: usize = 100;

/// What a classified response does to the selected key's state.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// No cooldown; counters only.
    Ok,
    /// Temporarily unselectable for the given number of seconds.
    Exhaust(u64),
    /// Unselectable until the timeout (or indefinitely with `seconds <= 0`).
    Block { reason: BlockReason, seconds: i64 },
}

/// Classification inputs beyond the status line.
#[derive(Debug, Clone, Copy)]
pub struct ClassifySettings<'a> {
    pub rotation_cooldown_seconds: u64,
    pub payment_block_seconds: i64,
    pub extra_payment_tokens: &'a [String],
}

/// Maps `(status, error hint, Retry-After)` to a state verdict.
///
/// The mapping is a fixed table so tests can enumerate it: billing bodies
/// and 402 block; 403 and 429 exhaust for the cooldown (429 honoring
/// Retry-After); 5xx exhausts for at most a minute.
pub fn classify(
    status: u16,
    error_hint: &str,
    retry_after_seconds: Option<u64>,
    settings: ClassifySettings<'_>,
) -> Verdict {
    if looks_like_payment_error(status, error_hint, settings.extra_payment_tokens) {
        return Verdict::Block {
            reason: BlockReason::PaymentRequired,
            seconds: settings.payment_block_seconds,
        };
    }
    match status {
        403 => Verdict::Exhaust(settings.rotation_cooldown_seconds),
        429 => {
            let cooldown = retry_after_seconds
                .map(|secs| secs.max(1))
                .unwrap_or(settings.rotation_cooldown_seconds);
            Verdict::Exhaust(cooldown)
        }
        500..=599 => Verdict::Exhaust(settings.rotation_cooldown_seconds.min(60)),
        _ => Verdict::Ok,
    }
}

/// A 402 is always a billing failure; other 4xx/5xx responses qualify when
/// their error text contains a known token.
pub fn looks_like_payment_error(status: u16, hint: &str, extra_tokens: &[String]) -> bool {
    if status == 402 {
        return true;
    }
    if !(400..=599).contains(&status) {
        return false;
    }
    let lowered = hint.to_lowercase();
    PAYMENT_ERROR_TOKENS
        .iter()
        .any(|token| lowered.contains(token))
        || extra_tokens
            .iter()
            .any(|token| !token.is_empty() && lowered.contains(&token.to_lowercase()))
}

fn collect_error_strings(payload: &Value, bucket: &mut Vec<String>, depth: usize) {
    if depth > MAX_HINT_DEPTH {
        return;
    }
    match payload {
        Value::Object(map) => {
            for (key, value) in map {
                let key_lower = key.to_lowercase();
                if ERROR_FIELDS.contains(&key_lower.as_str()) {
                    collect_error_strings(value, bucket, depth + 1);
                } else if key_lower.starts_with("error") {
                    if let Value::String(s) = value {
                        bucket.push(s.clone());
                    }
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_error_strings(item, bucket, depth + 1);
            }
        }
        Value::String(s) => bucket.push(s.clone()),
        Value::Number(n) => bucket.push(n.to_string()),
        _ => {}
    }
}

/// Extracts the human-readable error text from a response body, walking
/// JSON error fields when the body parses, otherwise returning raw text.
pub fn extract_error_hint(body: &[u8], content_type: &str) -> String {
    if body.is_empty() {
        return String::new();
    }
    let text = String::from_utf8_lossy(body).trim().to_string();
    if text.is_empty() {
        return String::new();
    }
    let looks_json = content_type.to_lowercase().contains("json") || text.starts_with('{');
    if !looks_json {
        return text;
    }
    let Ok(payload) = serde_json::from_str::<Value>(&text) else {
        return text;
    };
    let mut parts = Vec::new();
    collect_error_strings(&payload, &mut parts, 0);
    if parts.is_empty() {
        text
    } else {
        parts.join(" ")
    }
}

/// Parses a `Retry-After` header value: integer seconds or an HTTP-date.
/// Past dates clamp to zero.
pub fn parse_retry_after(value: Option<&str>) -> Option<u64> {
    let value = value?.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(seconds) = value.parse::<i64>() {
        return Some(seconds.max(0) as u64);
    }
    let parsed: DateTime<Utc> = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    let delta = (parsed - Utc::now()).num_seconds();
    Some(delta.max(0) as u64)
}
