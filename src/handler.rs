// src/handler.rs

use crate::classify::{classify, extract_error_hint, parse_retry_after, ClassifySettings, Verdict};
use crate::dispatch::{
    build_upstream_headers, build_upstream_url, filter_response_headers, send_with_retries,
};
use crate::error::AppError;
use crate::rotation::{select_for_request, SelectOptions};
use crate::state::AppState;
use crate::storage::BlockReason;
use crate::time_utils::{new_request_id, now_timestamp};
use crate::trace::{TraceEntry, TraceErrorCode, TRACE_SCHEMA};
use axum::{
    body::{to_bytes, Body, Bytes},
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures_util::TryStreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Liveness probe. Returns HTTP 200 with no body.
#[instrument(name = "health_check", level = "debug", skip_all)]
pub async fn health_check() -> StatusCode {
    debug!("Responding to health check");
    StatusCode::OK
}

/// Constant-time string comparison for proxy tokens.
fn secure_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0u8;
    for (byte_a, byte_b) in a.bytes().zip(b.bytes()) {
        result |= byte_a ^ byte_b;
    }
    result == 0
}

/// Extracts the presented token from `Authorization: Bearer` (scheme
/// case-insensitive) or `X-KMI-Proxy-Token` and compares in constant time.
/// An empty configured token disables authentication.
pub fn authorize_request(headers: &HeaderMap, token: &str) -> bool {
    if token.is_empty() {
        return true;
    }
    let mut provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|value| {
            let (scheme, rest) = value.split_once(' ')?;
            scheme
                .eq_ignore_ascii_case("bearer")
                .then(|| rest.trim().to_string())
        })
        .unwrap_or_default();
    if provided.is_empty() {
        provided = headers
            .get("x-kmi-proxy-token")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string())
            .unwrap_or_default();
    }
    secure_compare(&provided, token)
}

fn coerce_prompt_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(map) => {
            if let Some(Value::String(text)) = map.get("text") {
                if !text.is_empty() {
                    return text.clone();
                }
            }
            if let Some(Value::String(content)) = map.get("content") {
                return content.clone();
            }
            String::new()
        }
        Value::Array(items) => items
            .iter()
            .map(coerce_prompt_text)
            .find(|text| !text.is_empty())
            .unwrap_or_default(),
        _ => String::new(),
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn trim_prompt(text: &str) -> String {
    const MAX_WORDS: usize = 6;
    const MAX_CHARS: usize = 60;
    let cleaned = collapse_whitespace(text);
    if cleaned.is_empty() {
        return String::new();
    }
    let mut trimmed = cleaned
        .split(' ')
        .take(MAX_WORDS)
        .collect::<Vec<_>>()
        .join(" ");
    if trimmed.chars().count() > MAX_CHARS {
        trimmed = trimmed.chars().take(MAX_CHARS).collect::<String>();
        let without_trailing_space = trimmed.trim_end().len();
        trimmed.truncate(without_trailing_space);
    }
    if trimmed != cleaned {
        trimmed.push_str("...");
    }
    trimmed
}

fn first_word(text: &str) -> String {
    collapse_whitespace(text)
        .split(' ')
        .next()
        .unwrap_or_default()
        .to_string()
}

/// Best-effort prompt hint for observability: the last textual message
/// content, else a top-level prompt-ish field. Never fails; malformed or
/// non-JSON bodies yield empty strings.
pub fn extract_prompt_meta(body: &[u8], content_type: &str) -> (String, String) {
    if body.is_empty() || !content_type.to_lowercase().contains("json") {
        return (String::new(), String::new());
    }
    let Ok(payload) = serde_json::from_slice::<Value>(body) else {
        return (String::new(), String::new());
    };
    let Some(map) = payload.as_object() else {
        return (String::new(), String::new());
    };

    let mut text = String::new();
    if let Some(Value::Array(messages)) = map.get("messages") {
        for message in messages.iter().rev() {
            if let Some(content) = message.get("content") {
                text = coerce_prompt_text(content);
                if !text.is_empty() {
                    break;
                }
            }
        }
    }
    if text.is_empty() {
        for key in ["prompt", "input", "query", "text"] {
            if let Some(Value::String(value)) = map.get(key) {
                text = value.clone();
                break;
            }
        }
    }
    if text.is_empty() {
        return (String::new(), String::new());
    }
    (trim_prompt(&text), first_word(&text))
}

struct RequestTrace {
    request_id: String,
    method: String,
    endpoint: String,
    prompt_hint: String,
    prompt_head: String,
    key_label: String,
    key_hash: String,
    rotation_index: usize,
    started: Instant,
}

impl RequestTrace {
    fn entry(&self, ctx: &AppState, status: u16, error_code: Option<TraceErrorCode>) -> TraceEntry {
        TraceEntry {
            schema: TRACE_SCHEMA,
            ts: now_timestamp(ctx.display_zone),
            request_id: self.request_id.clone(),
            method: self.method.clone(),
            endpoint: self.endpoint.clone(),
            status,
            latency_ms: self.started.elapsed().as_millis() as u64,
            key_label: self.key_label.clone(),
            key_hash: self.key_hash.clone(),
            rotation_index: self.rotation_index,
            prompt_hint: self.prompt_hint.clone(),
            prompt_head: self.prompt_head.clone(),
            error_code,
        }
    }
}

/// The catch-all proxy handler: authorize, admit, select a key, admit the
/// key, dispatch upstream, classify, trace, relay.
#[instrument(name = "proxy_request", skip_all, fields(http.method = %req.method(), url.path = %req.uri().path()))]
pub async fn proxy_handler(State(ctx): State<Arc<AppState>>, req: Request) -> Response {
    let started = Instant::now();
    let request_id = req
        .extensions()
        .get::<crate::RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_else(new_request_id);

    let method = req.method().clone();
    let uri = req.uri().clone();
    let headers = req.headers().clone();
    let sub_path = uri
        .path()
        .strip_prefix(ctx.config.base_path.as_str())
        .unwrap_or(uri.path())
        .trim_start_matches('/')
        .to_string();
    let endpoint = format!("/{sub_path}");

    // RECEIVED -> AUTHORIZED
    if !authorize_request(&headers, &ctx.config.proxy_token) {
        info!(endpoint = %endpoint, "Rejected unauthorized proxy request");
        return AppError::Unauthorized.into_response();
    }

    // AUTHORIZED -> ADMITTED
    if !ctx.limiter.allow().await {
        info!(endpoint = %endpoint, "Global rate limit exceeded");
        return AppError::GlobalRateLimited.into_response();
    }

    // ADMITTED -> KEY_SELECTED, committed under the state lock.
    let opts = SelectOptions {
        require_usage_ok: ctx.config.require_usage_before_request,
        fail_open_on_empty_cache: ctx.config.fail_open_on_empty_cache,
        include_warn: ctx.config.rotate_include_warn,
    };
    let health_map = ctx.health.snapshot().await;
    let (selected, prev_active, prev_rotation, rotation_index) = {
        let mut state = ctx.state.lock().await;
        let prev_active = state.active_index;
        let prev_rotation = state.rotation_index;
        let auto_rotate = state.auto_rotate && ctx.config.auto_rotate_allowed;
        let use_health = auto_rotate || ctx.config.require_usage_before_request;
        let health = use_health.then_some(&health_map);
        let selected =
            select_for_request(&ctx.registry, &mut state, auto_rotate, health, opts).cloned();
        (selected, prev_active, prev_rotation, state.rotation_index)
    };
    let Some(key) = selected else {
        warn!(endpoint = %endpoint, "No eligible keys for request");
        return AppError::NoEligibleKeys.into_response();
    };

    // KEY_SELECTED -> KEY_ADMITTED, rolling the selection back on rejection.
    if !ctx.key_limiter.allow(&key.label).await {
        {
            let mut state = ctx.state.lock().await;
            state.active_index = prev_active;
            state.rotation_index = prev_rotation;
        }
        ctx.state_writer.mark_dirty().await;
        info!(endpoint = %endpoint, key_label = %key.label, "Per-key rate limit exceeded");
        return AppError::KeyRateLimited.into_response();
    }
    ctx.state_writer.mark_dirty().await;

    let base_url = key
        .base_url
        .as_deref()
        .unwrap_or(&ctx.config.upstream_base_url);
    let upstream_url = build_upstream_url(base_url, &sub_path, uri.query());
    let upstream_headers = build_upstream_headers(&headers, key.expose_secret());

    let body = match to_bytes(req.into_body(), usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "Failed to buffer request body");
            return AppError::Internal(format!("request body read failed: {e}")).into_response();
        }
    };
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let (prompt_hint, prompt_head) = extract_prompt_meta(&body, content_type);

    let trace = RequestTrace {
        request_id,
        method: method.to_string(),
        endpoint: endpoint.clone(),
        prompt_hint,
        prompt_head,
        key_label: key.label.clone(),
        key_hash: key.key_hash.clone(),
        rotation_index,
        started,
    };

    // KEY_ADMITTED -> DONE for dry runs: never contact the upstream.
    if ctx.config.dry_run {
        {
            let mut state = ctx.state.lock().await;
            state.record_request(&key.label, 200);
        }
        ctx.state_writer.mark_dirty().await;
        info!(
            endpoint = %endpoint,
            status = 200,
            key_label = %key.label,
            latency_ms = started.elapsed().as_millis() as u64,
            "Dry-run request recorded"
        );
        ctx.trace.emit(trace.entry(&ctx, 200, None));
        return Json(json!({
            "dry_run": true,
            "upstream_url": upstream_url,
            "method": method.as_str(),
            "path": sub_path,
            "key_label": key.label,
        }))
        .into_response();
    }

    // KEY_ADMITTED -> DISPATCHED
    let response = match send_with_retries(
        &ctx.http_client,
        method.clone(),
        &upstream_url,
        upstream_headers,
        body,
        ctx.config.retry_max,
        ctx.config.retry_base_ms,
    )
    .await
    {
        Ok(response) => response,
        Err(e) => {
            {
                let mut state = ctx.state.lock().await;
                state.record_request(&key.label, 503);
            }
            ctx.state_writer.mark_dirty().await;
            warn!(endpoint = %endpoint, key_label = %key.label, error = %e, "Upstream dispatch failed");
            ctx.trace
                .emit(trace.entry(&ctx, 503, Some(TraceErrorCode::named("upstream_error"))));
            return AppError::UpstreamTransport(e.to_string()).into_response();
        }
    };

    // DISPATCHED -> CLASSIFIED -> RELAYED
    let status = response.status();
    let status_code = status.as_u16();
    let response_headers = filter_response_headers(response.headers());
    let retry_after = parse_retry_after(
        response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok()),
    );
    let upstream_content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let settings = ClassifySettings {
        rotation_cooldown_seconds: ctx.config.rotation_cooldown_seconds,
        payment_block_seconds: ctx.config.payment_block_seconds,
        extra_payment_tokens: &ctx.config.payment_error_tokens,
    };

    if status_code >= 400 {
        // Error bodies are buffered for classification and relayed as-is.
        let error_body = response.bytes().await.unwrap_or_else(|_| Bytes::new());
        let hint = extract_error_hint(&error_body, &upstream_content_type);
        let verdict = classify(status_code, &hint, retry_after, settings);
        let payment = matches!(
            verdict,
            Verdict::Block {
                reason: BlockReason::PaymentRequired,
                ..
            }
        );
        {
            let mut state = ctx.state.lock().await;
            state.record_request(&key.label, status_code);
            match verdict {
                Verdict::Ok => {}
                Verdict::Exhaust(seconds) => {
                    state.mark_exhausted(&key.label, seconds);
                    info!(key_label = %key.label, cooldown_seconds = seconds, "Key exhausted");
                }
                Verdict::Block { reason, seconds } => {
                    state.mark_blocked(&key.label, reason, seconds);
                    warn!(key_label = %key.label, reason = %reason, "Key blocked");
                }
            }
        }
        ctx.state_writer.mark_dirty().await;
        info!(
            endpoint = %endpoint,
            status = status_code,
            key_label = %key.label,
            latency_ms = started.elapsed().as_millis() as u64,
            "Proxied request finished with upstream error"
        );
        let error_code = if payment {
            Some(TraceErrorCode::named("payment_required"))
        } else {
            Some(TraceErrorCode::Status(status_code))
        };
        ctx.trace.emit(trace.entry(&ctx, status_code, error_code));

        let mut relayed = Response::builder()
            .status(status)
            .body(Body::from(error_body))
            .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response());
        *relayed.headers_mut() = response_headers;
        return relayed;
    }

    {
        let mut state = ctx.state.lock().await;
        state.record_request(&key.label, status_code);
    }
    ctx.state_writer.mark_dirty().await;
    info!(
        endpoint = %endpoint,
        status = status_code,
        key_label = %key.label,
        latency_ms = started.elapsed().as_millis() as u64,
        "Proxied request finished"
    );
    ctx.trace.emit(trace.entry(&ctx, status_code, None));

    // RELAYED -> DONE: stream the body; the upstream connection closes when
    // the client finishes or disconnects.
    let stream = response
        .bytes_stream()
        .map_err(|e| axum::BoxError::from(format!("upstream stream error: {e}")));
    let mut relayed = Response::builder()
        .status(status)
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response());
    *relayed.headers_mut() = response_headers;
    relayed
}
