// src/dispatch.rs

use crate::error::{AppError, Result};
use axum::body::Bytes;
use axum::http::{header, HeaderMap, HeaderValue, Method};
use reqwest::Client;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, warn};

/// Hop-by-hop headers that must not cross the proxy in either direction.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Request headers replaced or dropped before forwarding.
const STRIPPED_REQUEST_HEADERS: &[&str] =
    &["host", "content-length", "authorization", "x-kmi-proxy-token"];

fn connection_tokens(headers: &HeaderMap) -> HashSet<String> {
    let mut tokens = HashSet::new();
    for value in headers.get_all(header::CONNECTION) {
        if let Ok(value) = value.to_str() {
            for token in value.split(',') {
                let token = token.trim().to_lowercase();
                if !token.is_empty() {
                    tokens.insert(token);
                }
            }
        }
    }
    tokens
}

fn is_hop_by_hop(name: &str, extra: &HashSet<String>) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name) || extra.contains(name)
}

/// Builds the header set for the upstream request: hop-by-hop and proxy
/// credentials stripped, `Authorization` replaced with the selected key.
pub fn build_upstream_headers(original: &HeaderMap, secret: &str) -> HeaderMap {
    let extra = connection_tokens(original);
    let mut filtered = HeaderMap::with_capacity(original.len() + 1);
    for (name, value) in original {
        let name_str = name.as_str();
        if is_hop_by_hop(name_str, &extra) || STRIPPED_REQUEST_HEADERS.contains(&name_str) {
            continue;
        }
        filtered.insert(name.clone(), value.clone());
    }
    match HeaderValue::from_str(&format!("Bearer {secret}")) {
        Ok(value) => {
            filtered.insert(header::AUTHORIZATION, value);
        }
        Err(e) => {
            warn!(error = %e, "API key contains characters invalid in a header value");
        }
    }
    filtered
}

/// Filters hop-by-hop headers out of the upstream response before relaying.
pub fn filter_response_headers(original: &HeaderMap) -> HeaderMap {
    let extra = connection_tokens(original);
    let mut filtered = HeaderMap::with_capacity(original.len());
    for (name, value) in original {
        if is_hop_by_hop(name.as_str(), &extra) {
            continue;
        }
        filtered.insert(name.clone(), value.clone());
    }
    filtered
}

/// `<base>/<path>?<query>` with duplicate slashes collapsed at the join.
pub fn build_upstream_url(base_url: &str, path: &str, query: Option<&str>) -> String {
    let base = base_url.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    let mut url = if path.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{path}")
    };
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(query);
    }
    url
}

/// Builds the shared upstream client: 30 second overall timeout, pooled
/// connections sized for the key count.
pub fn build_http_client(key_count: usize) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(30))
        .pool_max_idle_per_host(key_count.max(10))
        .pool_idle_timeout(Duration::from_secs(90))
        .build()
        .map_err(AppError::from)
}

/// Sends the upstream request, retrying transport errors and 429/5xx
/// responses with exponential backoff while attempts remain.
///
/// Exhausted transport retries surface as `UpstreamTransport`; any other
/// status (including a final 429/5xx) is returned for classification and
/// relay. The response body stays unread so it can be streamed.
pub async fn send_with_retries(
    client: &Client,
    method: Method,
    url: &str,
    headers: HeaderMap,
    body: Bytes,
    retry_max: u32,
    retry_base_ms: u64,
) -> Result<reqwest::Response> {
    let mut attempt: u32 = 0;
    loop {
        let request = client
            .request(method.clone(), url)
            .headers(headers.clone())
            .body(body.clone());
        match request.send().await {
            Ok(response) => {
                let status = response.status();
                let retriable = status.as_u16() == 429 || status.is_server_error();
                if retriable && attempt < retry_max {
                    debug!(status = status.as_u16(), attempt, "Retrying upstream request");
                    // Drain before the connection goes back to the pool.
                    let _ = response.bytes().await;
                    backoff(retry_base_ms, attempt).await;
                    attempt += 1;
                    continue;
                }
                return Ok(response);
            }
            Err(e) => {
                if attempt < retry_max {
                    warn!(error = %e, attempt, "Upstream connection failed; retrying");
                    backoff(retry_base_ms, attempt).await;
                    attempt += 1;
                    continue;
                }
                return Err(AppError::UpstreamTransport(e.to_string()));
            }
        }
    }
}

async fn backoff(base_ms: u64, attempt: u32) {
    let delay = base_ms.saturating_mul(1u64 << attempt.min(16));
    tokio::time::sleep(Duration::from_millis(delay)).await;
}
