// src/lib.rs

pub mod classify;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod health;
pub mod keys;
pub mod limiter;
pub mod rotation;
pub mod state;
pub mod storage;
pub mod time_utils;
pub mod trace;

use axum::{
    body::Body,
    http::Request as AxumRequest,
    middleware::{self, Next},
    response::Response as AxumResponse,
    routing::{any, get},
    Router,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, span, Instrument, Level};

pub use config::{load_config, ProxyConfig};
pub use error::{AppError, Result};
pub use keys::{KeyRecord, Registry};
pub use state::AppState;

/// Request correlation id, generated once per request and shared between
/// the tracing span and the trace entry.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Builds the router: a liveness probe plus the catch-all proxy route under
/// the configured base path.
pub fn create_router(state: Arc<AppState>) -> Router {
    let base = state.config.base_path.clone();
    Router::new()
        .route("/healthz", get(handler::health_check))
        .route(&base, any(handler::proxy_handler))
        .route(&format!("{base}/*path"), any(handler::proxy_handler))
        .layer(middleware::from_fn(trace_requests))
        .with_state(state)
}

/// Middleware attaching a request id and timing span to every request.
async fn trace_requests(mut req: AxumRequest<Body>, next: Next) -> AxumResponse {
    let request_id = time_utils::new_request_id();
    let start_time = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    req.extensions_mut().insert(RequestId(request_id.clone()));

    let span = span!(
        Level::INFO,
        "request",
        request_id = %request_id,
        http.method = %method,
        url.path = %path,
    );

    let response = next.run(req).instrument(span).await;

    info!(
        request_id = %request_id,
        http.method = %method,
        url.path = %path,
        http.status_code = response.status().as_u16(),
        http.response.duration_ms = start_time.elapsed().as_millis() as u64,
        "Finished processing request"
    );
    response
}

/// Refuses dangerous listen configurations: binding beyond loopback needs
/// an explicit opt-in and a client token.
fn enforce_bind_policy(config: &ProxyConfig) -> Result<()> {
    let (host, _) = config::validate_listen(&config.listen)?;
    if config::is_local_host(&host) {
        return Ok(());
    }
    if !config.allow_remote {
        return Err(AppError::Config(
            "remote proxy binding is disabled; set allow_remote to override".to_string(),
        ));
    }
    if config.proxy_token.is_empty() {
        return Err(AppError::Config(
            "remote proxy binding requires a proxy_token for authentication".to_string(),
        ));
    }
    Ok(())
}

/// Assembles the application: state load, background tasks, router.
///
/// # Errors
///
/// Fails when the listen policy is violated, persisted state cannot be
/// loaded (including a schema newer than this build), or the HTTP client
/// cannot be constructed.
pub async fn run(config: ProxyConfig, registry: Registry) -> Result<(Router, Arc<AppState>)> {
    enforce_bind_policy(&config)?;
    if registry.is_empty() {
        info!("Registry is empty; every request will fail with 503 until keys are added");
    } else {
        info!(
            keys = registry.len(),
            upstream = %config.upstream_base_url,
            dry_run = config.dry_run,
            "Starting rotating proxy"
        );
    }

    let state = AppState::new(config, registry).map_err(|e| {
        error!(error = %e, "Failed to initialize application state");
        e
    })?;
    let state = Arc::new(state);
    state.start_background().await;

    let app = create_router(Arc::clone(&state));
    Ok((app, state))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_listen(listen: &str, allow_remote: bool, token: &str) -> ProxyConfig {
        ProxyConfig {
            listen: listen.to_string(),
            allow_remote,
            proxy_token: token.to_string(),
            ..ProxyConfig::default()
        }
    }

    #[test]
    fn local_binds_are_always_allowed() {
        assert!(enforce_bind_policy(&config_with_listen("127.0.0.1:54123", false, "")).is_ok());
        assert!(enforce_bind_policy(&config_with_listen("localhost:8080", false, "")).is_ok());
    }

    #[test]
    fn remote_binds_require_opt_in_and_token() {
        assert!(enforce_bind_policy(&config_with_listen("0.0.0.0:8080", false, "")).is_err());
        assert!(enforce_bind_policy(&config_with_listen("0.0.0.0:8080", true, "")).is_err());
        assert!(enforce_bind_policy(&config_with_listen("0.0.0.0:8080", true, "tok")).is_ok());
    }
}
