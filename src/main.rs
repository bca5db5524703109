// src/main.rs

use axum::serve;
use kmi_rotor::{config, AppError, KeyRecord, Registry};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!(signal = "Ctrl+C", "Received signal. Initiating graceful shutdown...") },
        () = terminate => { info!(signal = "Terminate", "Received signal. Initiating graceful shutdown...") },
    }
}

/// Builds the key registry from `KMI_API_KEYS` (`label:secret` pairs,
/// comma-separated) or a single `KMI_API_KEY`. Full credential-source
/// loading lives in the management tooling; the proxy only needs a
/// constructed registry.
fn registry_from_env() -> Result<Registry, AppError> {
    let mut records = Vec::new();
    if let Ok(raw) = std::env::var("KMI_API_KEYS") {
        for (idx, item) in raw.split(',').map(str::trim).filter(|s| !s.is_empty()).enumerate() {
            match item.split_once(':') {
                Some((label, secret)) if !label.is_empty() && !secret.is_empty() => {
                    records.push(KeyRecord::new(label.trim(), secret.trim()));
                }
                _ => {
                    records.push(KeyRecord::new(format!("key-{}", idx + 1), item));
                }
            }
        }
    } else if let Ok(secret) = std::env::var("KMI_API_KEY") {
        if !secret.trim().is_empty() {
            records.push(KeyRecord::new("default", secret.trim()));
        }
    }
    if records.is_empty() {
        warn!("No API keys configured; set KMI_API_KEYS or KMI_API_KEY");
    }
    Registry::new(records)
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .init();

    let config_path = std::env::var("CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.yaml"));
    let proxy_config = config::load_config(&config_path).map_err(|e| {
        error!(config.path = %config_path.display(), error = %e, "Failed to load configuration. Exiting.");
        e
    })?;
    let registry = registry_from_env()?;

    let (host, port) = config::validate_listen(&proxy_config.listen)?;
    let (app, state) = kmi_rotor::run(proxy_config, registry).await.map_err(|e| {
        error!(error = %e, "Application setup failed. Exiting.");
        e
    })?;

    let addr = format!("{host}:{port}");
    let listener = TcpListener::bind(&addr).await.map_err(|e| {
        error!(server.address = %addr, error = ?e, "Failed to bind to address. Exiting.");
        AppError::from(e)
    })?;
    let local_addr: SocketAddr = listener.local_addr()?;
    info!(server.address = %local_addr, "Server listening");

    serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| {
            error!(error = ?e, "Server run loop encountered an error. Exiting.");
            AppError::from(e)
        })?;

    state.shutdown().await;
    info!("Server shut down gracefully.");
    Ok(())
}
