// src/state.rs

use crate::config::ProxyConfig;
use crate::dispatch::build_http_client;
use crate::error::Result;
use crate::health::{HealthCache, Refresher};
use crate::keys::Registry;
use crate::limiter::{KeyedRateLimiter, RateLimiter};
use crate::storage::{load_state_logged, RotationState, StateWriter};
use crate::time_utils::{resolve_timezone, DisplayZone};
use crate::trace::TraceSink;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Shared application state threaded through every handler: configuration,
/// the key registry, rotation state under its lock, the limiters, the
/// persistence writers, the health cache, and the upstream client.
pub struct AppState {
    pub config: ProxyConfig,
    pub registry: Registry,
    pub state: Arc<Mutex<RotationState>>,
    pub limiter: RateLimiter,
    pub key_limiter: KeyedRateLimiter,
    pub state_writer: StateWriter,
    pub trace: TraceSink,
    pub health: HealthCache,
    pub http_client: reqwest::Client,
    pub display_zone: DisplayZone,
    refresher: Mutex<Option<Refresher>>,
}

impl AppState {
    /// Loads persisted state and assembles the context. Background tasks
    /// are not running yet; call `start_background` once inside the runtime.
    pub fn new(config: ProxyConfig, registry: Registry) -> Result<Self> {
        let rotation_state = load_state_logged(&config, &registry)?;
        let state = Arc::new(Mutex::new(rotation_state));
        let state_writer = StateWriter::new(config.clone(), Arc::clone(&state));
        let trace = TraceSink::new(&config);
        let http_client = build_http_client(registry.len())?;
        let display_zone = resolve_timezone(&config.time_zone);
        Ok(Self {
            limiter: RateLimiter::new(config.max_rps, config.max_rpm),
            key_limiter: KeyedRateLimiter::new(config.max_rps_per_key, config.max_rpm_per_key),
            state_writer,
            trace,
            health: HealthCache::default(),
            http_client,
            display_zone,
            refresher: Mutex::new(None),
            state,
            registry,
            config,
        })
    }

    /// Starts the state flusher, the trace consumer, and the health
    /// refresher, in that order.
    pub async fn start_background(&self) {
        self.state_writer.start().await;
        self.trace.start().await;
        let mut refresher = self.refresher.lock().await;
        if refresher.is_none() {
            *refresher = Some(Refresher::spawn(
                self.config.clone(),
                self.registry.clone(),
                Arc::clone(&self.state),
                self.state_writer.clone(),
                self.health.clone(),
            ));
        }
        info!("Background tasks started");
    }

    /// Stops background work in shutdown order: refresher first, then the
    /// trace queue is drained, then a final state flush.
    pub async fn shutdown(&self) {
        if let Some(refresher) = self.refresher.lock().await.take() {
            refresher.stop().await;
        }
        self.trace.stop().await;
        self.state_writer.stop().await;
        info!("Background tasks stopped and state flushed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyRecord;

    fn test_state(dir: &std::path::Path) -> AppState {
        let config = ProxyConfig {
            state_dir: dir.to_path_buf(),
            ..ProxyConfig::default()
        };
        let registry = Registry::new(vec![KeyRecord::new("a", "sk-aaaa-00000000")]).unwrap();
        AppState::new(config, registry).unwrap()
    }

    #[tokio::test]
    async fn lifecycle_starts_and_stops_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        state.start_background().await;
        state.shutdown().await;
        assert!(dir.path().join("state.json").exists());
    }

    #[tokio::test]
    async fn new_loads_state_for_registry_labels() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        assert!(state.state.lock().await.keys.contains_key("a"));
    }
}
