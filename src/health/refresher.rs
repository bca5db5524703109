// src/health/refresher.rs

use crate::config::ProxyConfig;
use crate::health::{build_health_info, fetch_usage, HealthInfo};
use crate::keys::Registry;
use crate::storage::{RotationState, StateWriter};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use secrecy::SecretString;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Timeout for a single usage fetch.
const USAGE_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
/// The refresh loop never spins faster than this.
const LOOP_TICK: Duration = Duration::from_secs(1);

/// Process-wide health cache. Written only by the refresher; the request
/// pipeline takes snapshots.
#[derive(Clone, Default)]
pub struct HealthCache {
    inner: Arc<RwLock<CacheInner>>,
}

#[derive(Default)]
struct CacheInner {
    map: HashMap<String, HealthInfo>,
    refreshed_at: Option<DateTime<Utc>>,
}

impl HealthCache {
    pub async fn snapshot(&self) -> HashMap<String, HealthInfo> {
        self.inner.read().await.map.clone()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.map.is_empty()
    }

    pub async fn age_seconds(&self) -> Option<i64> {
        let inner = self.inner.read().await;
        inner
            .refreshed_at
            .map(|at| (Utc::now() - at).num_seconds())
    }

    /// Merges one refresh round. Labels absent from `updates` keep their
    /// prior entry; a fetch failure never downgrades an existing entry.
    async fn apply(&self, updates: HashMap<String, HealthInfo>) {
        let mut inner = self.inner.write().await;
        for (label, info) in updates {
            inner.map.insert(label, info);
        }
        inner.refreshed_at = Some(Utc::now());
    }
}

/// Background task polling upstream usage for every key and re-probing
/// blocked keys on its own cadence.
pub struct Refresher {
    stop_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct RefreshContext {
    config: ProxyConfig,
    registry: Registry,
    state: Arc<Mutex<RotationState>>,
    writer: StateWriter,
    cache: HealthCache,
    client: reqwest::Client,
}

impl Refresher {
    pub fn spawn(
        config: ProxyConfig,
        registry: Registry,
        state: Arc<Mutex<RotationState>>,
        writer: StateWriter,
        cache: HealthCache,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let client = reqwest::Client::builder()
            .timeout(USAGE_FETCH_TIMEOUT)
            .build()
            .unwrap_or_default();
        let ctx = RefreshContext {
            config,
            registry,
            state,
            writer,
            cache,
            client,
        };
        let handle = tokio::spawn(run_loop(ctx, stop_rx));
        Self {
            stop_tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Health refresher task panicked");
            }
        }
    }
}

async fn run_loop(ctx: RefreshContext, mut stop_rx: watch::Receiver<bool>) {
    info!(
        cadence_seconds = ctx.config.usage_cache_seconds,
        "Health refresher started"
    );
    let mut ticker = tokio::time::interval(LOOP_TICK);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_recheck: Option<DateTime<Utc>> = None;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop_rx.changed() => break,
        }
        maybe_refresh(&ctx).await;
        maybe_recheck_blocked(&ctx, &mut last_recheck).await;
    }
    debug!("Health refresher stopped");
}

fn key_base_url<'a>(ctx: &'a RefreshContext, base_url: Option<&'a str>) -> &'a str {
    base_url.unwrap_or(&ctx.config.upstream_base_url)
}

async fn maybe_refresh(ctx: &RefreshContext) {
    let interval = ctx.config.usage_cache_seconds as i64;
    if interval <= 0 {
        return;
    }
    if let Some(age) = ctx.cache.age_seconds().await {
        if age < interval {
            return;
        }
    }

    let fetches = ctx.registry.iter().map(|key| {
        let client = &ctx.client;
        let base_url = key_base_url(ctx, key.base_url.as_deref());
        let secret = SecretString::new(key.expose_secret().to_string());
        let label = key.label.clone();
        let dry_run = ctx.config.dry_run;
        async move {
            let usage = fetch_usage(client, base_url, &secret, dry_run, &label).await;
            (label, usage)
        }
    });
    let results = join_all(fetches).await;

    let mut updates = HashMap::new();
    let known = ctx.cache.snapshot().await;
    {
        let state = ctx.state.lock().await;
        for (label, usage) in results {
            if usage.is_none() && known.contains_key(&label) {
                // Keep the prior entry; a transient failure must not
                // downgrade a key's standing.
                continue;
            }
            let key_state = state.key_state(&label).cloned().unwrap_or_default();
            let info = build_health_info(
                usage,
                &key_state,
                state.is_exhausted(&label),
                state.is_blocked(&label),
            );
            updates.insert(label, info);
        }
    }
    ctx.cache.apply(updates).await;

    {
        let mut state = ctx.state.lock().await;
        state.last_health_refresh = Some(Utc::now());
    }
    ctx.writer.mark_dirty().await;
    debug!("Health cache refreshed");
}

async fn maybe_recheck_blocked(ctx: &RefreshContext, last_recheck: &mut Option<DateTime<Utc>>) {
    let interval = ctx.config.blocklist_recheck_seconds as i64;
    if interval <= 0 {
        return;
    }
    let now = Utc::now();
    if let Some(last) = last_recheck {
        if (now - *last).num_seconds() < interval {
            return;
        }
    }
    *last_recheck = Some(now);

    // Oldest block first; indefinite blocks sort before timed ones.
    let mut candidates: Vec<(Option<DateTime<Utc>>, String, Option<String>, SecretString)> = {
        let state = ctx.state.lock().await;
        ctx.registry
            .iter()
            .filter(|key| state.is_blocked(&key.label))
            .map(|key| {
                let until = state.key_state(&key.label).and_then(|k| k.blocked_until);
                (
                    until,
                    key.label.clone(),
                    key.base_url.clone(),
                    SecretString::new(key.expose_secret().to_string()),
                )
            })
            .collect()
    };
    candidates.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    if ctx.config.blocklist_recheck_max > 0 {
        candidates.truncate(ctx.config.blocklist_recheck_max);
    }
    if candidates.is_empty() {
        return;
    }

    let mut cleared = Vec::new();
    for (_, label, base_url, secret) in candidates {
        let base_url = key_base_url(ctx, base_url.as_deref());
        if fetch_usage(&ctx.client, base_url, &secret, ctx.config.dry_run, &label)
            .await
            .is_some()
        {
            cleared.push(label);
        }
    }
    if cleared.is_empty() {
        return;
    }

    {
        let mut state = ctx.state.lock().await;
        for label in &cleared {
            if state.clear_blocked(Some(label)) > 0 {
                info!(key_label = %label, "Blocked key recovered after usage probe");
            }
        }
    }
    ctx.writer.mark_dirty().await;
}
