// src/limiter.rs

use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Upper bound on stored acceptance timestamps per bucket.
const MAX_TRACKED: usize = 10_000;
const MINUTE: Duration = Duration::from_secs(60);
const SECOND: Duration = Duration::from_secs(1);

/// Shared thresholds. Values `<= 0` disable the corresponding window.
#[derive(Debug, Clone, Copy)]
pub struct LimiterSettings {
    pub max_rps: i64,
    pub max_rpm: i64,
}

impl LimiterSettings {
    fn disabled(&self) -> bool {
        self.max_rps <= 0 && self.max_rpm <= 0
    }
}

fn check_and_record(
    recent: &mut VecDeque<Instant>,
    settings: LimiterSettings,
    now: Instant,
) -> bool {
    while let Some(&front) = recent.front() {
        if now.duration_since(front) > MINUTE {
            recent.pop_front();
        } else {
            break;
        }
    }

    if settings.max_rpm > 0 && recent.len() >= settings.max_rpm as usize {
        return false;
    }
    if settings.max_rps > 0 {
        let in_last_second = recent
            .iter()
            .rev()
            .take_while(|&&ts| now.duration_since(ts) < SECOND)
            .count();
        if in_last_second >= settings.max_rps as usize {
            return false;
        }
    }

    if recent.len() == MAX_TRACKED {
        recent.pop_front();
    }
    recent.push_back(now);
    true
}

/// Global sliding-window rate limiter: one bucket for the whole proxy.
pub struct RateLimiter {
    settings: LimiterSettings,
    recent: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_rps: i64, max_rpm: i64) -> Self {
        Self {
            settings: LimiterSettings { max_rps, max_rpm },
            recent: Mutex::new(VecDeque::new()),
        }
    }

    /// Accepts or rejects one request; acceptance records its timestamp.
    pub async fn allow(&self) -> bool {
        if self.settings.disabled() {
            return true;
        }
        let mut recent = self.recent.lock().await;
        check_and_record(&mut recent, self.settings, Instant::now())
    }
}

/// Per-key sliding-window limiter: an independent bucket per label.
pub struct KeyedRateLimiter {
    settings: LimiterSettings,
    buckets: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl KeyedRateLimiter {
    pub fn new(max_rps: i64, max_rpm: i64) -> Self {
        Self {
            settings: LimiterSettings { max_rps, max_rpm },
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub async fn allow(&self, label: &str) -> bool {
        if self.settings.disabled() {
            return true;
        }
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets.entry(label.to_string()).or_default();
        check_and_record(bucket, self.settings, Instant::now())
    }
}
