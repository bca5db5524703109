// src/trace/sink.rs

use crate::config::ProxyConfig;
use crate::trace::{append_entry, TraceEntry, TraceSettings};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::warn;

/// Bounded queue capacity for trace entries.
const QUEUE_CAPACITY: usize = 1024;
/// Minimum interval between "queue full" log lines.
const DROP_LOG_INTERVAL: Duration = Duration::from_secs(1);

/// Append-only trace writer.
///
/// Before `start` (tests, early startup) entries are written synchronously
/// under the file lock. Once started, `emit` enqueues into a bounded queue
/// drained by a single consumer; a full queue drops the entry and bumps a
/// counter that is logged at most once per interval. `stop` drains the
/// queue before returning.
#[derive(Clone)]
pub struct TraceSink {
    inner: Arc<SinkInner>,
}

struct SinkInner {
    settings: TraceSettings,
    tx: StdMutex<Option<mpsc::Sender<TraceEntry>>>,
    dropped: AtomicU64,
    last_drop_log: StdMutex<Option<Instant>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TraceSink {
    pub fn new(config: &ProxyConfig) -> Self {
        Self::with_settings(TraceSettings::from_config(config))
    }

    pub fn with_settings(settings: TraceSettings) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                settings,
                tx: StdMutex::new(None),
                dropped: AtomicU64::new(0),
                last_drop_log: StdMutex::new(None),
                task: Mutex::new(None),
            }),
        }
    }

    pub async fn start(&self) {
        let mut task = self.inner.task.lock().await;
        if task.is_some() {
            return;
        }
        let (tx, mut rx) = mpsc::channel::<TraceEntry>(QUEUE_CAPACITY);
        *self.inner.tx.lock().expect("trace sender lock") = Some(tx);
        let settings = self.inner.settings.clone();
        *task = Some(tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                let settings = settings.clone();
                let result =
                    tokio::task::spawn_blocking(move || append_entry(&settings, &entry)).await;
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(error = %e, "Failed to append trace entry"),
                    Err(e) => warn!(error = %e, "Trace append task panicked"),
                }
            }
        }));
    }

    /// Records one entry. Never blocks: a full queue drops the entry.
    pub fn emit(&self, entry: TraceEntry) {
        let sender = self.inner.tx.lock().expect("trace sender lock").clone();
        match sender {
            Some(tx) => {
                if tx.try_send(entry).is_err() {
                    let total = self.inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    self.log_drop(total);
                }
            }
            None => {
                if let Err(e) = append_entry(&self.inner.settings, &entry) {
                    warn!(error = %e, "Failed to append trace entry");
                }
            }
        }
    }

    fn log_drop(&self, total: u64) {
        let mut last = self.inner.last_drop_log.lock().expect("drop log lock");
        let due = last.map_or(true, |at| at.elapsed() >= DROP_LOG_INTERVAL);
        if due {
            *last = Some(Instant::now());
            warn!(dropped_total = total, "Trace queue full; dropping entries");
        }
    }

    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Closes the queue and waits for the consumer to drain it.
    pub async fn stop(&self) {
        self.inner.tx.lock().expect("trace sender lock").take();
        let handle = self.inner.task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Trace consumer task panicked");
            }
        }
    }
}
