// src/storage/writer.rs

use crate::config::ProxyConfig;
use crate::storage::state::{save_state, RotationState};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How long the flusher waits for further dirty signals before writing.
const DEBOUNCE: Duration = Duration::from_millis(50);

/// Debounced asynchronous persistence for the rotation state.
///
/// `mark_dirty` is non-blocking once the background task runs; before
/// `start` (tests, early startup) it writes synchronously. The flusher
/// consolidates bursts of signals into a single write, and `stop` performs
/// a final write regardless of the debounce window. Write failures are
/// logged and retried on the next flush; they never interrupt request
/// handling.
#[derive(Clone)]
pub struct StateWriter {
    inner: Arc<WriterInner>,
}

struct WriterInner {
    config: ProxyConfig,
    state: Arc<Mutex<RotationState>>,
    dirty: AtomicBool,
    signal: Notify,
    started: AtomicBool,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StateWriter {
    pub fn new(config: ProxyConfig, state: Arc<Mutex<RotationState>>) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            inner: Arc::new(WriterInner {
                config,
                state,
                dirty: AtomicBool::new(false),
                signal: Notify::new(),
                started: AtomicBool::new(false),
                stop_tx,
                stop_rx,
                task: Mutex::new(None),
            }),
        }
    }

    pub async fn start(&self) {
        let mut task = self.inner.task.lock().await;
        if task.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *task = Some(tokio::spawn(async move { run_flusher(inner).await }));
        self.inner.started.store(true, Ordering::SeqCst);
    }

    /// Flags the in-memory state as ahead of disk. Never blocks on IO once
    /// the flusher runs.
    pub async fn mark_dirty(&self) {
        self.inner.dirty.store(true, Ordering::SeqCst);
        if self.inner.started.load(Ordering::SeqCst) {
            self.inner.signal.notify_one();
        } else {
            flush_once(&self.inner).await;
        }
    }

    /// Stops the flusher and performs a final synchronous write.
    pub async fn stop(&self) {
        let handle = self.inner.task.lock().await.take();
        if let Some(handle) = handle {
            let _ = self.inner.stop_tx.send(true);
            if let Err(e) = handle.await {
                warn!(error = %e, "State flusher task panicked");
            }
        }
        self.inner.started.store(false, Ordering::SeqCst);
        flush_once(&self.inner).await;
    }
}

async fn run_flusher(inner: Arc<WriterInner>) {
    let mut stop_rx = inner.stop_rx.clone();
    loop {
        tokio::select! {
            _ = inner.signal.notified() => {}
            _ = stop_rx.changed() => break,
        }

        // Debounce window: each further signal restarts the timer.
        let mut stopping = false;
        loop {
            let window = tokio::time::sleep(DEBOUNCE);
            tokio::pin!(window);
            tokio::select! {
                _ = &mut window => break,
                _ = inner.signal.notified() => continue,
                _ = stop_rx.changed() => {
                    stopping = true;
                    break;
                }
            }
        }

        flush_once(&inner).await;
        if stopping {
            break;
        }
    }
}

async fn flush_once(inner: &WriterInner) {
    if !inner.dirty.swap(false, Ordering::SeqCst) {
        return;
    }
    let snapshot = inner.state.lock().await.clone();
    let config = inner.config.clone();
    let result =
        tokio::task::spawn_blocking(move || save_state(&config, &snapshot)).await;
    match result {
        Ok(Ok(())) => debug!("Rotation state flushed to disk"),
        Ok(Err(e)) => {
            // Keep the mutation in memory; the next flush retries it.
            inner.dirty.store(true, Ordering::SeqCst);
            warn!(error = %e, "Failed to persist rotation state");
        }
        Err(e) => warn!(error = %e, "State flush task panicked"),
    }
}
