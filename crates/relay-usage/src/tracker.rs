//! Non-blocking usage ingestion with batched durable writes.
//!
//! Submissions go through a bounded queue and return immediately; overflow
//! drops the newest record (at-most-once accounting). A single worker
//! drains the queue, flushing on batch size or interval, with bounded
//! exponential retry around the bulk insert.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use relay_core::TrackerSettings;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, warn};

use crate::record::{UsageRecord, UsageStore};

/// Submit side of the usage pipeline.
pub struct UsageTracker {
    tx: Mutex<Option<mpsc::Sender<UsageRecord>>>,
}

impl UsageTracker {
    /// Builds the tracker and its worker. The caller spawns
    /// [`UsageWorker::run`]; keeping the spawn explicit keeps tests
    /// deterministic.
    pub fn build(
        settings: TrackerSettings,
        store: Arc<dyn UsageStore>,
    ) -> (Self, UsageWorker) {
        let capacity = settings.channel_size.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let tracker = Self {
            tx: Mutex::new(settings.enabled.then_some(tx)),
        };
        let worker = UsageWorker {
            rx,
            store,
            settings,
        };
        (tracker, worker)
    }

    /// Non-blocking submit. Returns whether the record was accepted; a full
    /// queue drops the record with a warning and the caller is never
    /// delayed.
    pub fn track(&self, record: UsageRecord) -> bool {
        let guard = self.tx.lock().expect("tracker lock poisoned");
        let Some(tx) = guard.as_ref() else {
            return false;
        };
        match tx.try_send(record) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(record)) => {
                warn!(
                    user_id = record.user_id,
                    model = %record.model,
                    "usage queue full, dropping record"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("usage queue closed, dropping record");
                false
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.lock().expect("tracker lock poisoned").is_some()
    }

    /// Signals shutdown by closing the queue; the worker drains what is
    /// already buffered and exits.
    pub fn stop(&self) {
        self.tx.lock().expect("tracker lock poisoned").take();
    }
}

/// The single long-running drain task.
pub struct UsageWorker {
    rx: mpsc::Receiver<UsageRecord>,
    store: Arc<dyn UsageStore>,
    settings: TrackerSettings,
}

impl UsageWorker {
    /// Drains the queue until it closes, then flushes the remainder.
    pub async fn run(mut self) {
        if !self.settings.enabled {
            return;
        }

        let mut batch: Vec<UsageRecord> = Vec::with_capacity(self.settings.batch_size.max(1));
        let mut ticker = interval(Duration::from_millis(self.settings.flush_interval_ms.max(1)));
        // The first tick fires immediately; swallow it.
        ticker.tick().await;

        loop {
            tokio::select! {
                received = self.rx.recv() => {
                    match received {
                        Some(record) => {
                            batch.push(record);
                            if batch.len() >= self.settings.batch_size.max(1) {
                                flush(&*self.store, &mut batch, &self.settings).await;
                            }
                        }
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    flush(&*self.store, &mut batch, &self.settings).await;
                }
            }
        }

        // Final drain after the stop signal.
        while let Ok(record) = self.rx.try_recv() {
            batch.push(record);
        }
        flush(&*self.store, &mut batch, &self.settings).await;
        debug!("usage worker stopped");
    }
}

/// One durable write attempt with bounded exponential backoff.
async fn flush(store: &dyn UsageStore, batch: &mut Vec<UsageRecord>, settings: &TrackerSettings) {
    if batch.is_empty() {
        return;
    }

    let mut attempt: u32 = 0;
    loop {
        match store.insert_usage_records(batch) {
            Ok(()) => {
                debug!(count = batch.len(), "usage batch persisted");
                batch.clear();
                return;
            }
            Err(error) if attempt < settings.max_retries => {
                let delay_ms = settings
                    .retry_backoff_ms
                    .saturating_mul(1_u64 << attempt.min(16));
                warn!(%error, attempt, delay_ms, "usage flush failed, retrying");
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                attempt += 1;
            }
            Err(error) => {
                warn!(%error, count = batch.len(), "usage batch lost after retries");
                batch.clear();
                return;
            }
        }
    }
}
