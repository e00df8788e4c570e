//! Scheduled retention sweep over the usage history.
//!
//! Once a day at a configured UTC wall-clock time the sweeper folds
//! out-of-retention records into aggregate rows, then deletes them in
//! bounded batches. The retention floor is seven days; shorter
//! configurations clamp up.

use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use cron::Schedule;
use relay_core::{current_unix_timestamp_ms, cutoff_unix_ms, SweeperSettings};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::record::UsageStore;

/// Hard floor on retention; configurations below clamp to this.
pub const MIN_RETENTION_DAYS: u32 = 7;

/// Outcome of one sweep pass.
#[derive(Debug, Clone, PartialEq)]
pub struct CleanupReport {
    pub cutoff_unix_ms: u64,
    pub deleted: usize,
    pub finished_unix_ms: u64,
    pub error: Option<String>,
}

#[derive(Default)]
struct SweeperState {
    running: bool,
    shutdown: Option<watch::Sender<bool>>,
    handle: Option<JoinHandle<()>>,
}

/// Daily retention job with an explicit start/stop lifecycle.
pub struct RetentionSweeper {
    settings: SweeperSettings,
    store: Arc<dyn UsageStore>,
    state: Mutex<SweeperState>,
    last: Mutex<Option<CleanupReport>>,
}

impl RetentionSweeper {
    pub fn new(mut settings: SweeperSettings, store: Arc<dyn UsageStore>) -> Arc<Self> {
        if settings.retention_days < MIN_RETENTION_DAYS {
            warn!(
                configured = settings.retention_days,
                floor = MIN_RETENTION_DAYS,
                "retention below floor, clamping"
            );
            settings.retention_days = MIN_RETENTION_DAYS;
        }
        Arc::new(Self {
            settings,
            store,
            state: Mutex::new(SweeperState::default()),
            last: Mutex::new(None),
        })
    }

    pub fn effective_retention_days(&self) -> u32 {
        self.settings.retention_days
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().expect("sweeper lock poisoned").running
    }

    pub fn last_cleanup(&self) -> Option<CleanupReport> {
        self.last.lock().expect("sweeper lock poisoned").clone()
    }

    /// Starts the daily timer task. Starting a running sweeper is a no-op
    /// with a warning.
    pub fn start(self: &Arc<Self>) {
        if !self.settings.enabled {
            info!("retention sweeper disabled by configuration");
            return;
        }

        let mut state = self.state.lock().expect("sweeper lock poisoned");
        if state.running {
            warn!("retention sweeper already running, ignoring start");
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let sweeper = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let schedule = match sweeper.schedule() {
                Ok(schedule) => schedule,
                Err(error) => {
                    warn!(%error, "invalid sweep schedule, sweeper exiting");
                    return;
                }
            };
            loop {
                let Some(next) = schedule.upcoming(Utc).next() else {
                    warn!("sweep schedule produced no next occurrence, sweeper exiting");
                    return;
                };
                let wait = (next - Utc::now()).to_std().unwrap_or_default();
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {
                        sweeper.run_cleanup_now();
                    }
                    _ = shutdown_rx.changed() => {
                        return;
                    }
                }
            }
        });

        state.running = true;
        state.shutdown = Some(shutdown_tx);
        state.handle = Some(handle);
        info!(
            hour = self.settings.schedule_hour,
            minute = self.settings.schedule_minute,
            retention_days = self.settings.retention_days,
            "retention sweeper started"
        );
    }

    /// Stops the timer task and waits for it to exit.
    pub async fn stop(&self) {
        let (shutdown, handle) = {
            let mut state = self.state.lock().expect("sweeper lock poisoned");
            if !state.running {
                return;
            }
            state.running = false;
            (state.shutdown.take(), state.handle.take())
        };
        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(true);
        }
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("retention sweeper stopped");
    }

    /// Runs one sweep pass immediately; the admin-plane escape hatch.
    ///
    /// Aggregation precedes deletion so a crash between the two loses no
    /// analytics; both operations are idempotent against the same cutoff.
    pub fn run_cleanup_now(&self) -> CleanupReport {
        let cutoff = cutoff_unix_ms(current_unix_timestamp_ms(), self.settings.retention_days);
        let mut report = CleanupReport {
            cutoff_unix_ms: cutoff,
            deleted: 0,
            finished_unix_ms: 0,
            error: None,
        };

        if let Err(error) = self.store.preserve_usage_aggregates(cutoff) {
            warn!(%error, "aggregate preservation failed, skipping deletion");
            report.error = Some(error.to_string());
        } else {
            loop {
                match self
                    .store
                    .delete_old_usage_records(cutoff, self.settings.batch_size.max(1))
                {
                    Ok(0) => break,
                    Ok(deleted) => report.deleted += deleted,
                    Err(error) => {
                        warn!(%error, "bounded delete failed, aborting pass");
                        report.error = Some(error.to_string());
                        break;
                    }
                }
            }
        }

        report.finished_unix_ms = current_unix_timestamp_ms();
        info!(
            deleted = report.deleted,
            cutoff = report.cutoff_unix_ms,
            ok = report.error.is_none(),
            "retention sweep finished"
        );
        *self.last.lock().expect("sweeper lock poisoned") = Some(report.clone());
        report
    }

    fn schedule(&self) -> Result<Schedule, cron::error::Error> {
        // Seconds, minutes, hours, day-of-month, month, day-of-week.
        Schedule::from_str(&format!(
            "0 {} {} * * *",
            self.settings.schedule_minute.min(59),
            self.settings.schedule_hour.min(23),
        ))
    }
}
