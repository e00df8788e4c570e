//! Asynchronous usage accounting: non-blocking ingestion with batched
//! durable writes, and the scheduled retention sweep.

mod record;
mod sweeper;
mod tracker;

pub use record::{UsageRecord, UsageStore, UsageStoreError};
pub use sweeper::{CleanupReport, RetentionSweeper, MIN_RETENTION_DAYS};
pub use tracker::{UsageTracker, UsageWorker};
