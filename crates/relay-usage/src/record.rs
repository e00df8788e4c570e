//! The usage record and the durable-store contract it flows into.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One completed (or failed) gateway request, as billed and analysed.
///
/// Owned by the tracker queue after submission; immutable once persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageRecord {
    pub user_id: i64,
    pub username: String,
    pub token_id: i64,
    pub token_name: String,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    /// Email of the Cursor session that served the request, when one did.
    pub cursor_session: Option<String>,
    pub status_code: u16,
    pub error_message: Option<String>,
    pub request_time_unix_ms: u64,
    pub response_time_unix_ms: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Error)]
#[error("usage store failure: {0}")]
pub struct UsageStoreError(pub String);

/// Durable operations the tracker and sweeper require from persistence.
pub trait UsageStore: Send + Sync {
    /// Bulk insert; all-or-nothing per batch.
    fn insert_usage_records(&self, records: &[UsageRecord]) -> Result<(), UsageStoreError>;

    /// Folds records strictly older than the cutoff into per-(user, model,
    /// date) aggregate rows. Idempotent on re-run.
    fn preserve_usage_aggregates(&self, cutoff_unix_ms: u64) -> Result<(), UsageStoreError>;

    /// Deletes at most `batch_size` records older than the cutoff, returning
    /// the deleted count.
    fn delete_old_usage_records(
        &self,
        cutoff_unix_ms: u64,
        batch_size: usize,
    ) -> Result<usize, UsageStoreError>;
}
