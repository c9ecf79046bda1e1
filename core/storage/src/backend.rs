//! Storage backend trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use offsync_common::{ActionId, ActionStatus, Result};

use crate::model::{CachedEntry, CleanupReport, LogStats, NewAction, OfflineAction, SyncLogEntry};

/// Persistence behind the action log.
///
/// Every method is one serializable unit of work: implementations must not
/// leave partial writes behind when a call fails. Timestamps are supplied by
/// the caller so that the log's clock is the only time source.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Get the backend name (e.g., "sqlite", "memory").
    fn name(&self) -> &str;

    /// Open the store and create the schema if needed.
    ///
    /// # Errors
    /// - `Error::Initialization` if the store cannot be opened
    async fn init(&self) -> Result<()>;

    /// Release the underlying store. Later calls fail until `init` runs again.
    async fn close(&self) -> Result<()>;

    /// Persist a new pending action and return it with its assigned id.
    async fn insert_action(&self, action: &NewAction, timestamp: DateTime<Utc>)
        -> Result<OfflineAction>;

    /// Fetch one action.
    async fn get_action(&self, id: ActionId) -> Result<Option<OfflineAction>>;

    /// All actions currently in `status`, in no particular order.
    async fn actions_with_status(&self, status: ActionStatus) -> Result<Vec<OfflineAction>>;

    /// Move an action to `status`.
    ///
    /// # Postconditions
    /// - Terminal statuses stamp `completed_at` the first time they are set
    /// - Re-applying the current status succeeds without changes
    ///
    /// # Errors
    /// - `Error::NotFound` for an unknown id
    /// - `Error::InvalidTransition` when leaving a terminal status
    async fn set_status(
        &self,
        id: ActionId,
        status: ActionStatus,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Count one failed attempt against a pending action; returns the new
    /// retry count.
    async fn record_failure(&self, id: ActionId, error: &str) -> Result<u32>;

    /// Insert or replace a cache row by key.
    async fn upsert_cache(&self, entry: &CachedEntry) -> Result<()>;

    /// Fetch a cache row regardless of age.
    async fn get_cache(&self, key: &str) -> Result<Option<CachedEntry>>;

    /// Append an audit entry; returns its row id.
    async fn append_log(&self, entry: &SyncLogEntry) -> Result<i64>;

    /// Audit entries in append order, limited to the newest `limit` if set.
    async fn logs(&self, limit: Option<usize>) -> Result<Vec<SyncLogEntry>>;

    /// Delete completed actions, cache rows and log rows stamped before
    /// `cutoff`.
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<CleanupReport>;

    /// Row counts.
    async fn stats(&self) -> Result<LogStats>;
}
