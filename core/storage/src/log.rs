//! The action log service: durable queue, read cache and audit trail.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use offsync_common::{
    ActionId, ActionStatus, Clock, Error, LogStatus, Result, SystemClock,
};

use crate::backend::StorageBackend;
use crate::memory::MemoryBackend;
use crate::model::{
    CachedEntry, CleanupReport, LogStats, NewAction, OfflineAction, SyncLogEntry,
};
use crate::sqlite::SqliteBackend;

/// Freshness and retention windows of the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Cached reads older than this are treated as absent.
    pub cache_ttl: std::time::Duration,
    /// Completed actions, cache rows and log rows older than this are purged
    /// by [`ActionLog::cleanup`].
    pub retention: std::time::Duration,
}

impl LogConfig {
    /// Set the cache TTL.
    pub fn with_cache_ttl(mut self, ttl: std::time::Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Set the retention window.
    pub fn with_retention(mut self, retention: std::time::Duration) -> Self {
        self.retention = retention;
        self
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            cache_ttl: std::time::Duration::from_secs(24 * 60 * 60),
            retention: std::time::Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

fn chrono_duration(d: std::time::Duration) -> Duration {
    Duration::from_std(d).unwrap_or_else(|_| Duration::days(36_500))
}

/// Durable on-device log of pending mutations.
///
/// The log is the single source of truth for action status. It must be
/// initialised with [`ActionLog::init`] before use; every other call on an
/// uninitialised or closed log fails with `Error::Initialization`.
pub struct ActionLog {
    backend: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
    config: LogConfig,
    ready: AtomicBool,
}

impl ActionLog {
    /// Create a log over an arbitrary backend.
    pub fn with_backend(backend: Arc<dyn StorageBackend>, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend,
            clock,
            config: LogConfig::default(),
            ready: AtomicBool::new(false),
        }
    }

    /// Create a log persisted in the SQLite database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Self {
        Self::with_backend(Arc::new(SqliteBackend::new(path)), Arc::new(SystemClock))
    }

    /// Create a log kept entirely in memory.
    pub fn in_memory() -> Self {
        Self::with_backend(Arc::new(MemoryBackend::new()), Arc::new(SystemClock))
    }

    /// Replace the freshness and retention windows.
    pub fn with_config(mut self, config: LogConfig) -> Self {
        self.config = config;
        self
    }

    /// Get the log configuration.
    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// The clock used for every timestamp the log writes.
    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Open the underlying store.
    ///
    /// # Errors
    /// - `Error::Initialization` if the store cannot be opened. This is
    ///   fatal: callers must not start syncing without a successful init.
    pub async fn init(&self) -> Result<()> {
        match self.backend.init().await {
            Ok(()) => {
                self.ready.store(true, Ordering::SeqCst);
                info!("Action log ready ({} backend)", self.backend.name());
                Ok(())
            }
            Err(Error::Initialization(msg)) => Err(Error::Initialization(msg)),
            Err(e) => Err(Error::Initialization(e.to_string())),
        }
    }

    /// Close the underlying store.
    pub async fn close(&self) -> Result<()> {
        self.ready.store(false, Ordering::SeqCst);
        self.backend.close().await
    }

    /// Whether `init` has succeeded and `close` has not been called since.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(Error::Initialization(
                "Action log used before init".to_string(),
            ))
        }
    }

    /// Queue a mutation.
    ///
    /// # Postconditions
    /// - The stored action is `Pending` with `retry_count == 0` and an
    ///   enqueue timestamp of now
    /// - An enqueue audit entry is appended
    pub async fn add_offline_action(&self, action: NewAction) -> Result<ActionId> {
        self.ensure_ready()?;
        action.validate()?;

        let stored = self.backend.insert_action(&action, self.clock.now()).await?;
        debug!("Queued action {} ({})", stored.id, stored.label());

        self.add_sync_log(SyncLogEntry::new(
            format!("queue {}", stored.label()),
            LogStatus::Success,
            format!("{} {} queued", stored.method, stored.endpoint),
            json!({
                "actionId": stored.id,
                "phase": "enqueue",
                "priority": stored.priority,
            }),
            stored.timestamp,
        ))
        .await?;

        Ok(stored.id)
    }

    /// All pending actions, unordered.
    pub async fn get_pending_actions(&self) -> Result<Vec<OfflineAction>> {
        self.ensure_ready()?;
        self.backend.actions_with_status(ActionStatus::Pending).await
    }

    /// All actions that exhausted their retries or were failed by an operator.
    pub async fn get_failed_actions(&self) -> Result<Vec<OfflineAction>> {
        self.ensure_ready()?;
        self.backend.actions_with_status(ActionStatus::Failed).await
    }

    /// Fetch a single action.
    ///
    /// # Errors
    /// - `Error::NotFound` if the id is unknown
    pub async fn get_action(&self, id: ActionId) -> Result<OfflineAction> {
        self.ensure_ready()?;
        self.backend
            .get_action(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Action not found: {}", id)))
    }

    /// Set the status of an action.
    ///
    /// Idempotent for the current status. Terminal statuses stamp
    /// `completed_at`.
    ///
    /// # Errors
    /// - `Error::NotFound` if the id is unknown
    /// - `Error::InvalidTransition` when the action is already terminal with
    ///   a different status
    pub async fn update_action_status(
        &self,
        id: ActionId,
        status: ActionStatus,
        error: Option<String>,
    ) -> Result<()> {
        self.ensure_ready()?;
        self.backend
            .set_status(id, status, error, self.clock.now())
            .await
    }

    /// Mark an action failed by hand and record why.
    ///
    /// # Errors
    /// - `Error::NotFound` if the id is unknown
    /// - `Error::InvalidTransition` if the action is already completed or failed
    pub async fn fail_action(&self, id: ActionId, reason: &str) -> Result<()> {
        let action = self.get_action(id).await?;
        if action.status.is_terminal() {
            return Err(Error::InvalidTransition(format!(
                "Action {} is already {}",
                id, action.status
            )));
        }
        self.update_action_status(id, ActionStatus::Failed, Some(reason.to_string()))
            .await?;
        self.add_sync_log(SyncLogEntry::new(
            format!("fail {}", action.label()),
            LogStatus::Error,
            reason,
            json!({ "actionId": id, "phase": "operator" }),
            self.clock.now(),
        ))
        .await?;
        info!("Action {} marked failed: {}", id, reason);
        Ok(())
    }

    /// Count a failed sync attempt; returns the new retry count.
    pub async fn record_failed_attempt(&self, id: ActionId, error: &str) -> Result<u32> {
        self.ensure_ready()?;
        self.backend.record_failure(id, error).await
    }

    /// Store a read response under `key`, replacing any previous entry.
    pub async fn cache_data(&self, key: &str, data: Value, module: &str) -> Result<()> {
        self.ensure_ready()?;
        self.backend
            .upsert_cache(&CachedEntry {
                key: key.to_string(),
                data,
                module: module.to_string(),
                timestamp: self.clock.now(),
            })
            .await
    }

    /// Read a cached response.
    ///
    /// Returns `None` when nothing is stored under `key` or the entry is
    /// older than the cache TTL. Expired rows stay in place until cleanup.
    pub async fn get_cached_data(&self, key: &str) -> Result<Option<Value>> {
        self.ensure_ready()?;
        let Some(entry) = self.backend.get_cache(key).await? else {
            return Ok(None);
        };

        let age = self.clock.now() - entry.timestamp;
        if age > chrono_duration(self.config.cache_ttl) {
            debug!("Cache entry {} expired ({}s old)", key, age.num_seconds());
            return Ok(None);
        }
        Ok(Some(entry.data))
    }

    /// Append an audit entry.
    pub async fn add_sync_log(&self, entry: SyncLogEntry) -> Result<()> {
        self.ensure_ready()?;
        self.backend.append_log(&entry).await?;
        Ok(())
    }

    /// Audit entries in append order; `limit` keeps only the newest.
    pub async fn sync_logs(&self, limit: Option<usize>) -> Result<Vec<SyncLogEntry>> {
        self.ensure_ready()?;
        self.backend.logs(limit).await
    }

    /// Every audit entry that refers to `id`.
    pub async fn logs_for_action(&self, id: ActionId) -> Result<Vec<SyncLogEntry>> {
        Ok(self
            .sync_logs(None)
            .await?
            .into_iter()
            .filter(|entry| entry.action_id() == Some(id))
            .collect())
    }

    /// Audit entries recording sync attempts for `id`.
    pub async fn attempt_logs(&self, id: ActionId) -> Result<Vec<SyncLogEntry>> {
        Ok(self
            .logs_for_action(id)
            .await?
            .into_iter()
            .filter(SyncLogEntry::is_attempt)
            .collect())
    }

    /// Purge completed actions and cache/log rows older than the retention
    /// window. Pending and failed actions are never removed.
    pub async fn cleanup(&self) -> Result<CleanupReport> {
        self.ensure_ready()?;
        let cutoff = self.clock.now() - chrono_duration(self.config.retention);
        let report = self.backend.purge_before(cutoff).await?;

        if report.actions_removed + report.cache_removed + report.logs_removed > 0 {
            info!(
                "Cleanup removed {} actions, {} cache entries, {} log entries",
                report.actions_removed, report.cache_removed, report.logs_removed
            );
        }
        Ok(report)
    }

    /// Row counts across the log.
    pub async fn stats(&self) -> Result<LogStats> {
        self.ensure_ready()?;
        self.backend.stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use offsync_common::{ActionType, HttpMethod, ManualClock};
    use tempfile::TempDir;

    async fn manual_log() -> (ActionLog, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let log = ActionLog::with_backend(Arc::new(SqliteBackend::in_memory()), clock.clone());
        log.init().await.unwrap();
        (log, clock)
    }

    fn create_customer() -> NewAction {
        NewAction::new(ActionType::Create, "customers", "/customers", HttpMethod::Post)
            .with_data(json!({"name": "Acme"}))
    }

    #[tokio::test]
    async fn test_use_before_init_is_rejected() {
        let log = ActionLog::in_memory();
        let result = log.add_offline_action(create_customer()).await;
        assert!(matches!(result, Err(Error::Initialization(_))));
    }

    #[tokio::test]
    async fn test_init_failure_is_initialization_error() {
        let dir = TempDir::new().unwrap();
        let log = ActionLog::open(dir.path().join("nope").join("offsync.db"));
        assert!(matches!(log.init().await, Err(Error::Initialization(_))));
        assert!(!log.is_ready());
    }

    #[tokio::test]
    async fn test_add_sets_pending_defaults() {
        let (log, clock) = manual_log().await;
        let id = log.add_offline_action(create_customer()).await.unwrap();
        let action = log.get_action(id).await.unwrap();

        assert_eq!(action.status, ActionStatus::Pending);
        assert_eq!(action.retry_count, 0);
        assert_eq!(action.timestamp.timestamp_millis(), clock.now().timestamp_millis());

        let logs = log.logs_for_action(id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert!(!logs[0].is_attempt());
    }

    #[tokio::test]
    async fn test_pending_excludes_terminal() {
        let (log, _clock) = manual_log().await;
        let done = log.add_offline_action(create_customer()).await.unwrap();
        let open = log.add_offline_action(create_customer()).await.unwrap();
        log.update_action_status(done, ActionStatus::Completed, None)
            .await
            .unwrap();

        let pending = log.get_pending_actions().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, open);
    }

    #[tokio::test]
    async fn test_update_status_unknown_id() {
        let (log, _clock) = manual_log().await;
        let result = log
            .update_action_status(ActionId::new(99), ActionStatus::Completed, None)
            .await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_fail_action_records_reason() {
        let (log, _clock) = manual_log().await;
        let id = log.add_offline_action(create_customer()).await.unwrap();

        log.fail_action(id, "duplicate customer").await.unwrap();
        let action = log.get_action(id).await.unwrap();
        assert_eq!(action.status, ActionStatus::Failed);
        assert_eq!(action.error.as_deref(), Some("duplicate customer"));
        assert!(action.completed_at.is_some());

        let trail = log.logs_for_action(id).await.unwrap();
        assert_eq!(trail.len(), 2);
        assert_eq!(trail[1].status, LogStatus::Error);

        let again = log.fail_action(id, "twice").await;
        assert!(matches!(again, Err(Error::InvalidTransition(_))));
        let action = log.get_action(id).await.unwrap();
        assert_eq!(action.error.as_deref(), Some("duplicate customer"));
        assert_eq!(log.logs_for_action(id).await.unwrap().len(), 2);

        log.update_action_status(id, ActionStatus::Failed, None).await.unwrap();
        let completed = log.update_action_status(id, ActionStatus::Completed, None).await;
        assert!(matches!(completed, Err(Error::InvalidTransition(_))));
    }

    #[tokio::test]
    async fn test_cache_ttl_is_checked_on_read() {
        let (log, clock) = manual_log().await;
        let payload = json!([{"id": 1, "name": "Acme"}]);

        log.cache_data("/customers", payload.clone(), "customers")
            .await
            .unwrap();
        clock.advance(Duration::hours(2));
        assert_eq!(
            log.get_cached_data("/customers").await.unwrap(),
            Some(payload)
        );

        clock.advance(Duration::hours(23));
        assert_eq!(log.get_cached_data("/customers").await.unwrap(), None);
        // Still physically present until cleanup.
        assert_eq!(log.stats().await.unwrap().cached, 1);
    }

    #[tokio::test]
    async fn test_cache_upsert_replaces() {
        let (log, _clock) = manual_log().await;
        log.cache_data("/tasks", json!([1]), "tasks").await.unwrap();
        log.cache_data("/tasks", json!([1, 2]), "tasks").await.unwrap();
        assert_eq!(log.get_cached_data("/tasks").await.unwrap(), Some(json!([1, 2])));
        assert_eq!(log.get_cached_data("/missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cleanup_scope() {
        let (log, clock) = manual_log().await;
        let completed = log.add_offline_action(create_customer()).await.unwrap();
        let failed = log.add_offline_action(create_customer()).await.unwrap();
        let pending = log.add_offline_action(create_customer()).await.unwrap();
        log.update_action_status(completed, ActionStatus::Completed, None)
            .await
            .unwrap();
        log.update_action_status(failed, ActionStatus::Failed, Some("gave up".to_string()))
            .await
            .unwrap();
        log.cache_data("/customers", json!([]), "customers").await.unwrap();

        clock.advance(Duration::days(8));
        let fresh = log.add_offline_action(create_customer()).await.unwrap();
        log.update_action_status(fresh, ActionStatus::Completed, None)
            .await
            .unwrap();

        let report = log.cleanup().await.unwrap();
        assert_eq!(report.actions_removed, 1);
        assert_eq!(report.cache_removed, 1);
        // Three enqueue entries from eight days ago.
        assert_eq!(report.logs_removed, 3);

        assert!(matches!(log.get_action(completed).await, Err(Error::NotFound(_))));
        assert_eq!(log.get_action(failed).await.unwrap().status, ActionStatus::Failed);
        assert_eq!(log.get_action(pending).await.unwrap().status, ActionStatus::Pending);
        assert_eq!(log.get_action(fresh).await.unwrap().status, ActionStatus::Completed);
    }

    #[tokio::test]
    async fn test_closed_log_rejects_calls() {
        let (log, _clock) = manual_log().await;
        log.close().await.unwrap();
        assert!(matches!(
            log.get_pending_actions().await,
            Err(Error::Initialization(_))
        ));
    }
}
