//! In-memory storage backend for testing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use offsync_common::{ActionId, ActionStatus, Error, Result};

use crate::backend::StorageBackend;
use crate::model::{CachedEntry, CleanupReport, LogStats, NewAction, OfflineAction, SyncLogEntry};

#[derive(Debug, Default)]
struct MemoryState {
    next_action_id: i64,
    next_log_id: i64,
    actions: BTreeMap<ActionId, OfflineAction>,
    cache: HashMap<String, CachedEntry>,
    logs: Vec<SyncLogEntry>,
}

/// In-memory storage backend.
///
/// Useful for testing and development. All data is stored in memory
/// and lost on drop.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: RwLock<MemoryState>,
    open: AtomicBool,
    unavailable: bool,
}

impl MemoryBackend {
    /// Create a new empty memory backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend whose `init` always fails, for exercising startup failure.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryState>> {
        self.ensure_open()?;
        self.state
            .read()
            .map_err(|_| Error::Storage("Memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryState>> {
        self.ensure_open()?;
        self.state
            .write()
            .map_err(|_| Error::Storage("Memory store lock poisoned".to_string()))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Storage("Memory store is not open".to_string()))
        }
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn init(&self) -> Result<()> {
        if self.unavailable {
            return Err(Error::Initialization(
                "Memory store marked unavailable".to_string(),
            ));
        }
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn insert_action(
        &self,
        action: &NewAction,
        timestamp: DateTime<Utc>,
    ) -> Result<OfflineAction> {
        let mut state = self.write()?;
        state.next_action_id += 1;
        let id = ActionId::new(state.next_action_id);
        let stored = OfflineAction::from_new(id, action, timestamp);
        state.actions.insert(id, stored.clone());
        Ok(stored)
    }

    async fn get_action(&self, id: ActionId) -> Result<Option<OfflineAction>> {
        Ok(self.read()?.actions.get(&id).cloned())
    }

    async fn actions_with_status(&self, status: ActionStatus) -> Result<Vec<OfflineAction>> {
        Ok(self
            .read()?
            .actions
            .values()
            .filter(|a| a.status == status)
            .cloned()
            .collect())
    }

    async fn set_status(
        &self,
        id: ActionId,
        status: ActionStatus,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.write()?;
        let action = state
            .actions
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("Action not found: {}", id)))?;

        if !action.status.can_transition_to(status) {
            return Err(Error::InvalidTransition(format!(
                "Action {} is {} and cannot become {}",
                id, action.status, status
            )));
        }

        action.status = status;
        if status.is_terminal() && action.completed_at.is_none() {
            action.completed_at = Some(at);
        }
        if error.is_some() {
            action.error = error;
        }
        Ok(())
    }

    async fn record_failure(&self, id: ActionId, error: &str) -> Result<u32> {
        let mut state = self.write()?;
        let action = state
            .actions
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("Action not found: {}", id)))?;

        if action.status.is_terminal() {
            return Err(Error::InvalidTransition(format!(
                "Action {} is already {}",
                id, action.status
            )));
        }

        action.retry_count += 1;
        action.error = Some(error.to_string());
        Ok(action.retry_count)
    }

    async fn upsert_cache(&self, entry: &CachedEntry) -> Result<()> {
        self.write()?.cache.insert(entry.key.clone(), entry.clone());
        Ok(())
    }

    async fn get_cache(&self, key: &str) -> Result<Option<CachedEntry>> {
        Ok(self.read()?.cache.get(key).cloned())
    }

    async fn append_log(&self, entry: &SyncLogEntry) -> Result<i64> {
        let mut state = self.write()?;
        state.next_log_id += 1;
        let id = state.next_log_id;
        let mut stored = entry.clone();
        stored.id = Some(id);
        state.logs.push(stored);
        Ok(id)
    }

    async fn logs(&self, limit: Option<usize>) -> Result<Vec<SyncLogEntry>> {
        let state = self.read()?;
        let skip = limit
            .map(|l| state.logs.len().saturating_sub(l))
            .unwrap_or(0);
        Ok(state.logs.iter().skip(skip).cloned().collect())
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<CleanupReport> {
        let mut state = self.write()?;

        let actions_before = state.actions.len();
        state
            .actions
            .retain(|_, a| {
                let finished = a.completed_at.unwrap_or(a.timestamp);
                !(a.status == ActionStatus::Completed && finished < cutoff)
            });

        let cache_before = state.cache.len();
        state.cache.retain(|_, c| c.timestamp >= cutoff);

        let logs_before = state.logs.len();
        state.logs.retain(|l| l.timestamp >= cutoff);

        Ok(CleanupReport {
            actions_removed: actions_before - state.actions.len(),
            cache_removed: cache_before - state.cache.len(),
            logs_removed: logs_before - state.logs.len(),
        })
    }

    async fn stats(&self) -> Result<LogStats> {
        let state = self.read()?;
        let count = |status| state.actions.values().filter(|a| a.status == status).count();
        Ok(LogStats {
            pending: count(ActionStatus::Pending),
            completed: count(ActionStatus::Completed),
            failed: count(ActionStatus::Failed),
            cached: state.cache.len(),
            logs: state.logs.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use offsync_common::{ActionType, HttpMethod};

    async fn open_backend() -> MemoryBackend {
        let backend = MemoryBackend::new();
        backend.init().await.unwrap();
        backend
    }

    fn request() -> NewAction {
        NewAction::new(ActionType::Create, "customers", "/customers", HttpMethod::Post)
    }

    #[tokio::test]
    async fn test_ids_are_monotonic() {
        let backend = open_backend().await;
        let first = backend.insert_action(&request(), Utc::now()).await.unwrap();
        let second = backend.insert_action(&request(), Utc::now()).await.unwrap();
        assert!(second.id > first.id);
    }

    #[tokio::test]
    async fn test_unopened_backend_rejects_calls() {
        let backend = MemoryBackend::new();
        let result = backend.insert_action(&request(), Utc::now()).await;
        assert!(matches!(result, Err(Error::Storage(_))));
    }

    #[tokio::test]
    async fn test_unavailable_backend_fails_init() {
        let backend = MemoryBackend::unavailable();
        assert!(matches!(backend.init().await, Err(Error::Initialization(_))));
    }

    #[tokio::test]
    async fn test_terminal_status_is_final() {
        let backend = open_backend().await;
        let action = backend.insert_action(&request(), Utc::now()).await.unwrap();

        backend
            .set_status(action.id, ActionStatus::Failed, Some("boom".to_string()), Utc::now())
            .await
            .unwrap();
        let result = backend
            .set_status(action.id, ActionStatus::Completed, None, Utc::now())
            .await;
        assert!(matches!(result, Err(Error::InvalidTransition(_))));

        let failure = backend.record_failure(action.id, "again").await;
        assert!(matches!(failure, Err(Error::InvalidTransition(_))));
    }

    #[tokio::test]
    async fn test_logs_limit_keeps_newest() {
        let backend = open_backend().await;
        for i in 0..5 {
            let entry = SyncLogEntry::new(
                "sync",
                offsync_common::LogStatus::Success,
                format!("entry {}", i),
                serde_json::Value::Null,
                Utc::now(),
            );
            backend.append_log(&entry).await.unwrap();
        }

        let logs = backend.logs(Some(2)).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].message, "entry 3");
        assert_eq!(logs[1].message, "entry 4");
    }

    #[tokio::test]
    async fn test_purge_keeps_recently_completed() {
        let backend = open_backend().await;
        let enqueued = Utc::now() - chrono::Duration::days(8);
        let recent = backend.insert_action(&request(), enqueued).await.unwrap();
        let stale = backend.insert_action(&request(), enqueued).await.unwrap();
        backend
            .set_status(recent.id, ActionStatus::Completed, None, Utc::now())
            .await
            .unwrap();
        backend
            .set_status(stale.id, ActionStatus::Completed, None, enqueued)
            .await
            .unwrap();

        let report = backend
            .purge_before(Utc::now() - chrono::Duration::days(7))
            .await
            .unwrap();
        assert_eq!(report.actions_removed, 1);
        assert!(backend.get_action(recent.id).await.unwrap().is_some());
        assert!(backend.get_action(stale.id).await.unwrap().is_none());
    }
}
