//! SQLite storage backend.
//!
//! Persists the action queue, read cache and audit trail in three tables.
//! All database work runs on the blocking thread pool; each backend call is
//! a single transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

use offsync_common::{ActionId, ActionStatus, Error, LogStatus, Priority, Result};

use crate::backend::StorageBackend;
use crate::model::{CachedEntry, CleanupReport, LogStats, NewAction, OfflineAction, SyncLogEntry};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS actions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    action_type TEXT NOT NULL,
    module TEXT NOT NULL,
    endpoint TEXT NOT NULL,
    method TEXT NOT NULL,
    data TEXT,
    headers TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    status TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    completed_at INTEGER,
    error TEXT,
    priority INTEGER NOT NULL DEFAULT 3,
    dependencies TEXT NOT NULL DEFAULT '[]'
);

CREATE INDEX IF NOT EXISTS idx_actions_timestamp ON actions(timestamp);
CREATE INDEX IF NOT EXISTS idx_actions_type ON actions(action_type);
CREATE INDEX IF NOT EXISTS idx_actions_status ON actions(status);

CREATE TABLE IF NOT EXISTS cache (
    key TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    module TEXT NOT NULL,
    timestamp INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_cache_timestamp ON cache(timestamp);
CREATE INDEX IF NOT EXISTS idx_cache_module ON cache(module);

CREATE TABLE IF NOT EXISTS logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    action TEXT NOT NULL,
    status TEXT NOT NULL,
    message TEXT NOT NULL,
    details TEXT NOT NULL,
    timestamp INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);
CREATE INDEX IF NOT EXISTS idx_logs_status ON logs(status);
"#;

const ACTION_COLUMNS: &str = "id, action_type, module, endpoint, method, data, headers, \
     timestamp, status, retry_count, completed_at, error, priority, dependencies";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn sql_err(err: rusqlite::Error) -> Error {
    Error::Storage(err.to_string())
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| Error::Storage(format!("Timestamp out of range: {}", ms)))
}

/// Raw column values of an `actions` row.
struct ActionRow {
    id: i64,
    action_type: String,
    module: String,
    endpoint: String,
    method: String,
    data: Option<String>,
    headers: String,
    timestamp: i64,
    status: String,
    retry_count: i64,
    completed_at: Option<i64>,
    error: Option<String>,
    priority: i64,
    dependencies: String,
}

impl ActionRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            action_type: row.get(1)?,
            module: row.get(2)?,
            endpoint: row.get(3)?,
            method: row.get(4)?,
            data: row.get(5)?,
            headers: row.get(6)?,
            timestamp: row.get(7)?,
            status: row.get(8)?,
            retry_count: row.get(9)?,
            completed_at: row.get(10)?,
            error: row.get(11)?,
            priority: row.get(12)?,
            dependencies: row.get(13)?,
        })
    }

    fn into_action(self) -> Result<OfflineAction> {
        Ok(OfflineAction {
            id: ActionId::new(self.id),
            action_type: self.action_type.parse()?,
            module: self.module,
            endpoint: self.endpoint,
            method: self.method.parse()?,
            data: self.data.as_deref().map(serde_json::from_str).transpose()?,
            headers: serde_json::from_str(&self.headers)?,
            timestamp: from_millis(self.timestamp)?,
            status: self.status.parse()?,
            retry_count: u32::try_from(self.retry_count)
                .map_err(|_| Error::Storage(format!("Bad retry count: {}", self.retry_count)))?,
            completed_at: self.completed_at.map(from_millis).transpose()?,
            error: self.error,
            priority: Priority::from_tier(self.priority)?,
            dependencies: serde_json::from_str(&self.dependencies)?,
        })
    }
}

fn read_action(conn: &Connection, id: ActionId) -> Result<Option<OfflineAction>> {
    let sql = format!("SELECT {} FROM actions WHERE id = ?1", ACTION_COLUMNS);
    conn.query_row(&sql, params![id.get()], ActionRow::read)
        .optional()
        .map_err(sql_err)?
        .map(ActionRow::into_action)
        .transpose()
}

fn read_status(conn: &Connection, id: ActionId) -> Result<ActionStatus> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM actions WHERE id = ?1",
            params![id.get()],
            |row| row.get(0),
        )
        .optional()
        .map_err(sql_err)?;

    status
        .ok_or_else(|| Error::NotFound(format!("Action not found: {}", id)))?
        .parse()
}

/// SQLite-backed durable store.
pub struct SqliteBackend {
    path: PathBuf,
    conn: Arc<Mutex<Option<Connection>>>,
}

impl SqliteBackend {
    /// Create a backend for the database file at `path`.
    ///
    /// Nothing is opened until [`StorageBackend::init`] runs.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            conn: Arc::new(Mutex::new(None)),
        }
    }

    /// Create a backend for a private in-memory database (for testing).
    pub fn in_memory() -> Self {
        Self::new(":memory:")
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `op` against the open connection on the blocking pool.
    async fn call<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| Error::Storage("SQLite connection lock poisoned".to_string()))?;
            let conn = guard
                .as_mut()
                .ok_or_else(|| Error::Storage("SQLite store is not open".to_string()))?;
            op(conn)
        })
        .await
        .map_err(|e| Error::Storage(format!("Storage task failed: {}", e)))?
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn init(&self) -> Result<()> {
        let path = self.path.clone();
        let slot = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path).map_err(|e| {
                Error::Initialization(format!("Cannot open {}: {}", path.display(), e))
            })?;
            conn.busy_timeout(BUSY_TIMEOUT)
                .and_then(|_| conn.execute_batch(SCHEMA))
                .map_err(|e| Error::Initialization(format!("Cannot create schema: {}", e)))?;

            let mut guard = slot
                .lock()
                .map_err(|_| Error::Initialization("SQLite connection lock poisoned".to_string()))?;
            *guard = Some(conn);
            info!("Action log opened at {}", path.display());
            Ok(())
        })
        .await
        .map_err(|e| Error::Initialization(format!("Storage task failed: {}", e)))?
    }

    async fn close(&self) -> Result<()> {
        let slot = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = slot
                .lock()
                .map_err(|_| Error::Storage("SQLite connection lock poisoned".to_string()))?;
            if let Some(conn) = guard.take() {
                conn.close().map_err(|(_, e)| sql_err(e))?;
                debug!("Action log closed");
            }
            Ok(())
        })
        .await
        .map_err(|e| Error::Storage(format!("Storage task failed: {}", e)))?
    }

    async fn insert_action(
        &self,
        action: &NewAction,
        timestamp: DateTime<Utc>,
    ) -> Result<OfflineAction> {
        let action = action.clone();
        let data = action.data.as_ref().map(serde_json::to_string).transpose()?;
        let headers = serde_json::to_string(&action.headers)?;
        let dependencies = serde_json::to_string(&action.dependencies)?;

        self.call(move |conn| {
            conn.execute(
                r#"
                INSERT INTO actions
                (action_type, module, endpoint, method, data, headers, timestamp,
                 status, retry_count, priority, dependencies)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, ?10)
                "#,
                params![
                    action.action_type.as_str(),
                    action.module,
                    action.endpoint,
                    action.method.as_str(),
                    data,
                    headers,
                    to_millis(timestamp),
                    ActionStatus::Pending.as_str(),
                    action.priority.tier() as i64,
                    dependencies,
                ],
            )
            .map_err(sql_err)?;

            let id = ActionId::new(conn.last_insert_rowid());
            Ok(OfflineAction::from_new(id, &action, timestamp))
        })
        .await
    }

    async fn get_action(&self, id: ActionId) -> Result<Option<OfflineAction>> {
        self.call(move |conn| read_action(conn, id)).await
    }

    async fn actions_with_status(&self, status: ActionStatus) -> Result<Vec<OfflineAction>> {
        self.call(move |conn| {
            let sql = format!("SELECT {} FROM actions WHERE status = ?1", ACTION_COLUMNS);
            let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
            let rows = stmt
                .query_map(params![status.as_str()], ActionRow::read)
                .map_err(sql_err)?;

            let mut actions = Vec::new();
            for row in rows {
                actions.push(row.map_err(sql_err)?.into_action()?);
            }
            Ok(actions)
        })
        .await
    }

    async fn set_status(
        &self,
        id: ActionId,
        status: ActionStatus,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.call(move |conn| {
            let tx = conn.transaction().map_err(sql_err)?;
            let current = read_status(&tx, id)?;
            if !current.can_transition_to(status) {
                return Err(Error::InvalidTransition(format!(
                    "Action {} is {} and cannot become {}",
                    id, current, status
                )));
            }

            let completed_at = status.is_terminal().then(|| to_millis(at));
            tx.execute(
                r#"
                UPDATE actions
                SET status = ?1,
                    completed_at = COALESCE(completed_at, ?2),
                    error = COALESCE(?3, error)
                WHERE id = ?4
                "#,
                params![status.as_str(), completed_at, error, id.get()],
            )
            .map_err(sql_err)?;
            tx.commit().map_err(sql_err)
        })
        .await
    }

    async fn record_failure(&self, id: ActionId, error: &str) -> Result<u32> {
        let error = error.to_string();
        self.call(move |conn| {
            let tx = conn.transaction().map_err(sql_err)?;
            let current = read_status(&tx, id)?;
            if current.is_terminal() {
                return Err(Error::InvalidTransition(format!(
                    "Action {} is already {}",
                    id, current
                )));
            }

            tx.execute(
                "UPDATE actions SET retry_count = retry_count + 1, error = ?1 WHERE id = ?2",
                params![error, id.get()],
            )
            .map_err(sql_err)?;
            let count: i64 = tx
                .query_row(
                    "SELECT retry_count FROM actions WHERE id = ?1",
                    params![id.get()],
                    |row| row.get(0),
                )
                .map_err(sql_err)?;
            tx.commit().map_err(sql_err)?;

            u32::try_from(count).map_err(|_| Error::Storage(format!("Bad retry count: {}", count)))
        })
        .await
    }

    async fn upsert_cache(&self, entry: &CachedEntry) -> Result<()> {
        let entry = entry.clone();
        let data = serde_json::to_string(&entry.data)?;
        self.call(move |conn| {
            conn.execute(
                r#"
                INSERT OR REPLACE INTO cache (key, data, module, timestamp)
                VALUES (?1, ?2, ?3, ?4)
                "#,
                params![entry.key, data, entry.module, to_millis(entry.timestamp)],
            )
            .map_err(sql_err)?;
            Ok(())
        })
        .await
    }

    async fn get_cache(&self, key: &str) -> Result<Option<CachedEntry>> {
        let key = key.to_string();
        self.call(move |conn| {
            let row: Option<(String, String, String, i64)> = conn
                .query_row(
                    "SELECT key, data, module, timestamp FROM cache WHERE key = ?1",
                    params![key],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()
                .map_err(sql_err)?;

            row.map(|(key, data, module, timestamp)| {
                Ok(CachedEntry {
                    key,
                    data: serde_json::from_str(&data)?,
                    module,
                    timestamp: from_millis(timestamp)?,
                })
            })
            .transpose()
        })
        .await
    }

    async fn append_log(&self, entry: &SyncLogEntry) -> Result<i64> {
        let entry = entry.clone();
        let details = serde_json::to_string(&entry.details)?;
        self.call(move |conn| {
            conn.execute(
                r#"
                INSERT INTO logs (action, status, message, details, timestamp)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    entry.action,
                    entry.status.as_str(),
                    entry.message,
                    details,
                    to_millis(entry.timestamp),
                ],
            )
            .map_err(sql_err)?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn logs(&self, limit: Option<usize>) -> Result<Vec<SyncLogEntry>> {
        // SQLite treats a negative LIMIT as "no limit".
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        self.call(move |conn| {
            let mut stmt = conn
                .prepare(
                    r#"
                    SELECT id, action, status, message, details, timestamp FROM (
                        SELECT * FROM logs ORDER BY id DESC LIMIT ?1
                    ) ORDER BY id ASC
                    "#,
                )
                .map_err(sql_err)?;
            let rows = stmt
                .query_map(params![limit], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                })
                .map_err(sql_err)?;

            let mut entries = Vec::new();
            for row in rows {
                let (id, action, status, message, details, timestamp) = row.map_err(sql_err)?;
                entries.push(SyncLogEntry {
                    id: Some(id),
                    action,
                    status: status.parse::<LogStatus>()?,
                    message,
                    details: serde_json::from_str(&details)?,
                    timestamp: from_millis(timestamp)?,
                });
            }
            Ok(entries)
        })
        .await
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<CleanupReport> {
        let cutoff = to_millis(cutoff);
        self.call(move |conn| {
            let tx = conn.transaction().map_err(sql_err)?;
            let actions_removed = tx
                .execute(
                    "DELETE FROM actions WHERE status = ?1 AND COALESCE(completed_at, timestamp) < ?2",
                    params![ActionStatus::Completed.as_str(), cutoff],
                )
                .map_err(sql_err)?;
            let cache_removed = tx
                .execute("DELETE FROM cache WHERE timestamp < ?1", params![cutoff])
                .map_err(sql_err)?;
            let logs_removed = tx
                .execute("DELETE FROM logs WHERE timestamp < ?1", params![cutoff])
                .map_err(sql_err)?;
            tx.commit().map_err(sql_err)?;

            Ok(CleanupReport {
                actions_removed,
                cache_removed,
                logs_removed,
            })
        })
        .await
    }

    async fn stats(&self) -> Result<LogStats> {
        self.call(|conn| {
            let mut stats = LogStats::default();
            {
                let mut stmt = conn
                    .prepare("SELECT status, COUNT(*) FROM actions GROUP BY status")
                    .map_err(sql_err)?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
                    .map_err(sql_err)?;
                for row in rows {
                    let (status, count) = row.map_err(sql_err)?;
                    let count = count as usize;
                    match status.parse::<ActionStatus>()? {
                        ActionStatus::Pending => stats.pending = count,
                        ActionStatus::Completed => stats.completed = count,
                        ActionStatus::Failed => stats.failed = count,
                    }
                }
            }

            let count = |table: &str| -> Result<usize> {
                let sql = format!("SELECT COUNT(*) FROM {}", table);
                conn.query_row(&sql, [], |row| row.get::<_, i64>(0))
                    .map(|c| c as usize)
                    .map_err(sql_err)
            };
            stats.cached = count("cache")?;
            stats.logs = count("logs")?;
            Ok(stats)
        })
        .await
    }
}
