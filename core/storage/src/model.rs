//! Records persisted by the action log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use offsync_common::{
    ActionId, ActionStatus, ActionType, Error, HttpMethod, LogStatus, Priority, Result,
};

/// Enqueue request for a new mutation.
///
/// This is what UI and business-logic callers hand to the engine; the log
/// fills in identity, status and timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAction {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    /// Logical entity-type name, used to pick a conflict strategy.
    pub module: String,
    pub endpoint: String,
    pub method: HttpMethod,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub dependencies: Vec<ActionId>,
}

impl NewAction {
    /// Create an enqueue request with no payload and normal priority.
    pub fn new(
        action_type: ActionType,
        module: impl Into<String>,
        endpoint: impl Into<String>,
        method: HttpMethod,
    ) -> Self {
        Self {
            action_type,
            module: module.into(),
            endpoint: endpoint.into(),
            method,
            data: None,
            headers: BTreeMap::new(),
            priority: Priority::Normal,
            dependencies: Vec::new(),
        }
    }

    /// Attach the payload.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Add a request header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Set the priority tier.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Declare actions that must complete before this one is sent.
    pub fn with_dependencies(mut self, dependencies: Vec<ActionId>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Reject requests that could never be replayed.
    pub fn validate(&self) -> Result<()> {
        if self.module.trim().is_empty() {
            return Err(Error::InvalidInput("Action module cannot be empty".to_string()));
        }
        if self.endpoint.trim().is_empty() {
            return Err(Error::InvalidInput("Action endpoint cannot be empty".to_string()));
        }
        Ok(())
    }
}

/// A queued mutation as stored in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineAction {
    pub id: ActionId,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub module: String,
    pub endpoint: String,
    pub method: HttpMethod,
    pub data: Option<Value>,
    pub headers: BTreeMap<String, String>,
    /// Enqueue time.
    pub timestamp: DateTime<Utc>,
    pub status: ActionStatus,
    pub retry_count: u32,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub priority: Priority,
    pub dependencies: Vec<ActionId>,
}

impl OfflineAction {
    /// Build the stored form of an enqueue request.
    pub fn from_new(id: ActionId, action: &NewAction, timestamp: DateTime<Utc>) -> Self {
        Self {
            id,
            action_type: action.action_type,
            module: action.module.clone(),
            endpoint: action.endpoint.clone(),
            method: action.method,
            data: action.data.clone(),
            headers: action.headers.clone(),
            timestamp,
            status: ActionStatus::Pending,
            retry_count: 0,
            completed_at: None,
            error: None,
            priority: action.priority,
            dependencies: action.dependencies.clone(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == ActionStatus::Pending
    }

    /// Short label used in audit entries and log lines.
    pub fn label(&self) -> String {
        format!("{} {}", self.action_type, self.module)
    }
}

/// A cached read response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedEntry {
    /// Request identity, usually the endpoint.
    pub key: String,
    pub data: Value,
    pub module: String,
    pub timestamp: DateTime<Utc>,
}

/// Append-only audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncLogEntry {
    /// Row id, assigned on append.
    #[serde(default)]
    pub id: Option<i64>,
    /// Human-readable label, e.g. `"sync update tasks"`.
    pub action: String,
    pub status: LogStatus,
    pub message: String,
    pub details: Value,
    pub timestamp: DateTime<Utc>,
}

impl SyncLogEntry {
    /// Create an entry stamped with `timestamp`.
    pub fn new(
        action: impl Into<String>,
        status: LogStatus,
        message: impl Into<String>,
        details: Value,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            action: action.into(),
            status,
            message: message.into(),
            details,
            timestamp,
        }
    }

    /// The action this entry refers to, if any.
    pub fn action_id(&self) -> Option<ActionId> {
        self.details
            .get("actionId")
            .and_then(Value::as_i64)
            .map(ActionId::new)
    }

    /// Whether the entry records a sync attempt (as opposed to the enqueue).
    pub fn is_attempt(&self) -> bool {
        self.details.get("phase").and_then(Value::as_str) == Some("attempt")
    }
}

/// Rows removed by a cleanup run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub actions_removed: usize,
    pub cache_removed: usize,
    pub logs_removed: usize,
}

/// Row counts across the log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogStats {
    pub pending: usize,
    pub completed: usize,
    pub failed: usize,
    pub cached: usize,
    pub logs: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_action_from_json() {
        let action: NewAction = serde_json::from_value(json!({
            "type": "create",
            "module": "customers",
            "endpoint": "/customers",
            "method": "POST",
            "data": {"name": "Acme"},
            "priority": "high"
        }))
        .unwrap();

        assert_eq!(action.action_type, ActionType::Create);
        assert_eq!(action.method, HttpMethod::Post);
        assert_eq!(action.priority, Priority::High);
        assert!(action.headers.is_empty());
        assert!(action.dependencies.is_empty());
    }

    #[test]
    fn test_validate_rejects_blank_endpoint() {
        let action = NewAction::new(ActionType::Delete, "tasks", " ", HttpMethod::Delete);
        assert!(matches!(action.validate(), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_from_new_starts_pending() {
        let request = NewAction::new(ActionType::Update, "tasks", "/tasks/1", HttpMethod::Put)
            .with_priority(Priority::Critical)
            .with_header("X-Tenant", "acme");
        let action = OfflineAction::from_new(ActionId::new(4), &request, Utc::now());

        assert!(action.is_pending());
        assert_eq!(action.retry_count, 0);
        assert_eq!(action.priority, Priority::Critical);
        assert_eq!(action.headers.get("X-Tenant").map(String::as_str), Some("acme"));
        assert_eq!(action.label(), "update tasks");
    }

    #[test]
    fn test_log_entry_action_lookup() {
        let entry = SyncLogEntry::new(
            "sync create customers",
            LogStatus::Error,
            "HTTP 500",
            json!({"actionId": 12, "phase": "attempt"}),
            Utc::now(),
        );
        assert_eq!(entry.action_id(), Some(ActionId::new(12)));
        assert!(entry.is_attempt());
    }
}
