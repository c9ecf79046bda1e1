//! Common types used throughout Offsync.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Identifier of a queued action.
///
/// Identifiers are assigned by the action log in increasing order and are
/// never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(i64);

impl ActionId {
    /// Wrap a raw identifier.
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the raw value.
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ActionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<i64>()
            .map(Self)
            .map_err(|_| Error::InvalidInput(format!("Invalid action id: {}", s)))
    }
}

/// Kind of mutation an action carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Create,
    Update,
    Delete,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Create => "create",
            ActionType::Update => "update",
            ActionType::Delete => "delete",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "create" => Ok(ActionType::Create),
            "update" => Ok(ActionType::Update),
            "delete" => Ok(ActionType::Delete),
            other => Err(Error::InvalidInput(format!("Unknown action type: {}", other))),
        }
    }
}

/// HTTP verb used when replaying an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }

    /// Whether the request carries a body.
    pub fn has_body(&self) -> bool {
        !matches!(self, HttpMethod::Get)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "PATCH" => Ok(HttpMethod::Patch),
            "DELETE" => Ok(HttpMethod::Delete),
            other => Err(Error::InvalidInput(format!("Unsupported method: {}", other))),
        }
    }
}

/// Lifecycle status of a queued action.
///
/// The only legal transitions are `Pending -> Completed` and
/// `Pending -> Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Pending,
    Completed,
    Failed,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Completed => "completed",
            ActionStatus::Failed => "failed",
        }
    }

    /// Completed and failed actions never change status again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ActionStatus::Pending)
    }

    /// Check whether moving from `self` to `next` is allowed.
    ///
    /// Re-applying the current status is accepted so that status updates
    /// stay idempotent.
    pub fn can_transition_to(&self, next: ActionStatus) -> bool {
        *self == next || *self == ActionStatus::Pending
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ActionStatus::Pending),
            "completed" => Ok(ActionStatus::Completed),
            "failed" => Ok(ActionStatus::Failed),
            other => Err(Error::InvalidInput(format!("Unknown action status: {}", other))),
        }
    }
}

/// Outcome recorded in an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Success,
    Error,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Success => "success",
            LogStatus::Error => "error",
        }
    }
}

impl fmt::Display for LogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "success" => Ok(LogStatus::Success),
            "error" => Ok(LogStatus::Error),
            other => Err(Error::InvalidInput(format!("Unknown log status: {}", other))),
        }
    }
}

/// Priority tier of a queued operation. Lower tiers are dequeued first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical = 1,
    High = 2,
    #[default]
    Normal = 3,
    Low = 4,
}

impl Priority {
    /// Numeric tier (1 = critical .. 4 = low).
    pub fn tier(&self) -> u8 {
        *self as u8
    }

    /// Build a priority from its numeric tier.
    pub fn from_tier(tier: i64) -> Result<Self> {
        match tier {
            1 => Ok(Priority::Critical),
            2 => Ok(Priority::High),
            3 => Ok(Priority::Normal),
            4 => Ok(Priority::Low),
            other => Err(Error::InvalidInput(format!("Priority tier out of range: {}", other))),
        }
    }

    /// Critical and high priority work triggers an immediate pass.
    pub fn is_urgent(&self) -> bool {
        matches!(self, Priority::Critical | Priority::High)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => other
                .parse::<i64>()
                .map_err(|_| Error::InvalidInput(format!("Unknown priority: {}", other)))
                .and_then(Priority::from_tier),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_status_transitions() {
        assert!(ActionStatus::Pending.can_transition_to(ActionStatus::Completed));
        assert!(ActionStatus::Pending.can_transition_to(ActionStatus::Failed));
        assert!(ActionStatus::Completed.can_transition_to(ActionStatus::Completed));
        assert!(!ActionStatus::Completed.can_transition_to(ActionStatus::Pending));
        assert!(!ActionStatus::Completed.can_transition_to(ActionStatus::Failed));
        assert!(!ActionStatus::Failed.can_transition_to(ActionStatus::Completed));
    }

    #[test]
    fn test_priority_ordering() {
        let mut tiers = vec![Priority::Low, Priority::Critical, Priority::Normal, Priority::High];
        tiers.sort();
        assert_eq!(
            tiers,
            vec![Priority::Critical, Priority::High, Priority::Normal, Priority::Low]
        );
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_priority_parsing() {
        assert_eq!("CRITICAL".parse::<Priority>().unwrap(), Priority::Critical);
        assert_eq!("2".parse::<Priority>().unwrap(), Priority::High);
        assert!("urgent".parse::<Priority>().is_err());
        assert!("9".parse::<Priority>().is_err());
    }

    #[test]
    fn test_method_serialization() {
        let json = serde_json::to_string(&HttpMethod::Patch).unwrap();
        assert_eq!(json, "\"PATCH\"");
        assert!(!HttpMethod::Get.has_body());
        assert_eq!("put".parse::<HttpMethod>().unwrap(), HttpMethod::Put);
    }

    proptest! {
        #[test]
        fn prop_priority_tier_roundtrip(tier in 1i64..=4) {
            let priority = Priority::from_tier(tier).unwrap();
            prop_assert_eq!(priority.tier() as i64, tier);
        }

        #[test]
        fn prop_terminal_status_is_sticky(next in 0usize..3) {
            let all = [ActionStatus::Pending, ActionStatus::Completed, ActionStatus::Failed];
            for terminal in [ActionStatus::Completed, ActionStatus::Failed] {
                let target = all[next];
                prop_assert_eq!(terminal.can_transition_to(target), target == terminal);
            }
        }
    }
}
