//! Field-level conflict detection and resolution.
//!
//! The resolver compares the locally queued payload of an update against a
//! fresh snapshot of the same remote entity. When the two snapshots were
//! written more than a second apart, every differing field becomes a
//! [`ConflictRecord`], which is then settled by the strategy registered for
//! the entity's module.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Snapshots written within this many milliseconds of each other never
/// conflict.
pub const TIMESTAMP_TOLERANCE_MS: i64 = 1_000;

/// Fields carrying the last-modified time of an entity.
const UPDATED_FIELDS: &[&str] = &["updatedAt", "updated_at"];

/// Identity and bookkeeping fields that are never compared.
const IGNORED_FIELDS: &[&str] = &[
    "id",
    "createdAt",
    "created_at",
    "updatedAt",
    "updated_at",
];

/// Shape of the values involved in a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    Array,
    Object,
    Number,
    Text,
    Boolean,
    Null,
    /// The two sides hold values of different JSON types.
    TypeMismatch,
}

impl ConflictKind {
    fn classify(client: &Value, server: &Value) -> Self {
        match (client, server) {
            (Value::Array(_), Value::Array(_)) => ConflictKind::Array,
            (Value::Object(_), Value::Object(_)) => ConflictKind::Object,
            (Value::Number(_), Value::Number(_)) => ConflictKind::Number,
            (Value::String(_), Value::String(_)) => ConflictKind::Text,
            (Value::Bool(_), Value::Bool(_)) => ConflictKind::Boolean,
            (Value::Null, Value::Null) => ConflictKind::Null,
            _ => ConflictKind::TypeMismatch,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictKind::Array => "array",
            ConflictKind::Object => "object",
            ConflictKind::Number => "number",
            ConflictKind::Text => "text",
            ConflictKind::Boolean => "boolean",
            ConflictKind::Null => "null",
            ConflictKind::TypeMismatch => "type_mismatch",
        }
    }
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single field-level divergence between local and remote snapshots.
///
/// Records live only for the duration of one sync attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub id: String,
    pub field: String,
    pub client_value: Value,
    pub server_value: Value,
    pub client_timestamp: DateTime<Utc>,
    pub server_timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: ConflictKind,
}

impl ConflictRecord {
    /// Whether the local side was written after the remote side.
    pub fn client_is_newer(&self) -> bool {
        self.client_timestamp >= self.server_timestamp
    }
}

/// Custom per-field merge used by [`ConflictStrategy::Merge`].
pub type FieldMerge = Arc<dyn Fn(&ConflictRecord) -> Value + Send + Sync>;

/// How conflicts for a module are settled.
#[derive(Clone)]
pub enum ConflictStrategy {
    /// Always take the local value.
    ClientWins,
    /// Always take the remote value.
    ServerWins,
    /// Combine both sides, with a custom merge or the default type-aware one.
    Merge(Option<FieldMerge>),
    /// Refuse to resolve automatically.
    Manual,
}

impl ConflictStrategy {
    /// Merge with the default type-aware rules.
    pub fn merge() -> Self {
        ConflictStrategy::Merge(None)
    }

    /// Merge with a custom per-field function.
    pub fn merge_with<F>(merge: F) -> Self
    where
        F: Fn(&ConflictRecord) -> Value + Send + Sync + 'static,
    {
        ConflictStrategy::Merge(Some(Arc::new(merge)))
    }

    pub fn name(&self) -> &'static str {
        match self {
            ConflictStrategy::ClientWins => "client-wins",
            ConflictStrategy::ServerWins => "server-wins",
            ConflictStrategy::Merge(_) => "merge",
            ConflictStrategy::Manual => "manual",
        }
    }
}

impl fmt::Debug for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictStrategy::Merge(Some(_)) => f.write_str("Merge(custom)"),
            other => f.write_str(other.name()),
        }
    }
}

/// Outcome of resolving the conflicts of one entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    /// Resolved value for every conflicting field. Empty when manual
    /// resolution is required.
    pub resolved: Map<String, Value>,
    pub conflict_count: usize,
    /// Name of the strategy that was applied.
    pub strategy: &'static str,
    pub requires_manual: bool,
}

impl Resolution {
    fn empty(strategy: &'static str) -> Self {
        Self {
            resolved: Map::new(),
            conflict_count: 0,
            strategy,
            requires_manual: false,
        }
    }

    /// Overwrite the conflicting fields of `payload` with their resolved
    /// values. Non-object payloads are left untouched.
    pub fn apply_to(&self, payload: &mut Value) {
        if let Value::Object(fields) = payload {
            for (field, value) in &self.resolved {
                fields.insert(field.clone(), value.clone());
            }
        }
    }
}

/// Conflicts grouped for audit and observability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictSummary {
    pub total: usize,
    pub by_field: BTreeMap<String, usize>,
    pub by_kind: BTreeMap<ConflictKind, usize>,
}

/// Parse an RFC 3339 string or epoch-milliseconds number.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

/// Last-modified time of a snapshot, if it carries one.
pub fn updated_at(snapshot: &Value) -> Option<DateTime<Utc>> {
    UPDATED_FIELDS
        .iter()
        .find_map(|field| snapshot.get(*field))
        .and_then(parse_timestamp)
}

/// Compare a local and a remote snapshot of the same entity.
///
/// Returns nothing unless both snapshots are objects carrying an updated
/// timestamp more than [`TIMESTAMP_TOLERANCE_MS`] apart. Fields missing on
/// the remote side are not conflicts.
pub fn detect_conflicts(local: &Value, remote: &Value) -> Vec<ConflictRecord> {
    let (Value::Object(local_fields), Value::Object(remote_fields)) = (local, remote) else {
        return Vec::new();
    };
    let (Some(client_timestamp), Some(server_timestamp)) = (updated_at(local), updated_at(remote))
    else {
        return Vec::new();
    };

    let skew = (client_timestamp - server_timestamp).num_milliseconds().abs();
    if skew <= TIMESTAMP_TOLERANCE_MS {
        return Vec::new();
    }

    local_fields
        .iter()
        .filter(|(field, _)| !IGNORED_FIELDS.contains(&field.as_str()))
        .filter_map(|(field, client_value)| {
            let server_value = remote_fields.get(field)?;
            if server_value == client_value {
                return None;
            }
            Some(ConflictRecord {
                id: Uuid::new_v4().to_string(),
                field: field.clone(),
                client_value: client_value.clone(),
                server_value: server_value.clone(),
                client_timestamp,
                server_timestamp,
                kind: ConflictKind::classify(client_value, server_value),
            })
        })
        .collect()
}

/// Order-preserving set union: local elements first, then remote elements
/// not already present.
pub fn union_arrays(local: &[Value], remote: &[Value]) -> Vec<Value> {
    let mut merged: Vec<Value> = Vec::with_capacity(local.len() + remote.len());
    for value in local.iter().chain(remote) {
        if !merged.contains(value) {
            merged.push(value.clone());
        }
    }
    merged
}

/// Shallow object merge; local keys win on collision.
pub fn merge_objects(local: &Map<String, Value>, remote: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = remote.clone();
    for (key, value) in local {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// The default type-aware merge of one conflicting field.
pub fn default_merge(conflict: &ConflictRecord) -> Value {
    let newer = || {
        if conflict.client_is_newer() {
            conflict.client_value.clone()
        } else {
            conflict.server_value.clone()
        }
    };

    match (&conflict.client_value, &conflict.server_value) {
        (Value::Array(local), Value::Array(remote)) => Value::Array(union_arrays(local, remote)),
        (Value::Object(local), Value::Object(remote)) => {
            Value::Object(merge_objects(local, remote))
        }
        (Value::Number(local), Value::Number(remote)) => {
            match (local.as_f64(), remote.as_f64()) {
                (Some(l), Some(r)) if r > l => conflict.server_value.clone(),
                (Some(_), Some(_)) => conflict.client_value.clone(),
                _ => newer(),
            }
        }
        _ => newer(),
    }
}

/// Customer records: notes are concatenated, everything else uses the
/// default merge (which unions tag sets).
fn merge_customer_field(conflict: &ConflictRecord) -> Value {
    match (
        conflict.field.as_str(),
        &conflict.server_value,
        &conflict.client_value,
    ) {
        ("notes", Value::String(remote), Value::String(local)) => {
            if remote.contains(local.as_str()) {
                Value::String(remote.clone())
            } else if local.contains(remote.as_str()) {
                Value::String(local.clone())
            } else {
                Value::String(format!("{}\n{}", remote, local))
            }
        }
        _ => default_merge(conflict),
    }
}

/// Per-module conflict resolver.
pub struct ConflictResolver {
    strategies: HashMap<String, ConflictStrategy>,
    fallback: ConflictStrategy,
}

impl ConflictResolver {
    /// Create a resolver with no registered modules; everything falls back to
    /// server-wins.
    pub fn new() -> Self {
        Self {
            strategies: HashMap::new(),
            fallback: ConflictStrategy::ServerWins,
        }
    }

    /// Create a resolver with the stock policies: customers merge, tasks
    /// prefer the client, approvals prefer the server.
    pub fn with_defaults() -> Self {
        let mut resolver = Self::new();
        resolver.register("customers", ConflictStrategy::merge_with(merge_customer_field));
        resolver.register("tasks", ConflictStrategy::ClientWins);
        resolver.register("approvals", ConflictStrategy::ServerWins);
        resolver
    }

    /// Register (or replace) the strategy for a module.
    pub fn register(&mut self, module: impl Into<String>, strategy: ConflictStrategy) {
        self.strategies.insert(module.into(), strategy);
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_strategy(mut self, module: impl Into<String>, strategy: ConflictStrategy) -> Self {
        self.register(module, strategy);
        self
    }

    /// Strategy for `module`. Accepts the singular entity name of a plural
    /// module (`"customer"` finds `"customers"`) and vice versa.
    pub fn strategy_for(&self, module: &str) -> &ConflictStrategy {
        if let Some(strategy) = self.strategies.get(module) {
            return strategy;
        }
        let alternate = match module.strip_suffix('s') {
            Some(singular) => singular.to_string(),
            None => format!("{}s", module),
        };
        self.strategies.get(&alternate).unwrap_or(&self.fallback)
    }

    /// Compare two snapshots. See [`detect_conflicts`].
    pub fn detect(&self, local: &Value, remote: &Value) -> Vec<ConflictRecord> {
        detect_conflicts(local, remote)
    }

    /// Settle `conflicts` with the strategy registered for `module`.
    pub fn resolve(&self, module: &str, conflicts: &[ConflictRecord]) -> Resolution {
        let strategy = self.strategy_for(module);
        if conflicts.is_empty() {
            return Resolution::empty(strategy.name());
        }

        // `None` means a field needs a person.
        let resolved: Option<Map<String, Value>> = conflicts
            .iter()
            .map(|conflict| {
                let value = match strategy {
                    ConflictStrategy::ClientWins => conflict.client_value.clone(),
                    ConflictStrategy::ServerWins => conflict.server_value.clone(),
                    ConflictStrategy::Merge(Some(merge)) => merge(conflict),
                    ConflictStrategy::Merge(None) => default_merge(conflict),
                    ConflictStrategy::Manual => return None,
                };
                Some((conflict.field.clone(), value))
            })
            .collect();

        Resolution {
            requires_manual: resolved.is_none(),
            resolved: resolved.unwrap_or_default(),
            conflict_count: conflicts.len(),
            strategy: strategy.name(),
        }
    }

    /// Detect and resolve in one step.
    pub fn reconcile(&self, module: &str, local: &Value, remote: &Value) -> Resolution {
        let conflicts = self.detect(local, remote);
        self.resolve(module, &conflicts)
    }

    /// Group conflicts by field and by kind.
    pub fn summarize(conflicts: &[ConflictRecord]) -> ConflictSummary {
        let mut summary = ConflictSummary {
            total: conflicts.len(),
            ..ConflictSummary::default()
        };
        for conflict in conflicts {
            *summary.by_field.entry(conflict.field.clone()).or_insert(0) += 1;
            *summary.by_kind.entry(conflict.kind).or_insert(0) += 1;
        }
        summary
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;
    use serde_json::json;

    fn snapshot(updated: DateTime<Utc>, fields: Value) -> Value {
        let mut value = fields;
        value["id"] = json!("c-1");
        value["updatedAt"] = json!(updated.to_rfc3339());
        value
    }

    #[test]
    fn test_identical_snapshots_have_no_conflicts() {
        let now = Utc::now();
        let local = snapshot(now, json!({"name": "Acme", "tags": ["vip"]}));
        let remote = snapshot(now - Duration::seconds(30), json!({"name": "Acme", "tags": ["vip"]}));
        assert!(detect_conflicts(&local, &remote).is_empty());
    }

    #[test]
    fn test_skew_within_tolerance_is_ignored() {
        let now = Utc::now();
        let local = snapshot(now, json!({"name": "Acme"}));
        let remote = snapshot(now - Duration::milliseconds(900), json!({"name": "Acme Corp"}));
        assert!(detect_conflicts(&local, &remote).is_empty());
    }

    #[test]
    fn test_missing_timestamp_means_no_conflict() {
        let local = json!({"name": "Acme"});
        let remote = snapshot(Utc::now(), json!({"name": "Acme Corp"}));
        assert!(detect_conflicts(&local, &remote).is_empty());
    }

    #[test]
    fn test_epoch_millis_timestamps() {
        let local = json!({"updated_at": 1_700_000_005_000i64, "status": "open"});
        let remote = json!({"updated_at": 1_700_000_000_000i64, "status": "closed"});
        let conflicts = detect_conflicts(&local, &remote);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].kind, ConflictKind::Text);
        assert!(conflicts[0].client_is_newer());
    }

    #[test]
    fn test_tags_conflict_merges_to_union() {
        let now = Utc::now();
        let local = snapshot(now, json!({"tags": ["vip"]}));
        let remote = snapshot(now - Duration::seconds(5), json!({"tags": ["enterprise"]}));

        let resolver = ConflictResolver::with_defaults();
        let conflicts = resolver.detect(&local, &remote);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].field, "tags");
        assert_eq!(conflicts[0].kind, ConflictKind::Array);

        let resolution = resolver.resolve("customers", &conflicts);
        assert_eq!(resolution.strategy, "merge");
        assert_eq!(resolution.conflict_count, 1);
        assert_eq!(resolution.resolved["tags"], json!(["vip", "enterprise"]));
    }

    #[test]
    fn test_customer_notes_concatenate() {
        let now = Utc::now();
        let local = snapshot(now, json!({"notes": "Prefers email"}));
        let remote = snapshot(now - Duration::minutes(3), json!({"notes": "Met at expo"}));

        let resolution = ConflictResolver::with_defaults().reconcile("customer", &local, &remote);
        assert_eq!(resolution.resolved["notes"], json!("Met at expo\nPrefers email"));
    }

    #[test]
    fn test_default_strategies() {
        let resolver = ConflictResolver::with_defaults();
        assert_eq!(resolver.strategy_for("tasks").name(), "client-wins");
        assert_eq!(resolver.strategy_for("task").name(), "client-wins");
        assert_eq!(resolver.strategy_for("approvals").name(), "server-wins");
        assert_eq!(resolver.strategy_for("invoices").name(), "server-wins");
    }

    #[test]
    fn test_client_and_server_wins() {
        let now = Utc::now();
        let local = snapshot(now, json!({"title": "Local", "done": true}));
        let remote = snapshot(now - Duration::seconds(10), json!({"title": "Remote", "done": false}));

        let resolver = ConflictResolver::with_defaults();
        let tasks = resolver.reconcile("tasks", &local, &remote);
        assert_eq!(tasks.resolved["title"], json!("Local"));
        assert_eq!(tasks.resolved["done"], json!(true));

        let approvals = resolver.reconcile("approvals", &local, &remote);
        assert_eq!(approvals.resolved["title"], json!("Remote"));
        assert_eq!(approvals.conflict_count, 2);
    }

    #[test]
    fn test_manual_strategy_flags_resolution() {
        let now = Utc::now();
        let local = snapshot(now, json!({"amount": 10}));
        let remote = snapshot(now + Duration::seconds(4), json!({"amount": 12}));

        let resolver = ConflictResolver::new().with_strategy("payments", ConflictStrategy::Manual);
        let resolution = resolver.reconcile("payments", &local, &remote);
        assert!(resolution.requires_manual);
        assert!(resolution.resolved.is_empty());
        assert_eq!(resolution.conflict_count, 1);
    }

    #[test]
    fn test_default_merge_rules() {
        let now = Utc::now();
        let record = |client: Value, server: Value, client_newer: bool| ConflictRecord {
            id: "r".to_string(),
            field: "f".to_string(),
            kind: ConflictKind::classify(&client, &server),
            client_value: client,
            server_value: server,
            client_timestamp: if client_newer { now } else { now - Duration::seconds(9) },
            server_timestamp: if client_newer { now - Duration::seconds(9) } else { now },
        };

        assert_eq!(default_merge(&record(json!(3), json!(7.5), true)), json!(7.5));
        assert_eq!(default_merge(&record(json!(9), json!(2), false)), json!(9));
        assert_eq!(default_merge(&record(json!("a"), json!("b"), true)), json!("a"));
        assert_eq!(default_merge(&record(json!(true), json!(false), false)), json!(false));
        assert_eq!(
            default_merge(&record(json!({"a": 1, "b": 2}), json!({"b": 3, "c": 4}), false)),
            json!({"a": 1, "b": 2, "c": 4})
        );
        assert_eq!(default_merge(&record(json!("x"), json!(5), false)), json!(5));
    }

    #[test]
    fn test_apply_to_payload() {
        let mut payload = json!({"tags": ["vip"], "name": "Acme"});
        let mut resolved = Map::new();
        resolved.insert("tags".to_string(), json!(["vip", "enterprise"]));
        let resolution = Resolution {
            resolved,
            conflict_count: 1,
            strategy: "merge",
            requires_manual: false,
        };
        resolution.apply_to(&mut payload);
        assert_eq!(payload, json!({"tags": ["vip", "enterprise"], "name": "Acme"}));
    }

    #[test]
    fn test_summarize_groups() {
        let now = Utc::now();
        let local = snapshot(now, json!({"tags": ["a"], "name": "x", "score": 1}));
        let remote = snapshot(now - Duration::seconds(3), json!({"tags": ["b"], "name": "y", "score": 2}));
        let conflicts = detect_conflicts(&local, &remote);

        let summary = ConflictResolver::summarize(&conflicts);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.by_field.get("tags"), Some(&1));
        assert_eq!(summary.by_kind.get(&ConflictKind::Number), Some(&1));
        assert_eq!(summary.by_kind.get(&ConflictKind::Text), Some(&1));
    }

    fn small_array() -> impl Strategy<Value = Vec<Value>> {
        prop::collection::vec((0i64..6).prop_map(Value::from), 0..6)
    }

    fn small_object() -> impl Strategy<Value = Map<String, Value>> {
        prop::collection::btree_map("[a-d]", 0i64..4, 0..4).prop_map(|m| {
            m.into_iter().map(|(k, v)| (k, Value::from(v))).collect()
        })
    }

    proptest! {
        #[test]
        fn prop_array_union_is_idempotent(local in small_array(), remote in small_array()) {
            let merged = union_arrays(&local, &remote);
            prop_assert_eq!(&union_arrays(&merged, &remote), &merged);
            prop_assert_eq!(&union_arrays(&merged, &merged), &merged);
        }

        #[test]
        fn prop_object_merge_is_idempotent(local in small_object(), remote in small_object()) {
            let merged = merge_objects(&local, &remote);
            prop_assert_eq!(&merge_objects(&merged, &remote), &merged);
            prop_assert_eq!(&merge_objects(&merged, &merged), &merged);
        }

        #[test]
        fn prop_small_skew_never_conflicts(skew_ms in 0i64..=1_000, name in "[a-z]{1,8}", other in "[a-z]{1,8}") {
            let now = Utc::now();
            let local = snapshot(now, json!({"name": name}));
            let remote = snapshot(now - Duration::milliseconds(skew_ms), json!({"name": other}));
            prop_assert!(detect_conflicts(&local, &remote).is_empty());
        }

        #[test]
        fn prop_large_skew_one_field_one_conflict(skew_ms in 1_001i64..100_000) {
            let now = Utc::now();
            let local = snapshot(now, json!({"name": "Acme", "city": "Oslo"}));
            let remote = snapshot(now - Duration::milliseconds(skew_ms), json!({"name": "Acme", "city": "Bergen"}));
            let conflicts = detect_conflicts(&local, &remote);
            prop_assert_eq!(conflicts.len(), 1);
            prop_assert_eq!(conflicts[0].field.as_str(), "city");
        }
    }
}
