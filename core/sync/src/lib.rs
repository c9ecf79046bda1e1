//! Offsync sync engine
//!
//! This crate replays the mutations recorded in the action log once the
//! device is back online, including:
//! - Sequential and prioritized pass algorithms
//! - Field-level conflict detection and per-module resolution
//! - Delayed retries bounded by a per-action attempt limit
//! - Scheduling on connectivity changes, timers and urgent enqueues

pub mod conflict;
pub mod connectivity;
pub mod engine;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod transport;

// Re-export main types
pub use conflict::{
    detect_conflicts, ConflictKind, ConflictRecord, ConflictResolver, ConflictStrategy,
    ConflictSummary, FieldMerge, Resolution,
};
pub use connectivity::{ConnectivityNotifier, ManualConnectivity, ReachabilityProbe};
pub use engine::{EngineHandle, EngineMode, SyncConfig, SyncEngine, SyncEvent};
pub use queue::PassQueue;
pub use retry::{RetryConfig, RetryQueue};
pub use scheduler::{SyncReport, SyncScheduler, SyncSchedulerHandle, SyncTrigger};
pub use transport::{
    HttpTransport, RemoteRequest, RemoteResponse, RemoteTransport, ScriptedTransport,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        let _config = SyncConfig::default();
        let _retry_config = RetryConfig::default();
        let _resolver = ConflictResolver::default();
        let _queue = RetryQueue::new();
    }
}
