//! Durable action log for Offsync.
//!
//! This crate owns every piece of persisted sync state: the queue of pending
//! mutations, cached read responses and the append-only audit trail. The
//! [`ActionLog`] service sits on top of a [`StorageBackend`], so the engine
//! never talks to the host database directly.
//!
//! # Design Principles
//! - Durable first: every state-changing call is written through to the backend
//! - Backend isolation: SQLite specifics stay inside [`SqliteBackend`]
//! - Async operations: blocking database work runs off the async executor
//! - Read-time expiry: cached reads are aged out when read, not by a sweeper

pub mod backend;
pub mod log;
pub mod memory;
pub mod model;
pub mod sqlite;

pub use backend::StorageBackend;
pub use log::{ActionLog, LogConfig};
pub use memory::MemoryBackend;
pub use model::{
    CachedEntry, CleanupReport, LogStats, NewAction, OfflineAction, SyncLogEntry,
};
pub use sqlite::SqliteBackend;
