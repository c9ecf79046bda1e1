//! Common utilities and types shared across the Offsync crates.
//!
//! This module provides the error taxonomy, identifiers and enums that the
//! action log, conflict resolver and sync engine agree on.

pub mod clock;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use types::{ActionId, ActionStatus, ActionType, HttpMethod, LogStatus, Priority};
