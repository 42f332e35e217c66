#![deny(missing_docs)]
//! Durable store for hearth: signals, automation logs, service-call logs,
//! image blobs, and the app log tail, all in one embedded SQLite file.
//!
//! The store is the only mutator of persisted state. All mutations
//! serialize through a single connection; reads are snapshot-consistent
//! within one operation. The one cross-table guarantee is
//! [`Store::append_execution_log_and_kill`]: retiring a fired one-shot
//! and recording its execution happen in a single transaction.

mod log;
mod signal;
mod store;

use thiserror::Error;

pub use log::{AutomationLogEntry, CallServiceLogEntry, LogType, NewAutomationLog};
pub use signal::{Signal, SignalData};
pub use store::Store;

/// Errors from store operations.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite failure.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A stored payload failed to (de)serialize.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// A stored row is not interpretable.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}
