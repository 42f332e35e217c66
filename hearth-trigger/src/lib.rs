#![deny(missing_docs)]
//! Trigger engine for hearth.
//!
//! Fans the persisted signal set out into one unified stream of
//! `(automation, signal, fired_at)` events. Four source families feed
//! the stream: timezone-aware cron schedules, absolute/relative timers,
//! entity-state regex matches, and numeric state-range residency.
//!
//! The engine holds a read handle to the store and an output channel;
//! the runtime owns it and wires it up at boot. One-shot signals are
//! disarmed here on fire but killed durably by the runtime, atomically
//! with the execution log insert.

mod clock;
mod engine;
mod set;

use thiserror::Error;

pub use clock::{Clock, FakeClock, SystemClock};
pub use engine::{EngineHandle, TriggerCommand, TriggerEngine};
pub use set::{parse_cron, TriggerEvent, TriggerSet};

/// Errors from trigger operations.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum TriggerError {
    /// A cron expression did not parse as 5-field cron.
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    /// A state regex did not compile.
    #[error("invalid regex: {0}")]
    InvalidRegex(String),

    /// An offset signal with a non-positive period.
    #[error("invalid offset: {0} s")]
    InvalidOffset(i64),

    /// The store could not be read at startup.
    #[error("store error: {0}")]
    Store(String),
}
