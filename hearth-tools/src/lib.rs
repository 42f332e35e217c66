#![deny(missing_docs)]
//! The concrete tool suites hearth exposes to its two LLM passes.
//!
//! The *scheduling* suite lets the model translate automation prose into
//! durable signals: list and cancel existing triggers, create cron,
//! state-regex, state-range, relative, and absolute triggers. The
//! *execution* suite lets the model drive the hub: inspect entities and
//! services, call a service, and read/write the shared scratchpad.
//!
//! Every tool validates its own input and answers validation failures
//! with `{error, detail}` payloads the model can self-correct from; only
//! infrastructure failures surface as tool errors.

pub mod execution;
pub mod memory;
pub mod scheduling;

pub use execution::{execution_server, ExecContext};
pub use memory::MemoryFile;
pub use scheduling::{scheduling_server, ScheduleContext};
