#![deny(missing_docs)]
//! The agentic while loop: drives provider + tool interactions to fixpoint.
//!
//! One invocation of [`ToolLoop::run`] is one conversation. The loop emits
//! every message — the opening user prompt, each assistant response, each
//! batch of tool results — on a channel as it happens, so callers can
//! stream, persist incrementally, or abandon the run by dropping the
//! receiver.

mod config;
mod loop_impl;

pub use config::LoopConfig;
pub use loop_impl::{ToolLoop, Transcript};
