#![deny(missing_docs)]
//! Evaluation harness: replays canned prompts against the real tool loop
//! with a mocked hub, then grades the transcripts.
//!
//! Each [`Scenario`] is a `(prompt, tool suite, graders)` triple. The
//! harness builds an isolated world per scenario — fixture hub,
//! in-memory store, scratch memory file — so runs cannot contaminate
//! each other, and only the provider under evaluation is real.

mod grade;
mod scenario;

pub use grade::{GradeResult, Grader};
pub use scenario::{catalog, EvalHarness, Scenario, ScenarioResult, ToolSuite};
