#![deny(missing_docs)]
//! The hearth automation runtime.
//!
//! Ties the engine together: notebook ingestion and watching, the
//! reconcile step that derives signals from new automations, the event
//! loop that turns fired triggers into execution jobs, the provider
//! factory, and configuration.

pub mod config;
pub mod factory;
pub mod notebook;
pub mod prompts;
pub mod runtime;

use thiserror::Error;

pub use config::{Config, HubConfig, ProviderConfig};
pub use factory::{parse_model_directive, LlmFactory, ModelRef, ProviderFactory};
pub use notebook::{content_hash, Automation, NotebookEvent, NotebookScan};
pub use runtime::{RunOutcome, Runtime};

/// Errors from runtime operations.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Configuration is missing or invalid.
    #[error("config error: {0}")]
    Config(String),

    /// The notebook directory could not be read or watched.
    #[error("notebook error: {0}")]
    Notebook(String),

    /// The store failed.
    #[error("store error: {0}")]
    Store(#[from] hearth_store::StoreError),
}
