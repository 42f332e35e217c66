#![deny(missing_docs)]
//! Hub client contract for hearth.
//!
//! The automation runtime consumes the hub through the [`HubClient`]
//! trait: state snapshots, the service catalog, service calls, and an
//! event stream it filters for `state_changed`. This crate ships the
//! trait, a REST-backed client, and [`MockHub`] — a canned fixture used
//! by the eval harness and the test suites.

mod mock;
mod rest;
mod types;

use thiserror::Error;
use tokio::sync::broadcast;

pub use mock::MockHub;
pub use rest::RestHub;
pub use types::{
    CallServiceRequest, EntityIds, EntityState, HubEvent, ServiceCatalog, ServiceDef,
    ServiceTarget, StateChange,
};

/// Errors from hub operations.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum HubError {
    /// HTTP or network request failed.
    #[error("request failed: {0}")]
    RequestFailed(String),

    /// Authentication failed.
    #[error("auth failed: {0}")]
    AuthFailed(String),

    /// Could not parse the hub's response.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The requested service does not exist.
    #[error("unknown service: {domain}.{service}")]
    UnknownService {
        /// Service domain.
        domain: String,
        /// Service name.
        service: String,
    },
}

/// The hub operations the runtime consumes.
///
/// Object-safe so the runtime, tools, and eval harness can swap the real
/// client for [`MockHub`].
#[async_trait::async_trait]
pub trait HubClient: Send + Sync {
    /// Snapshot of all entity states.
    async fn fetch_states(&self) -> Result<Vec<EntityState>, HubError>;

    /// The full service catalog.
    async fn fetch_services(&self) -> Result<ServiceCatalog, HubError>;

    /// Invoke a service. Returns the response payload, if any.
    async fn call_service(
        &self,
        request: CallServiceRequest,
    ) -> Result<Option<serde_json::Value>, HubError>;

    /// Subscribe to the hub's event bus.
    ///
    /// The runtime filters for `state_changed`. Slow subscribers may miss
    /// events (broadcast semantics); the trigger engine tolerates gaps.
    fn events(&self) -> broadcast::Receiver<HubEvent>;
}
