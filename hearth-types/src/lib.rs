#![deny(missing_docs)]
//! Shared types for the hearth automation engine.
//!
//! Defines the canonical conversation shapes ([`Message`], [`ContentPart`])
//! that every provider driver translates to and from, the provider
//! request/response types, and the [`Provider`] trait with its object-safe
//! [`ProviderDyn`] erasure used wherever a driver is chosen at runtime.

pub mod message;
pub mod provider;

pub use message::{ContentPart, ImageSource, Message, Role};
pub use provider::{
    BoxProvider, Provider, ProviderDyn, ProviderError, ProviderRequest, ProviderResponse,
    StopReason, TokenUsage, ToolSchema,
};
