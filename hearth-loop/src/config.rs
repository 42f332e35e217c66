//! Loop configuration.

use std::time::Duration;

/// Default iteration budget for one conversation.
pub const MAX_ITERATIONS: usize = 10;

/// Default bound on a single provider round-trip.
pub const PROVIDER_API_TIMEOUT: Duration = Duration::from_secs(300);

/// Configuration for one [`crate::ToolLoop`] invocation.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Model override passed through to the provider (None = driver default).
    pub model: Option<String>,
    /// Maximum provider round-trips before the loop terminates.
    pub max_iterations: usize,
    /// Bound on each provider call. Two consecutive timeouts end the loop.
    pub provider_timeout: Duration,
    /// Maximum output tokens per provider call.
    pub max_tokens: Option<u32>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            model: None,
            max_iterations: MAX_ITERATIONS,
            provider_timeout: PROVIDER_API_TIMEOUT,
            max_tokens: None,
        }
    }
}
