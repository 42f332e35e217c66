//! Provider trait for LLM backends.
//!
//! The [`Provider`] trait uses RPITIT (return-position `impl Trait` in
//! traits) and is intentionally NOT object-safe. The object-safe boundary
//! is [`ProviderDyn`]: the runtime's provider factory hands out
//! `Arc<dyn ProviderDyn>` so per-automation model overrides can pick a
//! driver at run time.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::Message;

/// Errors from LLM providers.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ProviderError {
    /// HTTP or network request failed.
    #[error("request failed: {0}")]
    RequestFailed(String),

    /// Provider rate-limited the request.
    #[error("rate limited")]
    RateLimited,

    /// Authentication/authorization failed.
    #[error("auth failed: {0}")]
    AuthFailed(String),

    /// Could not parse the provider's response.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The request did not complete within the configured timeout.
    #[error("timed out after {0} s")]
    Timeout(u64),

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl ProviderError {
    /// Whether retrying this request might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited
                | ProviderError::RequestFailed(_)
                | ProviderError::Timeout(_)
        )
    }
}

/// JSON Schema description of a tool for the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    /// Tool name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// JSON Schema for the tool's input.
    pub input_schema: serde_json::Value,
}

/// Request sent to a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    /// Model to use (None = driver default).
    pub model: Option<String>,
    /// Conversation messages.
    pub messages: Vec<Message>,
    /// Available tools.
    pub tools: Vec<ToolSchema>,
    /// Maximum output tokens.
    pub max_tokens: Option<u32>,
    /// Sampling temperature.
    pub temperature: Option<f64>,
    /// System prompt.
    pub system: Option<String>,
}

/// Why the provider stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Model produced a final response.
    EndTurn,
    /// Model wants to use a tool.
    ToolUse,
    /// Hit the max_tokens limit.
    MaxTokens,
}

/// Token usage from a single provider call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Input tokens consumed.
    pub input_tokens: u64,
    /// Output tokens generated.
    pub output_tokens: u64,
}

impl TokenUsage {
    /// Accumulate another call's usage into this total.
    pub fn accumulate(&mut self, delta: &TokenUsage) {
        self.input_tokens += delta.input_tokens;
        self.output_tokens += delta.output_tokens;
    }
}

/// Response from a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// The assistant message the model produced.
    pub message: Message,
    /// Why the provider stopped.
    pub stop_reason: StopReason,
    /// Token usage.
    pub usage: TokenUsage,
    /// Actual model used.
    pub model: String,
}

/// LLM provider interface.
///
/// Each driver (Anthropic, OpenAI-compatible, Ollama) implements this
/// trait. Wire-format translation — including fabricating stable
/// `tool_use` ids when the native protocol loses them — happens inside
/// the driver so the loop only ever sees canonical [`Message`]s.
pub trait Provider: Send + Sync {
    /// Send a completion request to the provider.
    fn complete(
        &self,
        request: ProviderRequest,
    ) -> impl Future<Output = Result<ProviderResponse, ProviderError>> + Send;

    /// List model names the provider can serve.
    fn list_models(&self) -> impl Future<Output = Result<Vec<String>, ProviderError>> + Send;
}

/// Boxed future used by the object-safe provider erasure.
pub type BoxProviderFuture<'a, T> = BoxFuture<'a, Result<T, ProviderError>>;

/// Object-safe provider interface.
///
/// The runtime selects drivers at run time (config, per-automation model
/// directives), which needs trait objects. Every [`Provider`] gets this
/// for free via the blanket impl.
pub trait ProviderDyn: Send + Sync {
    /// Send a completion request to the provider.
    fn complete_dyn(&self, request: ProviderRequest) -> BoxProviderFuture<'_, ProviderResponse>;

    /// List model names the provider can serve.
    fn list_models_dyn(&self) -> BoxProviderFuture<'_, Vec<String>>;
}

impl<P: Provider> ProviderDyn for P {
    fn complete_dyn(&self, request: ProviderRequest) -> BoxProviderFuture<'_, ProviderResponse> {
        Box::pin(self.complete(request))
    }

    fn list_models_dyn(&self) -> BoxProviderFuture<'_, Vec<String>> {
        Box::pin(self.list_models())
    }
}

/// Shared handle to a runtime-selected provider.
pub type BoxProvider = Arc<dyn ProviderDyn>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ContentPart, Role};

    #[test]
    fn provider_error_display() {
        assert_eq!(
            ProviderError::RequestFailed("timeout".into()).to_string(),
            "request failed: timeout"
        );
        assert_eq!(ProviderError::RateLimited.to_string(), "rate limited");
        assert_eq!(ProviderError::Timeout(300).to_string(), "timed out after 300 s");
    }

    #[test]
    fn provider_error_retryable() {
        assert!(ProviderError::RateLimited.is_retryable());
        assert!(ProviderError::Timeout(300).is_retryable());
        assert!(!ProviderError::AuthFailed("bad key".into()).is_retryable());
        assert!(!ProviderError::InvalidResponse("x".into()).is_retryable());
    }

    struct CannedProvider;

    impl Provider for CannedProvider {
        async fn complete(
            &self,
            _request: ProviderRequest,
        ) -> Result<ProviderResponse, ProviderError> {
            Ok(ProviderResponse {
                message: Message {
                    role: Role::Assistant,
                    content: vec![ContentPart::Text { text: "ok".into() }],
                },
                stop_reason: StopReason::EndTurn,
                usage: TokenUsage::default(),
                model: "canned".into(),
            })
        }

        async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
            Ok(vec!["canned".into()])
        }
    }

    #[tokio::test]
    async fn blanket_erasure_dispatches() {
        let provider: BoxProvider = Arc::new(CannedProvider);
        let response = provider
            .complete_dyn(ProviderRequest {
                model: None,
                messages: vec![Message::user("hi")],
                tools: vec![],
                max_tokens: None,
                temperature: None,
                system: None,
            })
            .await
            .unwrap();
        assert_eq!(response.stop_reason, StopReason::EndTurn);
        assert_eq!(provider.list_models_dyn().await.unwrap(), vec!["canned"]);
    }

    #[test]
    fn token_usage_accumulates() {
        let mut total = TokenUsage::default();
        total.accumulate(&TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
        });
        total.accumulate(&TokenUsage {
            input_tokens: 3,
            output_tokens: 2,
        });
        assert_eq!(total.input_tokens, 13);
        assert_eq!(total.output_tokens, 7);
    }
}
