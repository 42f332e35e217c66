#![deny(missing_docs)]
//! OpenAI-compatible chat-completions driver for hearth.
//!
//! Covers OpenAI itself and any endpoint speaking the same protocol
//! (self-hosted gateways, Ollama's `/v1` facade, vendor clones). The
//! config may declare several such endpoints side by side.

mod mapping;

use hearth_types::{Provider, ProviderError, ProviderRequest, ProviderResponse};
use mapping::IdSequence;

/// OpenAI-compatible API driver.
pub struct OpenAiProvider {
    api_key: String,
    client: reqwest::Client,
    base_url: String,
    default_model: String,
    ids: IdSequence,
}

impl OpenAiProvider {
    /// Create a driver against the hosted OpenAI endpoint.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            client: reqwest::Client::new(),
            base_url: "https://api.openai.com/v1".into(),
            default_model: "gpt-4o-mini".into(),
            ids: IdSequence::default(),
        }
    }

    /// Point the driver at a compatible endpoint.
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Override the default model.
    #[must_use]
    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }
}

impl Provider for OpenAiProvider {
    fn complete(
        &self,
        request: ProviderRequest,
    ) -> impl std::future::Future<Output = Result<ProviderResponse, ProviderError>> + Send {
        let body = mapping::to_api_request(&request, &self.default_model);
        let http_request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body);

        async move {
            let http_response = http_request
                .send()
                .await
                .map_err(|e| ProviderError::RequestFailed(e.to_string()))?;

            let status = http_response.status();
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                return Err(ProviderError::RateLimited);
            }
            if status == reqwest::StatusCode::UNAUTHORIZED
                || status == reqwest::StatusCode::FORBIDDEN
            {
                let body = http_response.text().await.unwrap_or_default();
                return Err(ProviderError::AuthFailed(body));
            }
            if !status.is_success() {
                let body = http_response.text().await.unwrap_or_default();
                return Err(ProviderError::RequestFailed(format!("HTTP {status}: {body}")));
            }

            let api_response: serde_json::Value = http_response
                .json()
                .await
                .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

            mapping::from_api_response(&api_response, &self.ids)
        }
    }

    fn list_models(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<String>, ProviderError>> + Send {
        let http_request = self
            .client
            .get(format!("{}/models", self.base_url))
            .bearer_auth(&self.api_key);

        async move {
            let response = http_request
                .send()
                .await
                .map_err(|e| ProviderError::RequestFailed(e.to_string()))?;
            let body: serde_json::Value = response
                .json()
                .await
                .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
            let models = body["data"]
                .as_array()
                .map(|data| {
                    data.iter()
                        .filter_map(|m| m["id"].as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default();
            Ok(models)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_and_model_overrides() {
        let provider = OpenAiProvider::new("k")
            .with_base_url("http://localhost:11434/v1")
            .with_default_model("qwen2.5");
        assert_eq!(provider.base_url, "http://localhost:11434/v1");
        assert_eq!(provider.default_model, "qwen2.5");
    }
}
