#![deny(missing_docs)]
//! Native Ollama driver for hearth.
//!
//! Speaks Ollama's `/api/chat` endpoint directly (not the `/v1` OpenAI
//! facade), which exposes local model management (`/api/tags`) and the
//! `prompt_eval_count`/`eval_count` usage fields.

mod mapping;

use hearth_types::{Provider, ProviderError, ProviderRequest, ProviderResponse};
use mapping::IdSequence;

/// Native Ollama driver.
pub struct OllamaProvider {
    client: reqwest::Client,
    base_url: String,
    default_model: String,
    ids: IdSequence,
}

impl OllamaProvider {
    /// Create a driver against the given host, e.g. `http://localhost:11434`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            default_model: "llama3.2".into(),
            ids: IdSequence::default(),
        }
    }

    /// Override the default model.
    #[must_use]
    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }
}

impl Provider for OllamaProvider {
    fn complete(
        &self,
        request: ProviderRequest,
    ) -> impl std::future::Future<Output = Result<ProviderResponse, ProviderError>> + Send {
        let body = mapping::to_api_request(&request, &self.default_model);
        let http_request = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&body);

        async move {
            let http_response = http_request
                .send()
                .await
                .map_err(|e| ProviderError::RequestFailed(e.to_string()))?;

            let status = http_response.status();
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
        let http_request = self.client.get(format!("{}/api/tags", self.base_url));

        async move {
            let response = http_request
                .send()
                .await
                .map_err(|e| ProviderError::RequestFailed(e.to_string()))?;
            let body: serde_json::Value = response
                .json()
                .await
                .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
            let models = body["models"]
                .as_array()
                .map(|models| {
                    models
                        .iter()
                        .filter_map(|m| m["name"].as_str().map(String::from))
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
    fn default_model_override() {
        let provider = OllamaProvider::new("http://localhost:11434").with_default_model("qwen3");
        assert_eq!(provider.default_model, "qwen3");
        assert_eq!(provider.base_url, "http://localhost:11434");
    }
}
