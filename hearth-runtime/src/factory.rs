//! Provider construction.
//!
//! The runtime receives a factory rather than a provider instance so
//! per-automation model directives can construct a fresh driver with the
//! requested model. The factory is a value the runtime owns, not global
//! state.

use std::collections::BTreeMap;
use std::sync::Arc;

use hearth_provider_anthropic::AnthropicProvider;
use hearth_provider_ollama::OllamaProvider;
use hearth_provider_openai::OpenAiProvider;
use hearth_types::BoxProvider;

use crate::config::{Config, ProviderConfig};
use crate::RuntimeError;

/// A resolved `<provider>/<model>` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRef {
    /// Name of a configured provider entry.
    pub provider: String,
    /// Model override, if given.
    pub model: Option<String>,
}

impl ModelRef {
    /// Parse `anthropic/claude-sonnet-4-5` or just `anthropic`.
    pub fn parse(raw: &str) -> Self {
        match raw.split_once('/') {
            Some((provider, model)) => Self {
                provider: provider.trim().to_string(),
                model: Some(model.trim().to_string()),
            },
            None => Self {
                provider: raw.trim().to_string(),
                model: None,
            },
        }
    }
}

/// Parse a leading model directive from automation text.
///
/// The first non-empty line may read `model: <provider>/<model>` to pin
/// that automation to a specific endpoint.
pub fn parse_model_directive(contents: &str) -> Option<ModelRef> {
    let first = contents.lines().find(|line| !line.trim().is_empty())?;
    let rest = first.trim().strip_prefix("model:")?;
    let rest = rest.trim();
    if rest.is_empty() {
        return None;
    }
    Some(ModelRef::parse(rest))
}

/// Constructs providers on demand.
///
/// Object-safe so tests and the eval harness can substitute scripted
/// models.
pub trait LlmFactory: Send + Sync {
    /// Build a provider for `reference`, or the default when `None`.
    /// Returns the driver and the model name jobs should request.
    fn create(
        &self,
        reference: Option<&ModelRef>,
    ) -> Result<(BoxProvider, Option<String>), RuntimeError>;

    /// Build the vision provider, when one is configured.
    fn create_vision(&self) -> Option<BoxProvider> {
        None
    }
}

/// The real factory over the config's provider table.
pub struct ProviderFactory {
    providers: BTreeMap<String, ProviderConfig>,
    default_ref: Option<ModelRef>,
}

impl ProviderFactory {
    /// Build from loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            providers: config.providers.clone(),
            default_ref: config.model.as_deref().map(ModelRef::parse),
        }
    }

    fn build(&self, name: &str, model: Option<&str>) -> Result<(BoxProvider, Option<String>), RuntimeError> {
        let entry = self
            .providers
            .get(name)
            .ok_or_else(|| RuntimeError::Config(format!("no provider named `{name}`")))?;
        let model = model
            .map(String::from)
            .or_else(|| entry.model.clone());

        let provider: BoxProvider = match entry.driver.as_str() {
            "anthropic" => {
                let api_key = entry.api_key.clone().ok_or_else(|| {
                    RuntimeError::Config(format!("provider `{name}` is missing api_key"))
                })?;
                let mut driver = AnthropicProvider::new(api_key);
                if let Some(base_url) = &entry.base_url {
                    driver = driver.with_base_url(base_url);
                }
                Arc::new(driver)
            }
            "openai" => {
                let mut driver = OpenAiProvider::new(entry.api_key.clone().unwrap_or_default());
                if let Some(base_url) = &entry.base_url {
                    driver = driver.with_base_url(base_url);
                }
                if let Some(model) = &model {
                    driver = driver.with_default_model(model);
                }
                Arc::new(driver)
            }
            "ollama" => {
                let base_url = entry
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "http://localhost:11434".into());
                let mut driver = OllamaProvider::new(base_url);
                if let Some(model) = &model {
                    driver = driver.with_default_model(model);
                }
                Arc::new(driver)
            }
            other => {
                return Err(RuntimeError::Config(format!(
                    "provider `{name}` has unknown driver `{other}`"
                )))
            }
        };

        Ok((provider, model))
    }
}

impl LlmFactory for ProviderFactory {
    fn create(
        &self,
        reference: Option<&ModelRef>,
    ) -> Result<(BoxProvider, Option<String>), RuntimeError> {
        let reference = reference.or(self.default_ref.as_ref());
        match reference {
            Some(r) => self.build(&r.provider, r.model.as_deref()),
            None => {
                // No explicit default: a single configured provider is
                // unambiguous.
                let mut names = self.providers.keys();
                match (names.next(), names.next()) {
                    (Some(only), None) => self.build(only, None),
                    (None, _) => Err(RuntimeError::Config("no providers configured".into())),
                    _ => Err(RuntimeError::Config(
                        "several providers configured; set `model` to pick a default".into(),
                    )),
                }
            }
        }
    }

    fn create_vision(&self) -> Option<BoxProvider> {
        self.providers
            .contains_key("vision")
            .then(|| self.build("vision", None).ok().map(|(p, _)| p))
            .flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(entries: &[(&str, &str)]) -> Config {
        let mut config = Config::default();
        for (name, driver) in entries {
            config.providers.insert(
                name.to_string(),
                ProviderConfig {
                    driver: driver.to_string(),
                    api_key: Some("key".into()),
                    base_url: Some("http://localhost:9999".into()),
                    model: None,
                },
            );
        }
        config
    }

    #[test]
    fn model_ref_parses_both_forms() {
        assert_eq!(
            ModelRef::parse("anthropic/claude-sonnet-4-5"),
            ModelRef {
                provider: "anthropic".into(),
                model: Some("claude-sonnet-4-5".into()),
            }
        );
        assert_eq!(
            ModelRef::parse("ollama"),
            ModelRef {
                provider: "ollama".into(),
                model: None,
            }
        );
    }

    #[test]
    fn directive_comes_from_first_nonempty_line() {
        let contents = "\n\nmodel: ollama/qwen3\nEvery morning at 7 turn on the coffee maker";
        assert_eq!(
            parse_model_directive(contents),
            Some(ModelRef {
                provider: "ollama".into(),
                model: Some("qwen3".into()),
            })
        );
        assert_eq!(parse_model_directive("Every morning at 7am"), None);
        assert_eq!(parse_model_directive("model:"), None);
    }

    #[test]
    fn single_provider_is_the_default() {
        let factory = ProviderFactory::from_config(&config_with(&[("anthropic", "anthropic")]));
        assert!(factory.create(None).is_ok());
    }

    #[test]
    fn several_providers_need_an_explicit_default() {
        let factory = ProviderFactory::from_config(&config_with(&[
            ("anthropic", "anthropic"),
            ("ollama", "ollama"),
        ]));
        assert!(factory.create(None).is_err());
        assert!(factory
            .create(Some(&ModelRef::parse("ollama/qwen3")))
            .is_ok());
    }

    #[test]
    fn unknown_provider_and_driver_are_rejected() {
        let factory = ProviderFactory::from_config(&config_with(&[("weird", "telepathy")]));
        assert!(factory.create(Some(&ModelRef::parse("nope"))).is_err());
        assert!(factory.create(Some(&ModelRef::parse("weird"))).is_err());
    }
}
