//! Configuration: TOML file plus environment overrides.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::RuntimeError;

/// Hub connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    /// Base URL of the hub, e.g. `http://homeassistant.local:8123`.
    pub url: String,
    /// Long-lived access token.
    pub token: String,
}

/// One LLM endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderConfig {
    /// Driver name: `anthropic`, `openai`, or `ollama`.
    pub driver: String,
    /// API key, where the driver needs one.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Endpoint override (required for `ollama`, optional elsewhere).
    #[serde(default)]
    pub base_url: Option<String>,
    /// Default model for this endpoint.
    #[serde(default)]
    pub model: Option<String>,
}

fn default_timezone() -> String {
    "UTC".into()
}

fn default_notebook() -> PathBuf {
    PathBuf::from("notebook")
}

fn default_db_path() -> PathBuf {
    PathBuf::from("hearth.db")
}

fn default_port() -> u16 {
    3000
}

/// Engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Hub connection; absent in eval/test setups.
    #[serde(default)]
    pub hub: Option<HubConfig>,
    /// IANA timezone cron expressions are evaluated in.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Notebook directory.
    #[serde(default = "default_notebook")]
    pub notebook: PathBuf,
    /// Database file.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// HTTP port for the front-end shell.
    #[serde(default = "default_port")]
    pub port: u16,
    /// When set, `call-service` validates but never contacts the hub.
    #[serde(default)]
    pub test_mode: bool,
    /// Default model as `<provider>/<model>` or just `<provider>`.
    #[serde(default)]
    pub model: Option<String>,
    /// Named LLM endpoints. Several OpenAI-compatible entries may
    /// coexist.
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hub: None,
            timezone: default_timezone(),
            notebook: default_notebook(),
            db_path: default_db_path(),
            port: default_port(),
            test_mode: false,
            model: None,
            providers: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Load configuration.
    ///
    /// Resolution order: explicit `path`, then `$HEARTH_CONFIG`, then
    /// `hearth.toml` if present, then built-in defaults. Environment
    /// variables are applied on top.
    pub fn load(path: Option<&Path>) -> Result<Self, RuntimeError> {
        let resolved: Option<PathBuf> = path
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HEARTH_CONFIG").map(PathBuf::from))
            .or_else(|| {
                let default = PathBuf::from("hearth.toml");
                default.exists().then_some(default)
            });

        let mut config = match resolved {
            Some(path) => {
                let raw = std::fs::read_to_string(&path).map_err(|e| {
                    RuntimeError::Config(format!("cannot read {}: {e}", path.display()))
                })?;
                toml::from_str(&raw)
                    .map_err(|e| RuntimeError::Config(format!("{}: {e}", path.display())))?
            }
            None => Config::default(),
        };

        config.apply_env();
        Ok(config)
    }

    /// Overlay environment variables onto the loaded file.
    pub fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            let entry = self
                .providers
                .entry("anthropic".into())
                .or_insert_with(|| ProviderConfig {
                    driver: "anthropic".into(),
                    ..ProviderConfig::default()
                });
            entry.api_key = Some(key);
        }
        if let Ok(host) = std::env::var("OLLAMA_HOST") {
            let entry = self
                .providers
                .entry("ollama".into())
                .or_insert_with(|| ProviderConfig {
                    driver: "ollama".into(),
                    ..ProviderConfig::default()
                });
            entry.base_url = Some(host);
        }
        for (name, value) in std::env::vars() {
            // OPENAI_API_KEY and OPENAI_<NAME>_KEY both land here; extra
            // endpoints become providers named after the middle segment.
            let Some(rest) = name.strip_prefix("OPENAI_") else {
                continue;
            };
            let Some(middle) = rest.strip_suffix("_KEY") else {
                continue;
            };
            let provider_name = if middle == "API" {
                "openai".to_string()
            } else {
                middle.to_ascii_lowercase()
            };
            let entry = self
                .providers
                .entry(provider_name)
                .or_insert_with(|| ProviderConfig {
                    driver: "openai".into(),
                    ..ProviderConfig::default()
                });
            entry.api_key = Some(value);
        }
        if let Ok(port) = std::env::var("PORT") {
            if let Ok(port) = port.parse() {
                self.port = port;
            }
        }
    }

    /// The configured timezone, parsed.
    pub fn tz(&self) -> Result<chrono_tz::Tz, RuntimeError> {
        self.timezone
            .parse()
            .map_err(|_| RuntimeError::Config(format!("unknown timezone: {}", self.timezone)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_toml_parses() {
        let config: Config = toml::from_str(
            r#"
            timezone = "America/Los_Angeles"

            [hub]
            url = "http://hub.local:8123"
            token = "secret"

            [providers.anthropic]
            driver = "anthropic"
            api_key = "sk-test"
            model = "claude-sonnet-4-5"

            [providers.workshop]
            driver = "openai"
            base_url = "http://llm.workshop:8000/v1"
            "#,
        )
        .unwrap();

        assert_eq!(config.timezone, "America/Los_Angeles");
        assert!(config.tz().is_ok());
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.providers["workshop"].driver, "openai");
        assert_eq!(config.hub.unwrap().url, "http://hub.local:8123");
    }

    #[test]
    fn defaults_are_sensible() {
        let config = Config::default();
        assert_eq!(config.timezone, "UTC");
        assert_eq!(config.notebook, PathBuf::from("notebook"));
        assert!(!config.test_mode);
    }

    #[test]
    fn bad_timezone_is_an_error() {
        let config = Config {
            timezone: "Mars/Olympus_Mons".into(),
            ..Config::default()
        };
        assert!(config.tz().is_err());
    }
}
