use std::env;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Environment variable that overrides any configured OpenAI API key.
pub const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";

pub const DEFAULT_PROVIDER: &str = "openai";
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-3.5-turbo";

/// Timeout used when the resolved settings carry none.
const FALLBACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Top-level LLM configuration, usually the `[llm]` table of the
/// application config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub enabled: bool,
    /// Provider name: openai, anthropic, ollama.
    pub provider: String,
    pub openai: OpenAiConfig,
    pub anthropic: AnthropicConfig,
    pub ollama: OllamaConfig,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: DEFAULT_PROVIDER.to_string(),
            openai: OpenAiConfig::default(),
            anthropic: AnthropicConfig::default(),
            ollama: OllamaConfig::default(),
        }
    }
}

impl LlmConfig {
    /// Parse configuration from TOML text. Missing fields take defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, Error> {
        toml::from_str(text).map_err(|e| Error::config(format!("invalid LLM config: {e}")))
    }

    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Configured provider name, falling back to `openai` when blank.
    pub fn provider_name(&self) -> &str {
        let name = self.provider.trim();
        if name.is_empty() {
            DEFAULT_PROVIDER
        } else {
            name
        }
    }
}

/// OpenAI (or OpenAI-compatible) endpoint configuration as written in
/// the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiConfig {
    pub api_key: String,
    /// Base URL; third-party compatible endpoints are supported.
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Request timeout in seconds.
    pub timeout: u64,
    /// Requests per second; 0 disables limiting.
    pub qps: i64,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            model: DEFAULT_OPENAI_MODEL.to_string(),
            temperature: 0.3,
            max_tokens: 1000,
            timeout: 60,
            qps: 10,
        }
    }
}

/// Reserved for a future Anthropic provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnthropicConfig {
    pub api_key: String,
    pub model: String,
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "claude-3-sonnet-20240229".to_string(),
        }
    }
}

/// Reserved for a future Ollama provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    pub base_url: String,
    pub model: String,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "llama2".to_string(),
        }
    }
}

/// Resolved, validated settings held by an OpenAI provider.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenAiSettings {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
    pub qps: i64,
}

impl OpenAiSettings {
    /// Resolve settings, preferring `OPENAI_API_KEY` over the configured key.
    pub fn from_config(config: &OpenAiConfig) -> Result<Self, Error> {
        let env_key = env::var(OPENAI_API_KEY_ENV).ok();
        Self::from_config_with_key(config, env_key)
    }

    /// Resolve settings with an explicit key override; an empty override is
    /// treated as absent.
    pub fn from_config_with_key(
        config: &OpenAiConfig,
        key_override: Option<String>,
    ) -> Result<Self, Error> {
        let api_key = key_override
            .filter(|key| !key.is_empty())
            .unwrap_or_else(|| config.api_key.clone());

        Self {
            api_key,
            base_url: config.base_url.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            timeout: Duration::from_secs(config.timeout),
            qps: config.qps,
        }
        .validate()
    }

    /// Fail on a missing key and fill blank fields with defaults.
    pub fn validate(mut self) -> Result<Self, Error> {
        if self.api_key.trim().is_empty() {
            return Err(Error::config("OpenAI API key is not configured"));
        }
        if self.base_url.trim().is_empty() {
            self.base_url = DEFAULT_OPENAI_BASE_URL.to_string();
        }
        if self.timeout.is_zero() {
            self.timeout = FALLBACK_TIMEOUT;
        }
        if self.model.trim().is_empty() {
            self.model = DEFAULT_OPENAI_MODEL.to_string();
        }
        Ok(self)
    }

    /// Convenience constructor for tests and programmatic use.
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Result<Self, Error> {
        let config = OpenAiConfig {
            api_key: api_key.into(),
            base_url: base_url.into(),
            ..Default::default()
        };
        Self::from_config_with_key(&config, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LlmConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.provider_name(), "openai");
        assert_eq!(config.openai.base_url, DEFAULT_OPENAI_BASE_URL);
        assert_eq!(config.openai.model, DEFAULT_OPENAI_MODEL);
        assert_eq!(config.openai.timeout, 60);
        assert_eq!(config.openai.qps, 10);
    }

    #[test]
    fn test_from_toml_fills_missing_fields() {
        let config = LlmConfig::from_toml_str(
            r#"
            enabled = true
            provider = ""

            [openai]
            api_key = "sk-file"
            model = "gpt-4o-mini"
            qps = 2
            "#,
        )
        .unwrap();

        assert!(config.enabled);
        assert_eq!(config.provider_name(), "openai");
        assert_eq!(config.openai.api_key, "sk-file");
        assert_eq!(config.openai.model, "gpt-4o-mini");
        assert_eq!(config.openai.qps, 2);
        assert_eq!(config.openai.max_tokens, 1000);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = LlmConfig::from_toml_str("enabled = \"yes\"").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_key_override_takes_precedence() {
        let config = OpenAiConfig {
            api_key: "sk-file".to_string(),
            ..Default::default()
        };
        let settings =
            OpenAiSettings::from_config_with_key(&config, Some("sk-env".to_string())).unwrap();
        assert_eq!(settings.api_key, "sk-env");

        let settings =
            OpenAiSettings::from_config_with_key(&config, Some(String::new())).unwrap();
        assert_eq!(settings.api_key, "sk-file");
    }

    #[test]
    fn test_missing_key_fails() {
        let err = OpenAiSettings::from_config_with_key(&OpenAiConfig::default(), None).unwrap_err();
        assert!(err.to_string().contains("API key"));
    }

    #[test]
    fn test_blank_fields_fall_back() {
        let config = OpenAiConfig {
            api_key: "sk".to_string(),
            base_url: String::new(),
            model: String::new(),
            timeout: 0,
            ..Default::default()
        };
        let settings = OpenAiSettings::from_config_with_key(&config, None).unwrap();
        assert_eq!(settings.base_url, DEFAULT_OPENAI_BASE_URL);
        assert_eq!(settings.model, DEFAULT_OPENAI_MODEL);
        assert_eq!(settings.timeout, Duration::from_secs(30));
    }
}
