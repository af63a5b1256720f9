use std::env;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::types::{LlmConfig, OpenAiSettings, OPENAI_API_KEY_ENV};
use crate::{Error, LlmClient, LlmProvider, OpenAiProvider};

/// Known provider backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderType {
    OpenAI,
    Anthropic,
    Ollama,
}

impl ProviderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::OpenAI => "openai",
            ProviderType::Anthropic => "anthropic",
            ProviderType::Ollama => "ollama",
        }
    }

    /// Whether a provider implementation exists for this backend.
    pub fn is_implemented(&self) -> bool {
        matches!(self, ProviderType::OpenAI)
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderType {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "openai" => Ok(ProviderType::OpenAI),
            "anthropic" => Ok(ProviderType::Anthropic),
            "ollama" => Ok(ProviderType::Ollama),
            other => Err(Error::UnknownProvider {
                name: other.to_string(),
            }),
        }
    }
}

/// Builds providers and clients from [`LlmConfig`].
#[derive(Debug, Clone)]
pub struct ProviderFactory {
    config: LlmConfig,
    /// API key taken from the environment, preferred over the configured one.
    key_override: Option<String>,
}

impl ProviderFactory {
    /// Create a factory; `OPENAI_API_KEY` is read once here.
    pub fn new(config: LlmConfig) -> Self {
        Self::with_key_override(config, env::var(OPENAI_API_KEY_ENV).ok())
    }

    /// Create a factory with an explicit key override instead of the
    /// environment.
    pub fn with_key_override(config: LlmConfig, key_override: Option<String>) -> Self {
        Self {
            config,
            key_override: key_override.filter(|key| !key.is_empty()),
        }
    }

    pub fn config(&self) -> &LlmConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Configured provider name, `openai` when unset.
    pub fn provider_name(&self) -> &str {
        self.config.provider_name()
    }

    /// Construct the provider registered under `name`.
    pub fn create_provider(&self, name: &str) -> Result<Arc<dyn LlmProvider>, Error> {
        match name.parse::<ProviderType>()? {
            ProviderType::OpenAI => Ok(Arc::new(self.create_openai_provider()?)),
            other => Err(Error::ProviderNotImplemented {
                name: other.to_string(),
            }),
        }
    }

    pub fn create_default_provider(&self) -> Result<Arc<dyn LlmProvider>, Error> {
        self.create_provider(self.provider_name())
    }

    /// Build a client around the configured provider.
    pub fn create_client(&self) -> Result<LlmClient, Error> {
        Ok(LlmClient::new(self.create_default_provider()?))
    }

    pub fn create_client_with_provider(&self, name: &str) -> Result<LlmClient, Error> {
        Ok(LlmClient::new(self.create_provider(name)?))
    }

    /// Check the configuration without building anything.
    pub fn validate_config(&self) -> Result<(), Error> {
        if !self.config.enabled {
            return Err(Error::config("LLM support is not enabled"));
        }

        let provider = self.provider_name().parse::<ProviderType>()?;
        if !provider.is_implemented() {
            return Err(Error::ProviderNotImplemented {
                name: provider.to_string(),
            });
        }

        if self.openai_api_key().is_empty() {
            return Err(Error::config("OpenAI API key is not configured"));
        }
        if self.config.openai.model.trim().is_empty() {
            return Err(Error::config("OpenAI model is not configured"));
        }
        Ok(())
    }

    fn openai_api_key(&self) -> &str {
        self.key_override
            .as_deref()
            .unwrap_or(self.config.openai.api_key.as_str())
    }

    fn create_openai_provider(&self) -> Result<OpenAiProvider, Error> {
        if self.openai_api_key().is_empty() {
            return Err(Error::config(
                "OpenAI API key is not configured, set llm.openai.api_key or OPENAI_API_KEY",
            ));
        }
        let settings =
            OpenAiSettings::from_config_with_key(&self.config.openai, self.key_override.clone())?;
        OpenAiProvider::new(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled_config(api_key: &str) -> LlmConfig {
        let mut config = LlmConfig {
            enabled: true,
            ..Default::default()
        };
        config.openai.api_key = api_key.to_string();
        config
    }

    #[test]
    fn test_provider_type_parsing() {
        assert_eq!("openai".parse::<ProviderType>().unwrap(), ProviderType::OpenAI);
        assert_eq!("ollama".parse::<ProviderType>().unwrap(), ProviderType::Ollama);
        assert!(matches!(
            "gemini".parse::<ProviderType>(),
            Err(Error::UnknownProvider { .. })
        ));
    }

    #[test]
    fn test_create_openai_provider() {
        let factory = ProviderFactory::with_key_override(enabled_config("sk-file"), None);
        let provider = factory.create_default_provider().unwrap();
        assert_eq!(provider.name(), "openai");
        assert!(provider.is_available());
    }

    #[test]
    fn test_unimplemented_and_unknown_providers() {
        let factory = ProviderFactory::with_key_override(enabled_config("sk-file"), None);

        let err = factory.create_provider("anthropic").err().unwrap();
        assert!(matches!(err, Error::ProviderNotImplemented { ref name } if name == "anthropic"));

        let err = factory.create_provider("ollama").err().unwrap();
        assert!(matches!(err, Error::ProviderNotImplemented { .. }));

        let err = factory.create_client_with_provider("mystery").err().unwrap();
        assert!(err.to_string().contains("mystery"));
    }

    #[test]
    fn test_missing_key_fails_at_construction() {
        let factory = ProviderFactory::with_key_override(enabled_config(""), None);
        let err = factory.create_client().err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_key_override_satisfies_validation() {
        let factory =
            ProviderFactory::with_key_override(enabled_config(""), Some("sk-env".to_string()));
        assert!(factory.validate_config().is_ok());
        assert!(factory.create_client().is_ok());
    }

    #[test]
    fn test_validate_config() {
        let disabled = ProviderFactory::with_key_override(LlmConfig::default(), None);
        assert!(!disabled.is_enabled());
        assert!(disabled.validate_config().is_err());

        let mut config = enabled_config("sk-file");
        config.openai.model = String::new();
        let factory = ProviderFactory::with_key_override(config, None);
        assert!(factory.validate_config().unwrap_err().to_string().contains("model"));

        let mut config = enabled_config("sk-file");
        config.provider = "anthropic".to_string();
        let factory = ProviderFactory::with_key_override(config, None);
        assert_eq!(factory.provider_name(), "anthropic");
        assert!(matches!(
            factory.validate_config(),
            Err(Error::ProviderNotImplemented { .. })
        ));
    }
}
