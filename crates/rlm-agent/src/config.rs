use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};

/// Which OpenAI-compatible service to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    /// OpenRouter; reports per-call cost when asked to.
    OpenRouter,
    /// OpenAI.
    OpenAi,
    /// Any other gateway speaking the chat-completions protocol.
    Custom,
}

/// Connection settings for [`OpenAiBackend`](crate::OpenAiBackend).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Target service.
    #[serde(default = "default_provider")]
    pub provider: LlmProvider,
    /// Bearer token.
    #[serde(default, skip_serializing)]
    pub api_key: String,
    /// Overrides the service's default base URL.
    #[serde(default)]
    pub api_base_url: Option<String>,
    /// Sampling temperature; provider default when unset.
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Completion token cap per request; provider default when unset.
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Retry behaviour used by [`RetryingProvider`](crate::RetryingProvider).
    #[serde(default)]
    pub retry_policy: RetryPolicy,
}

fn default_provider() -> LlmProvider {
    LlmProvider::OpenRouter
}

impl ProviderConfig {
    /// Settings for `provider` with the given key and every other field defaulted.
    pub fn new(provider: LlmProvider, api_key: impl Into<String>) -> Self {
        Self {
            provider,
            api_key: api_key.into(),
            api_base_url: None,
            temperature: None,
            max_tokens: None,
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Base URL without the `/v1/...` suffix.
    pub fn base_url(&self) -> &str {
        if let Some(url) = &self.api_base_url {
            url.trim_end_matches('/')
        } else {
            match self.provider {
                LlmProvider::OpenRouter | LlmProvider::Custom => "https://openrouter.ai/api",
                LlmProvider::OpenAi => "https://api.openai.com",
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_defaults() {
        let router = ProviderConfig::new(LlmProvider::OpenRouter, "k");
        assert_eq!(router.base_url(), "https://openrouter.ai/api");

        let openai = ProviderConfig::new(LlmProvider::OpenAi, "k");
        assert_eq!(openai.base_url(), "https://api.openai.com");
    }

    #[test]
    fn test_base_url_override_strips_trailing_slash() {
        let mut config = ProviderConfig::new(LlmProvider::Custom, "k");
        config.api_base_url = Some("http://localhost:8080/".to_string());
        assert_eq!(config.base_url(), "http://localhost:8080");
    }

    #[test]
    fn test_api_key_never_serialized() {
        let config = ProviderConfig::new(LlmProvider::OpenRouter, "sk-secret");
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("sk-secret"));
        assert!(json.contains("\"openrouter\""));
    }
}
