use crate::config::{LlmProvider, ProviderConfig};
use crate::provider::{Completion, CompletionProvider};
use crate::retry::RetryingProvider;
use async_trait::async_trait;
use rlm_core::{Message, RlmError, RlmResult, Role, UsageRecord};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// OpenAI-compatible chat completions backend.
///
/// Works with OpenAI, OpenRouter, and any other gateway implementing the
/// chat completions API. Asks for usage accounting so OpenRouter reports the
/// per-call cost.
pub struct OpenAiBackend {
    config: ProviderConfig,
    http: reqwest::Client,
}

impl OpenAiBackend {
    /// Creates a backend with a fresh HTTP client.
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    /// Wraps the backend in a [`RetryingProvider`] using the configured
    /// `retry_policy`. Each attempt is abandoned after `timeout`.
    pub fn into_retrying(self, timeout: Duration) -> RetryingProvider {
        let policy = self.config.retry_policy.clone();
        RetryingProvider::new(Arc::new(self), policy, timeout)
    }

    fn build_messages(
        &self,
        system_prompt: Option<&str>,
        messages: &[Message],
    ) -> Vec<serde_json::Value> {
        let mut api_messages: Vec<serde_json::Value> = Vec::with_capacity(messages.len() + 1);

        if let Some(sys) = system_prompt {
            api_messages.push(serde_json::json!({
                "role": "system",
                "content": sys
            }));
        }

        for m in messages {
            api_messages.push(serde_json::json!({
                "role": match m.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                },
                "content": m.content
            }));
        }

        api_messages
    }

    fn add_provider_headers(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json");

        // OpenRouter attributes traffic through these
        if matches!(self.config.provider, LlmProvider::OpenRouter) {
            request
                .header("HTTP-Referer", "https://github.com/fast-rlm/fast-rlm-rs")
                .header("X-Title", "fast-rlm")
        } else {
            request
        }
    }
}

#[async_trait]
impl CompletionProvider for OpenAiBackend {
    async fn complete(
        &self,
        model: &str,
        system_prompt: Option<&str>,
        messages: &[Message],
    ) -> RlmResult<Completion> {
        let url = format!("{}/v1/chat/completions", self.config.base_url());

        let mut body = serde_json::json!({
            "model": model,
            "messages": self.build_messages(system_prompt, messages),
            "usage": { "include": true },
        });
        if let Some(max_tokens) = self.config.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        if let Some(temperature) = self.config.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }

        debug!(model, url = %url, messages = messages.len(), "Sending completion request");

        let resp = self
            .add_provider_headers(self.http.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(|e| RlmError::Http(e.to_string()))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| RlmError::Http(e.to_string()))?;

        if !status.is_success() {
            return Err(RlmError::HttpStatus {
                status: status.as_u16(),
                body: text,
            });
        }

        let resp_body: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| RlmError::Provider(format!("invalid JSON response: {e}")))?;

        parse_openai_response(&resp_body)
    }
}

/// Parses a non-streaming chat completions response body.
pub fn parse_openai_response(body: &serde_json::Value) -> RlmResult<Completion> {
    if let Some(error) = body.get("error") {
        return Err(RlmError::Provider(format!("provider returned an error: {error}")));
    }

    let message = body["choices"]
        .get(0)
        .map(|choice| &choice["message"])
        .ok_or_else(|| RlmError::Provider("response has no choices".to_string()))?;

    let content = message["content"].as_str().unwrap_or_default();
    let mut assistant = Message::assistant(content);
    if let Some(reasoning) = message["reasoning"]
        .as_str()
        .or_else(|| message["reasoning_content"].as_str())
        .filter(|r| !r.is_empty())
    {
        assistant = assistant.with_reasoning(reasoning);
    }

    Ok(Completion::new(assistant, parse_usage(&body["usage"])))
}

fn parse_usage(usage: &serde_json::Value) -> UsageRecord {
    let count = |value: &serde_json::Value| value.as_u64().unwrap_or(0);

    let prompt_tokens = count(&usage["prompt_tokens"]);
    let completion_tokens = count(&usage["completion_tokens"]);
    let total_tokens = usage["total_tokens"]
        .as_u64()
        .unwrap_or(prompt_tokens + completion_tokens);

    UsageRecord {
        prompt_tokens,
        completion_tokens,
        total_tokens,
        cached_tokens: count(&usage["prompt_tokens_details"]["cached_tokens"]),
        reasoning_tokens: count(&usage["completion_tokens_details"]["reasoning_tokens"]),
        cost: usage["cost"].as_f64(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_response() {
        let body = serde_json::json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": "Checking.\n```repl\nprint(#context)\n```",
                    "reasoning": "count the characters first"
                },
                "finish_reason": "stop"
            }],
            "usage": {
                "prompt_tokens": 120,
                "completion_tokens": 30,
                "total_tokens": 150,
                "prompt_tokens_details": { "cached_tokens": 100 },
                "completion_tokens_details": { "reasoning_tokens": 12 },
                "cost": 0.0021
            }
        });

        let completion = parse_openai_response(&body).unwrap();
        assert_eq!(completion.code.as_deref(), Some("print(#context)"));
        assert_eq!(
            completion.message.reasoning.as_deref(),
            Some("count the characters first")
        );
        assert_eq!(completion.usage.prompt_tokens, 120);
        assert_eq!(completion.usage.cached_tokens, 100);
        assert_eq!(completion.usage.reasoning_tokens, 12);
        assert_eq!(completion.usage.cost, Some(0.0021));
    }

    #[test]
    fn test_parse_missing_usage_is_zero_and_unknown_cost() {
        let body = serde_json::json!({
            "choices": [{ "message": { "content": "no code here" } }]
        });
        let completion = parse_openai_response(&body).unwrap();
        assert!(!completion.has_code());
        assert_eq!(completion.usage, UsageRecord::default());
        assert_eq!(completion.usage.cost, None);
    }

    #[test]
    fn test_parse_null_content() {
        let body = serde_json::json!({
            "choices": [{ "message": { "content": null } }],
            "usage": { "prompt_tokens": 3, "completion_tokens": 0 }
        });
        let completion = parse_openai_response(&body).unwrap();
        assert_eq!(completion.message.content, "");
        assert_eq!(completion.usage.total_tokens, 3);
    }

    #[test]
    fn test_parse_error_payload() {
        let body = serde_json::json!({ "error": { "message": "overloaded", "code": 529 } });
        let err = parse_openai_response(&body).unwrap_err();
        assert!(matches!(err, RlmError::Provider(_)));
    }

    #[test]
    fn test_parse_empty_choices() {
        let body = serde_json::json!({ "choices": [] });
        assert!(parse_openai_response(&body).is_err());
    }

    #[test]
    fn test_build_messages_prepends_system_prompt() {
        let backend = OpenAiBackend::new(ProviderConfig::new(LlmProvider::OpenAi, "k"));
        let messages = vec![Message::user("ctx"), Message::assistant("```repl\n```")];
        let api = backend.build_messages(Some("be brief"), &messages);
        assert_eq!(api.len(), 3);
        assert_eq!(api[0]["role"], "system");
        assert_eq!(api[1]["role"], "user");
        assert_eq!(api[2]["role"], "assistant");
    }
}
