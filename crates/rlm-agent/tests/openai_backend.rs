#![allow(clippy::unwrap_used, clippy::expect_used)]
//! HTTP-level tests for the OpenAI-compatible backend.

use rlm_agent::{CompletionProvider, LlmProvider, OpenAiBackend, ProviderConfig, RetryPolicy};
use rlm_core::{Message, RlmError};
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn backend_for(server: &MockServer, provider: LlmProvider) -> OpenAiBackend {
    let mut config = ProviderConfig::new(provider, "sk-test");
    config.api_base_url = Some(server.uri());
    OpenAiBackend::new(config)
}

#[tokio::test]
async fn test_completion_round_trip() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({
            "model": "z-ai/glm-5",
            "usage": { "include": true },
            "messages": [
                { "role": "system", "content": "sys" },
                { "role": "user", "content": "how long is the context?" }
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": "```repl\nFINAL(#context)\n```"
                }
            }],
            "usage": {
                "prompt_tokens": 40,
                "completion_tokens": 8,
                "total_tokens": 48,
                "cost": 0.0004
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let backend = backend_for(&server, LlmProvider::Custom);
    let completion = backend
        .complete(
            "z-ai/glm-5",
            Some("sys"),
            &[Message::user("how long is the context?")],
        )
        .await
        .unwrap();

    assert_eq!(completion.code.as_deref(), Some("FINAL(#context)"));
    assert_eq!(completion.usage.prompt_tokens, 40);
    assert_eq!(completion.usage.completion_tokens, 8);
    assert_eq!(completion.usage.cost, Some(0.0004));
}

#[tokio::test]
async fn test_openrouter_attribution_headers() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("x-title", "fast-rlm"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": "plain text" } }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let backend = backend_for(&server, LlmProvider::OpenRouter);
    let completion = backend
        .complete("m", None, &[Message::user("hi")])
        .await
        .unwrap();
    assert!(!completion.has_code());
}

#[tokio::test]
async fn test_error_status_maps_to_http_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
        .mount(&server)
        .await;

    let backend = backend_for(&server, LlmProvider::Custom);
    let err = backend
        .complete("m", None, &[Message::user("hi")])
        .await
        .unwrap_err();

    match err {
        RlmError::HttpStatus { status, body } => {
            assert_eq!(status, 429);
            assert_eq!(body, "rate limited");
        }
        other => panic!("expected Http error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_malformed_body_is_provider_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let backend = backend_for(&server, LlmProvider::Custom);
    let err = backend
        .complete("m", None, &[Message::user("hi")])
        .await
        .unwrap_err();
    assert!(matches!(err, RlmError::Provider(_)));
}

fn retrying_backend_for(server: &MockServer, max_retries: u32) -> OpenAiBackend {
    let mut config = ProviderConfig::new(LlmProvider::Custom, "sk-test");
    config.api_base_url = Some(server.uri());
    config.retry_policy = RetryPolicy {
        max_retries,
        backoff_base_ms: 10,
        backoff_max_ms: 50,
    };
    OpenAiBackend::new(config)
}

#[tokio::test]
async fn test_configured_retry_policy_recovers_from_server_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": "```repl\nFINAL(1)\n```" } }],
            "usage": { "prompt_tokens": 1, "completion_tokens": 1 }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let provider = retrying_backend_for(&server, 2).into_retrying(Duration::from_secs(5));
    let completion = provider
        .complete("m", None, &[Message::user("hi")])
        .await
        .unwrap();
    assert_eq!(completion.code.as_deref(), Some("FINAL(1)"));
}

#[tokio::test]
async fn test_client_error_is_not_retried_whatever_its_body_says() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(400)
                .set_body_string("max_tokens 5000 exceeds limit; connection kept"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let provider = retrying_backend_for(&server, 3).into_retrying(Duration::from_secs(5));
    let err = provider
        .complete("m", None, &[Message::user("hi")])
        .await
        .unwrap_err();
    assert!(matches!(err, RlmError::HttpStatus { status: 400, .. }));
}
