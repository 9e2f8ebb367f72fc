use crate::provider::{Completion, CompletionProvider};
use async_trait::async_trait;
use rlm_core::{Message, RlmError, RlmResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Configures retry behaviour for completion requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub backoff_base_ms: u64,
    /// Maximum delay in milliseconds (cap for exponential backoff).
    pub backoff_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Default backoff with the given retry count.
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }
}

/// Determines whether an error is transient and worth retrying.
///
/// Timeouts, rate limits (429), server errors (5xx), transport failures, and
/// malformed provider payloads are retried. Client errors such as 400 or 401
/// are returned immediately, whatever their body says.
pub fn is_retryable(err: &RlmError) -> bool {
    match err {
        RlmError::Timeout(_) | RlmError::Provider(_) | RlmError::Http(_) => true,
        RlmError::HttpStatus { status, .. } => *status == 429 || (500..600).contains(status),
        _ => false,
    }
}

/// Computes the backoff delay for a given attempt using exponential backoff
/// capped at `backoff_max_ms`.
fn compute_backoff(policy: &RetryPolicy, attempt: u32) -> u64 {
    let delay = policy
        .backoff_base_ms
        .saturating_mul(2u64.saturating_pow(attempt));
    delay.min(policy.backoff_max_ms)
}

/// Wraps a provider with a per-attempt timeout and exponential-backoff
/// retries for transient errors.
pub struct RetryingProvider {
    inner: Arc<dyn CompletionProvider>,
    policy: RetryPolicy,
    timeout: Duration,
}

impl RetryingProvider {
    /// Wraps `inner`; each attempt is abandoned after `timeout`.
    pub fn new(inner: Arc<dyn CompletionProvider>, policy: RetryPolicy, timeout: Duration) -> Self {
        Self {
            inner,
            policy,
            timeout,
        }
    }
}

#[async_trait]
impl CompletionProvider for RetryingProvider {
    async fn complete(
        &self,
        model: &str,
        system_prompt: Option<&str>,
        messages: &[Message],
    ) -> RlmResult<Completion> {
        let mut last_err: Option<RlmError> = None;

        for attempt in 0..=self.policy.max_retries {
            let result = match tokio::time::timeout(
                self.timeout,
                self.inner.complete(model, system_prompt, messages),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(RlmError::Timeout(self.timeout.as_secs())),
            };

            match result {
                Ok(completion) => return Ok(completion),
                Err(e) if !is_retryable(&e) => {
                    warn!(model, attempt, error = %e, "Non-retryable provider error");
                    return Err(e);
                }
                Err(e) => {
                    if attempt < self.policy.max_retries {
                        let delay = compute_backoff(&self.policy, attempt);
                        info!(
                            model,
                            attempt,
                            delay_ms = delay,
                            error = %e,
                            "Retryable provider error, backing off"
                        );
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| RlmError::Provider("all retries exhausted".into())))
    }
}
