//! Completion providers for fast-rlm.
//!
//! A provider turns a run's transcript into one assistant message plus the
//! usage it cost. The engine only talks to the [`CompletionProvider`] trait;
//! [`backends::openai::OpenAiBackend`] is the bundled HTTP implementation and
//! [`RetryingProvider`] adds timeouts and exponential-backoff retries on top of
//! any provider.

/// Provider backends.
pub mod backends;
/// Provider connection settings.
pub mod config;
/// Fenced code-block extraction.
pub mod extract;
/// The provider trait and its response type.
pub mod provider;
/// Timeout and retry wrapper.
pub mod retry;

pub use backends::openai::OpenAiBackend;
pub use config::{LlmProvider, ProviderConfig};
pub use extract::extract_code;
pub use provider::{Completion, CompletionProvider};
pub use retry::{is_retryable, RetryPolicy, RetryingProvider};
