use crate::extract::extract_code;
use async_trait::async_trait;
use rlm_core::{Message, RlmResult, UsageRecord};

/// One assistant response plus what it cost.
#[derive(Debug, Clone)]
pub struct Completion {
    /// The assistant message, including provider reasoning when present.
    pub message: Message,
    /// Usage reported for this single call.
    pub usage: UsageRecord,
    /// Code extracted from the message's fenced blocks, if any.
    pub code: Option<String>,
}

impl Completion {
    /// Builds a completion and extracts its code blocks.
    pub fn new(message: Message, usage: UsageRecord) -> Self {
        let code = extract_code(&message.content);
        Self {
            message,
            usage,
            code,
        }
    }

    /// Whether the response contained any runnable code.
    pub fn has_code(&self) -> bool {
        self.code.is_some()
    }
}

/// Trait for completion provider backends.
///
/// A response without code is a valid outcome ([`Completion::has_code`] is
/// `false`), never an error. Errors are reserved for transport and protocol
/// failures.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Requests one assistant message for the transcript.
    async fn complete(
        &self,
        model: &str,
        system_prompt: Option<&str>,
        messages: &[Message],
    ) -> RlmResult<Completion>;
}
