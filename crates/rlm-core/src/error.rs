use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A convenience `Result` alias using [`RlmError`].
pub type RlmResult<T> = Result<T, RlmError>;

/// The ceiling that a [`RlmError::BudgetExceeded`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetResource {
    /// Total money spent across the run tree.
    Cost,
    /// Total completion tokens across the run tree.
    CompletionTokens,
    /// Total prompt tokens across the run tree.
    PromptTokens,
}

impl fmt::Display for BudgetResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BudgetResource::Cost => write!(f, "cost"),
            BudgetResource::CompletionTokens => write!(f, "completion tokens"),
            BudgetResource::PromptTokens => write!(f, "prompt tokens"),
        }
    }
}

/// Top-level error type for fast-rlm.
///
/// Recoverable conditions (missing code blocks, errors raised by generated
/// code) never surface as `RlmError`; they are folded into a run's transcript.
/// What remains here either fails a single run or, for
/// [`RlmError::BudgetExceeded`], the whole run tree.
#[derive(Debug, thiserror::Error)]
pub enum RlmError {
    /// The completion provider returned an unusable response.
    #[error("Provider error: {0}")]
    Provider(String),

    /// An outbound HTTP request failed before a response status arrived.
    #[error("HTTP error: {0}")]
    Http(String),

    /// The provider answered with a non-success status.
    #[error("HTTP error: status {status}: {body}")]
    HttpStatus {
        /// Response status code.
        status: u16,
        /// Response body text.
        body: String,
    },

    /// The provider did not answer within the configured timeout.
    #[error("Provider timeout after {0}s")]
    Timeout(u64),

    /// The sandbox could not be created or torn down.
    #[error("Sandbox error: {0}")]
    Sandbox(String),

    /// Generated code tried to spawn a sub-agent from the deepest allowed run.
    #[error(
        "MAX DEPTH REACHED: cannot spawn a sub-agent from depth {depth} (max_depth = {max_depth}). \
         Solve this part directly instead of delegating."
    )]
    SpawnDepthExceeded {
        /// Depth of the run that attempted the spawn.
        depth: u32,
        /// Configured maximum depth.
        max_depth: u32,
    },

    /// A process-wide cost or token ceiling was breached.
    #[error("Budget exceeded: {resource} at {used} exceeds the limit of {limit}")]
    BudgetExceeded {
        /// Which ceiling was breached.
        resource: BudgetResource,
        /// Cumulative amount used so far.
        used: f64,
        /// Configured ceiling.
        limit: f64,
    },

    /// A run used all of its steps without producing a final value.
    #[error("Run {run_id} exhausted {max_steps} steps without setting a final value")]
    StepsExhausted {
        /// The run that gave up.
        run_id: Uuid,
        /// Configured step budget.
        max_steps: u32,
    },

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// An error from the orchestration machinery itself (scheduler, channels).
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RlmError {
    /// Whether this error must unwind the entire run tree rather than just the
    /// run that observed it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RlmError::BudgetExceeded { .. })
    }
}
