use async_trait::async_trait;
use futures_util::future::BoxFuture;
use rlm_core::{RlmError, RlmResult};
use std::sync::Arc;

/// The spawn capability bound into a sandbox.
///
/// Takes the child's context string and resolves to the child's final value.
/// The engine decides whether the call runs directly or through the batch
/// scheduler; the executor only awaits it.
pub type SpawnFn =
    Arc<dyn Fn(String) -> BoxFuture<'static, RlmResult<serde_json::Value>> + Send + Sync>;

/// What one execution of generated code produced.
///
/// Precedence when several apply: a failed spawn wins over a final value,
/// which wins over normal completion.
#[derive(Debug)]
pub enum ExecutionOutcome {
    /// The code ran without setting a final value.
    Normal {
        /// Everything the code printed, plus the error text if it raised.
        output: String,
        /// Whether the code raised an error that was folded into `output`.
        raised_error: bool,
    },
    /// The code called `FINAL` or `FINAL_VAR`.
    FinalValue {
        /// Everything the code printed.
        output: String,
        /// The argument of the last sentinel call.
        value: serde_json::Value,
    },
    /// A spawn made by the code failed.
    ExecutorError {
        /// Everything the code printed, including the failure marker.
        output: String,
        /// The spawn failure.
        error: RlmError,
    },
}

impl ExecutionOutcome {
    /// The captured output, whatever the variant.
    pub fn output(&self) -> &str {
        match self {
            ExecutionOutcome::Normal { output, .. }
            | ExecutionOutcome::FinalValue { output, .. }
            | ExecutionOutcome::ExecutorError { output, .. } => output,
        }
    }

    /// Whether the step should be logged with the error flag.
    pub fn has_error(&self) -> bool {
        match self {
            ExecutionOutcome::Normal { raised_error, .. } => *raised_error,
            ExecutionOutcome::FinalValue { .. } => false,
            ExecutionOutcome::ExecutorError { .. } => true,
        }
    }
}

/// A stateful sandbox owned by exactly one run.
///
/// State set by one `execute` call (variables, functions) is visible to the
/// next one.
#[async_trait]
pub trait CodeExecutor: Send {
    /// Runs one code string and reports what happened.
    async fn execute(&mut self, code: &str) -> ExecutionOutcome;
}

/// Creates a fresh sandbox for each run.
pub trait ExecutorFactory: Send + Sync {
    /// Builds a sandbox exposing `context` and the bound `spawn` capability.
    fn create(&self, context: &str, spawn: SpawnFn) -> RlmResult<Box<dyn CodeExecutor>>;
}
