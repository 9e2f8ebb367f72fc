//! Code execution sandboxes for fast-rlm.
//!
//! The engine drives a run's generated code through the [`CodeExecutor`]
//! trait and builds one executor per run through an [`ExecutorFactory`].
//! Executors report an explicit [`ExecutionOutcome`] instead of raising:
//! errors in the generated code are folded into the captured output, and only
//! failures of the bound [`SpawnFn`] surface as
//! [`ExecutionOutcome::ExecutorError`].
//!
//! [`LuaExecutor`] is the bundled backend.

/// Executor traits and the execution outcome.
pub mod executor;
/// The embedded Lua backend.
pub mod lua;

pub use executor::{CodeExecutor, ExecutionOutcome, ExecutorFactory, SpawnFn};
pub use lua::{LuaExecutor, LuaExecutorFactory, DEFAULT_INSTRUCTION_LIMIT};
