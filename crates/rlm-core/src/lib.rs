//! Core types and error definitions for fast-rlm.
//!
//! This crate provides the foundational types shared across all fast-rlm crates:
//! the unified error type, transcript messages, token/cost usage accounting, and
//! the budget configuration that bounds a recursive run tree.
//!
//! # Main types
//!
//! - [`RlmError`]: Unified error enum for all fast-rlm subsystems.
//! - [`RlmResult`]: Convenience alias for `Result<T, RlmError>`.
//! - [`Message`] / [`Role`]: One entry of a run's transcript.
//! - [`UsageRecord`]: Token and cost usage reported for a single model call.
//! - [`UsageAccountant`]: Process-wide usage accumulator shared by every run.
//! - [`BudgetConfig`]: Depth, step, token, and spend ceilings for a run tree.

/// Budget and model configuration.
pub mod config;
/// Error types.
pub mod error;
/// Transcript message types.
pub mod message;
/// Usage records and the shared accountant.
pub mod usage;

pub use config::BudgetConfig;
pub use error::{BudgetResource, RlmError, RlmResult};
pub use message::{Message, Role};
pub use usage::{GlobalUsage, UsageAccountant, UsageRecord};
