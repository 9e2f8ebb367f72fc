//! Recursive run engine for fast-rlm.
//!
//! A root run receives a large context, writes code against it in a sandbox,
//! and delegates pieces of it to sub-agents that run the same loop one depth
//! deeper. This crate holds the machinery that keeps such a tree bounded and
//! observable.
//!
//! # Main types
//!
//! - [`Engine`]: Per-run step loop with depth and budget enforcement.
//! - [`BatchScheduler`]: Coalesces concurrent spawns into parallel cohorts.
//! - [`RunEvent`] / [`EventSink`]: The run-hierarchy event protocol.
//! - [`JsonlEventLog`]: Append-only JSONL persistence of run events.
//! - [`Run`]: State of one in-progress run.

/// The run engine.
pub mod engine;
/// Run events and sinks.
pub mod events;
/// Prompt text and context summaries.
pub mod prompt;
/// Per-run state.
pub mod run;
/// Spawn batching.
pub mod scheduler;
/// Output truncation policy.
pub mod truncate;

pub use engine::Engine;
pub use events::{EventSink, EventType, JsonlEventLog, MemoryEventLog, RunEvent};
pub use run::Run;
pub use scheduler::{BatchScheduler, CohortObserver, MemberFn, SchedulerStats};
pub use truncate::truncate_output;
