//! Token and cost accounting.
//!
//! Every model call produces one [`UsageRecord`]. All runs of a tree share a
//! single [`UsageAccountant`] and fold their records into its [`GlobalUsage`].
//! Cost is passed through as reported: a provider that omits it leaves the
//! total at `None` rather than an estimate.

use crate::config::BudgetConfig;
use crate::error::{BudgetResource, RlmError, RlmResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Token and cost usage reported for a single model call.
///
/// Token fields the provider leaves out deserialize as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Tokens in the prompt.
    #[serde(default)]
    pub prompt_tokens: u64,
    /// Tokens in the completion.
    #[serde(default)]
    pub completion_tokens: u64,
    /// Prompt plus completion tokens, as reported.
    #[serde(default)]
    pub total_tokens: u64,
    /// Prompt tokens served from the provider's cache.
    #[serde(default)]
    pub cached_tokens: u64,
    /// Completion tokens spent on reasoning.
    #[serde(default)]
    pub reasoning_tokens: u64,
    /// Cost in the provider's currency; `None` when not reported.
    #[serde(default)]
    pub cost: Option<f64>,
}

impl UsageRecord {
    /// A record with only prompt and completion counts.
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            ..Self::default()
        }
    }

    /// Sets the reported cost.
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }
}

/// Process-lifetime usage totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalUsage {
    /// Total prompt tokens.
    pub prompt_tokens: u64,
    /// Total completion tokens.
    pub completion_tokens: u64,
    /// Total tokens.
    pub total_tokens: u64,
    /// Total cached prompt tokens.
    pub cached_tokens: u64,
    /// Total reasoning tokens.
    pub reasoning_tokens: u64,
    /// Total cost; stays `None` until some record reports a cost.
    pub cost: Option<f64>,
    /// Number of records folded in.
    pub calls: u64,
}

impl GlobalUsage {
    fn apply(&mut self, delta: &UsageRecord) {
        self.prompt_tokens += delta.prompt_tokens;
        self.completion_tokens += delta.completion_tokens;
        self.total_tokens += delta.total_tokens;
        self.cached_tokens += delta.cached_tokens;
        self.reasoning_tokens += delta.reasoning_tokens;
        if let Some(cost) = delta.cost {
            self.cost = Some(self.cost.unwrap_or(0.0) + cost);
        }
        self.calls += 1;
    }

    /// Money left under `limit`. Unknown cost counts as nothing spent.
    pub fn remaining_money(&self, limit: f64) -> f64 {
        limit - self.cost.unwrap_or(0.0)
    }

    /// Checks cost, completion tokens, and prompt tokens against the configured
    /// ceilings, in that order, and reports the first breach.
    pub fn check(&self, config: &BudgetConfig) -> RlmResult<()> {
        if let (Some(limit), Some(used)) = (config.max_money, self.cost) {
            if used > limit {
                return Err(RlmError::BudgetExceeded {
                    resource: BudgetResource::Cost,
                    used,
                    limit,
                });
            }
        }
        if let Some(limit) = config.max_completion_tokens {
            if self.completion_tokens > limit {
                return Err(RlmError::BudgetExceeded {
                    resource: BudgetResource::CompletionTokens,
                    used: self.completion_tokens as f64,
                    limit: limit as f64,
                });
            }
        }
        if let Some(limit) = config.max_prompt_tokens {
            if self.prompt_tokens > limit {
                return Err(RlmError::BudgetExceeded {
                    resource: BudgetResource::PromptTokens,
                    used: self.prompt_tokens as f64,
                    limit: limit as f64,
                });
            }
        }
        Ok(())
    }
}

/// Shared, mutex-protected usage accumulator.
///
/// Each [`record`](Self::record) applies a whole delta inside one critical
/// section, so a [`snapshot`](Self::snapshot) never observes half of a delta.
#[derive(Debug, Default)]
pub struct UsageAccountant {
    totals: Mutex<GlobalUsage>,
}

impl UsageAccountant {
    /// Creates an accountant with all totals at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one usage delta into the totals.
    pub fn record(&self, delta: &UsageRecord) {
        self.totals.lock().apply(delta);
    }

    /// Returns a copy of the current totals.
    pub fn snapshot(&self) -> GlobalUsage {
        *self.totals.lock()
    }

    /// Zeroes every total. Only meant for process start; never call this while
    /// a run tree is in flight.
    pub fn reset(&self) {
        tracing::debug!("Resetting global usage");
        *self.totals.lock() = GlobalUsage::default();
    }
}
