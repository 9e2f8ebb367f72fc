use crate::error::{RlmError, RlmResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Ceilings and model choices for one run tree.
///
/// Loaded once at process start and shared immutably by every run. Every field
/// is optional in the serialized form. The key names used by earlier
/// `rlm_config.yaml` files (`primary_agent`, `sub_agent`,
/// `max_calls_per_subagent`, `max_money_spent`) are accepted as aliases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Model steps a single run may take (the priming step is not counted).
    #[serde(default = "default_max_calls_per_run", alias = "max_calls_per_subagent")]
    pub max_calls_per_run: u32,
    /// Deepest depth at which a run may still spawn is `max_depth - 1`.
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    /// Characters of sandbox output shown back to the model.
    #[serde(default = "default_truncate_len")]
    pub truncate_len: usize,
    /// Model used by the depth-0 run.
    #[serde(default = "default_primary_model", alias = "primary_agent")]
    pub primary_model: String,
    /// Model used by every spawned run.
    #[serde(default = "default_sub_model", alias = "sub_agent")]
    pub sub_model: String,
    /// Total spend allowed across the tree.
    #[serde(default = "default_max_money", alias = "max_money_spent")]
    pub max_money: Option<f64>,
    /// Members of a cohort that may run at once; 0 means unlimited.
    #[serde(default = "default_max_parallel_children")]
    pub max_parallel_children: usize,
    /// How long the scheduler waits for sibling spawns before starting a cohort.
    #[serde(default = "default_batch_window_ms")]
    pub batch_window_ms: u64,
    /// Total completion tokens allowed across the tree.
    #[serde(default)]
    pub max_completion_tokens: Option<u64>,
    /// Total prompt tokens allowed across the tree.
    #[serde(default)]
    pub max_prompt_tokens: Option<u64>,
    /// Provider retries per completion request.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Provider timeout per attempt, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_max_calls_per_run() -> u32 {
    20
}

fn default_max_depth() -> u32 {
    3
}

fn default_truncate_len() -> usize {
    2000
}

fn default_primary_model() -> String {
    "z-ai/glm-5".to_string()
}

fn default_sub_model() -> String {
    "minimax/minimax-m2.5".to_string()
}

fn default_max_money() -> Option<f64> {
    Some(1.0)
}

fn default_max_parallel_children() -> usize {
    5
}

fn default_batch_window_ms() -> u64 {
    50
}

fn default_max_retries() -> u32 {
    3
}

fn default_timeout_secs() -> u64 {
    300
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_calls_per_run: default_max_calls_per_run(),
            max_depth: default_max_depth(),
            truncate_len: default_truncate_len(),
            primary_model: default_primary_model(),
            sub_model: default_sub_model(),
            max_money: default_max_money(),
            max_parallel_children: default_max_parallel_children(),
            batch_window_ms: default_batch_window_ms(),
            max_completion_tokens: None,
            max_prompt_tokens: None,
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl BudgetConfig {
    /// Parses a TOML document, filling omitted keys with defaults.
    pub fn from_toml_str(source: &str) -> RlmResult<Self> {
        let config: Self =
            toml::from_str(source).map_err(|e| RlmError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file.
    pub fn load(path: impl AsRef<Path>) -> RlmResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            RlmError::Config(format!("failed to read '{}': {e}", path.display()))
        })?;
        Self::from_toml_str(&source)
    }

    /// Rejects configurations no run could make progress under.
    pub fn validate(&self) -> RlmResult<()> {
        if self.max_calls_per_run == 0 {
            return Err(RlmError::Config(
                "max_calls_per_run must be at least 1".to_string(),
            ));
        }
        if self.primary_model.trim().is_empty() || self.sub_model.trim().is_empty() {
            return Err(RlmError::Config("model identifiers must not be empty".to_string()));
        }
        if let Some(money) = self.max_money {
            if !money.is_finite() || money < 0.0 {
                return Err(RlmError::Config(format!(
                    "max_money must be a non-negative number, got {money}"
                )));
            }
        }
        Ok(())
    }

    /// The model a run at `depth` talks to.
    pub fn model_for_depth(&self, depth: u32) -> &str {
        if depth == 0 {
            &self.primary_model
        } else {
            &self.sub_model
        }
    }

    /// The scheduler's coalescing window.
    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    /// The provider timeout per attempt.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
