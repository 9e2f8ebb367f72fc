//! `rlm`: run a recursive language-model query from the command line.
//!
//! The query is read from stdin (or `--query`). Events go to a JSONL file under
//! the log directory, the final value to stdout and, with `--output`, to a
//! result file shaped `{results, usage, log_file}` or `{error, usage, log_file}`.

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use rlm_agent::{LlmProvider, OpenAiBackend, ProviderConfig, RetryPolicy};
use rlm_core::{BudgetConfig, GlobalUsage, RlmResult, UsageAccountant};
use rlm_orchestrator::{Engine, EventSink, JsonlEventLog};
use rlm_sandbox::{LuaExecutorFactory, DEFAULT_INSTRUCTION_LIMIT};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_FILE: &str = "rlm.toml";

#[derive(Parser)]
#[command(name = "rlm", version, about = "Recursive language-model runner")]
struct Cli {
    /// Path to config file (defaults to ./rlm.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one query through a fresh run tree
    Run(RunArgs),
    /// Print the effective configuration
    Config(Overrides),
}

#[derive(clap::Args)]
struct RunArgs {
    /// Query text; read from stdin when omitted
    #[arg(short, long)]
    query: Option<String>,
    /// Log filename prefix
    #[arg(long, default_value = "rlm")]
    prefix: String,
    /// Write the result object to this file
    #[arg(short, long)]
    output: Option<PathBuf>,
    #[command(flatten)]
    overrides: Overrides,
}

/// Command-line overrides applied on top of the config file.
#[derive(clap::Args, Default)]
struct Overrides {
    /// Directory for JSONL event logs
    #[arg(long)]
    log_dir: Option<PathBuf>,
    /// Model for the root run
    #[arg(long)]
    primary_model: Option<String>,
    /// Model for every spawned run
    #[arg(long)]
    sub_model: Option<String>,
    /// Deepest depth a run may exist at
    #[arg(long)]
    max_depth: Option<u32>,
    /// Model steps per run
    #[arg(long)]
    max_calls: Option<u32>,
    /// Total spend ceiling for the tree
    #[arg(long)]
    max_money: Option<f64>,
    /// Concurrent members per cohort chunk (0 = unlimited)
    #[arg(long)]
    max_parallel: Option<usize>,
    /// Provider kind
    #[arg(long, value_enum)]
    provider: Option<ProviderArg>,
    /// Provider base URL override
    #[arg(long)]
    api_base_url: Option<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum ProviderArg {
    Openrouter,
    Openai,
    Custom,
}

impl From<ProviderArg> for LlmProvider {
    fn from(arg: ProviderArg) -> Self {
        match arg {
            ProviderArg::Openrouter => LlmProvider::OpenRouter,
            ProviderArg::Openai => LlmProvider::OpenAi,
            ProviderArg::Custom => LlmProvider::Custom,
        }
    }
}

/// Contents of `rlm.toml`: budget keys at the top level plus optional tables.
#[derive(Debug, Serialize, Deserialize)]
struct RlmConfig {
    #[serde(flatten)]
    budget: BudgetConfig,
    #[serde(default = "default_log_dir")]
    log_dir: PathBuf,
    #[serde(default)]
    provider: ProviderSection,
    #[serde(default)]
    sandbox: SandboxSection,
}

#[derive(Debug, Serialize, Deserialize)]
struct ProviderSection {
    #[serde(default = "default_provider")]
    kind: LlmProvider,
    #[serde(default)]
    api_base_url: Option<String>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    max_tokens: Option<u32>,
}

impl Default for ProviderSection {
    fn default() -> Self {
        Self {
            kind: default_provider(),
            api_base_url: None,
            temperature: None,
            max_tokens: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SandboxSection {
    #[serde(default = "default_instruction_limit")]
    instruction_limit: u32,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            instruction_limit: default_instruction_limit(),
        }
    }
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("./logs")
}
fn default_provider() -> LlmProvider {
    LlmProvider::OpenRouter
}
fn default_instruction_limit() -> u32 {
    DEFAULT_INSTRUCTION_LIMIT
}

impl RlmConfig {
    fn parse(source: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(source)?;
        config.budget.validate()?;
        Ok(config)
    }

    fn apply(&mut self, overrides: Overrides) -> RlmResult<()> {
        let budget = &mut self.budget;
        if let Some(dir) = overrides.log_dir {
            self.log_dir = dir;
        }
        if let Some(model) = overrides.primary_model {
            budget.primary_model = model;
        }
        if let Some(model) = overrides.sub_model {
            budget.sub_model = model;
        }
        if let Some(depth) = overrides.max_depth {
            budget.max_depth = depth;
        }
        if let Some(calls) = overrides.max_calls {
            budget.max_calls_per_run = calls;
        }
        if let Some(money) = overrides.max_money {
            budget.max_money = Some(money);
        }
        if let Some(parallel) = overrides.max_parallel {
            budget.max_parallel_children = parallel;
        }
        if let Some(kind) = overrides.provider {
            self.provider.kind = kind.into();
        }
        if let Some(url) = overrides.api_base_url {
            self.provider.api_base_url = Some(url);
        }
        budget.validate()
    }

    fn provider_config(&self, api_key: String) -> ProviderConfig {
        let mut config = ProviderConfig::new(self.provider.kind, api_key);
        config.api_base_url = self.provider.api_base_url.clone();
        config.temperature = self.provider.temperature;
        config.max_tokens = self.provider.max_tokens;
        config.retry_policy = RetryPolicy::with_max_retries(self.budget.max_retries);
        config
    }
}

/// What `--output` receives.
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum RunReport {
    Success {
        results: serde_json::Value,
        usage: GlobalUsage,
        log_file: Option<PathBuf>,
    },
    Failure {
        error: String,
        usage: GlobalUsage,
        log_file: Option<PathBuf>,
    },
}

async fn load_config(path: Option<&Path>) -> anyhow::Result<RlmConfig> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => PathBuf::from(DEFAULT_CONFIG_FILE),
        None => return RlmConfig::parse(""),
    };

    let source = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    RlmConfig::parse(&source).with_context(|| format!("Invalid config file '{}'", path.display()))
}

fn api_key_for(provider: LlmProvider) -> anyhow::Result<String> {
    let primary = match provider {
        LlmProvider::OpenRouter | LlmProvider::Custom => "OPENROUTER_API_KEY",
        LlmProvider::OpenAi => "OPENAI_API_KEY",
    };
    std::env::var("RLM_API_KEY")
        .or_else(|_| std::env::var(primary))
        .with_context(|| format!("Set {primary} (or RLM_API_KEY) to call the provider"))
}

async fn read_query(query: Option<String>) -> anyhow::Result<String> {
    if let Some(query) = query {
        return Ok(query);
    }
    let mut input = String::new();
    tokio::io::stdin()
        .read_to_string(&mut input)
        .await
        .context("Failed to read the query from stdin")?;
    Ok(input)
}

async fn write_report(path: &Path, report: &RunReport) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let body = serde_json::to_string_pretty(report)?;
    tokio::fs::write(path, body)
        .await
        .with_context(|| format!("Failed to write result file '{}'", path.display()))
}

async fn run(config: RlmConfig, args: RunArgs) -> anyhow::Result<()> {
    let query = read_query(args.query).await?;
    if query.trim().is_empty() {
        anyhow::bail!("The query is empty");
    }

    let api_key = api_key_for(config.provider.kind)?;
    let provider = Arc::new(
        OpenAiBackend::new(config.provider_config(api_key)).into_retrying(config.budget.timeout()),
    );

    let events = Arc::new(JsonlEventLog::new(&config.log_dir, &args.prefix));
    let accountant = Arc::new(UsageAccountant::new());
    let executors =
        Arc::new(LuaExecutorFactory::new().with_instruction_limit(config.sandbox.instruction_limit));

    info!(
        primary_model = %config.budget.primary_model,
        sub_model = %config.budget.sub_model,
        max_depth = config.budget.max_depth,
        max_calls_per_run = config.budget.max_calls_per_run,
        log_file = %events.log_path().display(),
        "Starting run tree"
    );

    let engine = Arc::new(Engine::new(
        Arc::new(config.budget),
        provider,
        executors,
        accountant.clone(),
        events.clone(),
    ));

    let outcome = engine.run(&query).await;

    if let Err(e) = events.flush().await {
        error!(error = %e, "Failed to flush the event log");
    }
    let log_file = events
        .log_path()
        .exists()
        .then(|| events.log_path().to_path_buf());
    let usage = accountant.snapshot();

    let report = match &outcome {
        Ok(value) => RunReport::Success {
            results: value.clone(),
            usage,
            log_file,
        },
        Err(e) => RunReport::Failure {
            error: e.to_string(),
            usage,
            log_file,
        },
    };
    if let Some(path) = &args.output {
        write_report(path, &report).await?;
    }

    match outcome {
        Ok(value) => {
            info!(calls = usage.calls, total_tokens = usage.total_tokens, cost = ?usage.cost, "Run tree finished");
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Err(e) => {
            error!(error = %e, fatal = e.is_fatal(), "Run tree failed");
            Err(e.into())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref()).await?;

    match cli.command {
        Commands::Run(mut args) => {
            config.apply(std::mem::take(&mut args.overrides))?;
            run(config, args).await
        }
        Commands::Config(overrides) => {
            config.apply(overrides)?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
