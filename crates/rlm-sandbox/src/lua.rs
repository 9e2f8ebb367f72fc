//! Embedded Lua sandbox.
//!
//! Generated code runs against a whitelist-only environment table: `print`,
//! the core language functions, and the `math`, `string`, and `table`
//! libraries. `os`, `io`, `debug`, `require`, `load`, and `dofile` are never
//! reachable. The environment table outlives a single execution, so globals a
//! step defines are still there on the next step.
//!
//! On top of the whitelist the environment exposes:
//!
//! - `context`: the run's full context string;
//! - `FINAL(value)` / `FINAL_VAR(value)`: mark the run's answer (last call wins);
//! - `llm_query(ctx)`: spawn one sub-agent and return its final value;
//! - `llm_query_batch({ctx, ...})`: spawn several at once and return their
//!   final values in order, after every one of them has finished.
//!
//! An instruction-count hook aborts runaway loops, and `print` writes into a
//! capture buffer instead of stdout.

use crate::executor::{CodeExecutor, ExecutionOutcome, ExecutorFactory, SpawnFn};
use async_trait::async_trait;
use futures_util::future::join_all;
use mlua::{HookTriggers, Lua, LuaSerdeExt, MultiValue, SerializeOptions, Table, Value};
use parking_lot::Mutex;
use rlm_core::{RlmError, RlmResult};
use std::sync::Arc;
use tracing::debug;

/// Lua instructions one execution may run before it is aborted.
pub const DEFAULT_INSTRUCTION_LIMIT: u32 = 50_000_000;

/// Captured output bytes kept per execution.
const MAX_OUTPUT_BYTES: usize = 1 << 20;

/// Core functions copied from the real globals into the sandbox.
const CORE_FUNCTIONS: &[&str] = &[
    "tostring",
    "tonumber",
    "type",
    "pairs",
    "ipairs",
    "next",
    "select",
    "error",
    "pcall",
    "xpcall",
    "assert",
    "rawget",
    "rawset",
    "rawlen",
    "rawequal",
    "setmetatable",
    "getmetatable",
];

const SAFE_LIBRARIES: &[&str] = &["math", "string", "table"];

/// What one execution left behind.
#[derive(Default)]
struct Capture {
    lines: Vec<String>,
    bytes: usize,
    capped: bool,
    final_value: Option<serde_json::Value>,
    spawn_failure: Option<RlmError>,
}

/// State shared between the executor and the Rust functions it registers.
#[derive(Default)]
struct SharedState {
    capture: Mutex<Capture>,
}

impl SharedState {
    fn push_line(&self, line: String) {
        let mut capture = self.capture.lock();
        capture.bytes += line.len() + 1;
        if capture.bytes <= MAX_OUTPUT_BYTES {
            capture.lines.push(line);
        } else if !capture.capped {
            capture.capped = true;
            capture
                .lines
                .push(format!("[print output capped at {MAX_OUTPUT_BYTES} bytes]"));
        }
    }

    fn set_final(&self, value: serde_json::Value) {
        self.capture.lock().final_value = Some(value);
    }

    /// Writes the failure into the output and remembers it, so that a `pcall`
    /// around the spawn cannot hide it from the engine.
    fn spawn_failed(&self, err: RlmError) -> mlua::Error {
        let message = err.to_string();
        self.push_line(message.clone());

        let mut capture = self.capture.lock();
        let replace = match &capture.spawn_failure {
            None => true,
            Some(existing) => err.is_fatal() && !existing.is_fatal(),
        };
        if replace {
            capture.spawn_failure = Some(err);
        }
        mlua::Error::RuntimeError(message)
    }

    fn take(&self) -> Capture {
        std::mem::take(&mut *self.capture.lock())
    }
}

/// A Lua sandbox owned by one run.
pub struct LuaExecutor {
    lua: Lua,
    env: Table,
    state: Arc<SharedState>,
    instruction_limit: u32,
}

impl LuaExecutor {
    /// Builds a sandbox exposing `context` and the spawn primitives.
    pub fn new(context: &str, spawn: SpawnFn, instruction_limit: u32) -> RlmResult<Self> {
        let lua = Lua::new();
        let state = Arc::new(SharedState::default());
        let env = build_env(&lua, context, spawn, Arc::clone(&state))
            .map_err(|e| RlmError::Sandbox(format_lua_error(&e)))?;

        Ok(Self {
            lua,
            env,
            state,
            instruction_limit,
        })
    }
}

#[async_trait]
impl CodeExecutor for LuaExecutor {
    async fn execute(&mut self, code: &str) -> ExecutionOutcome {
        // Drop anything a previous execution left behind.
        self.state.take();

        let limit = self.instruction_limit;
        self.lua.set_hook(
            HookTriggers::new().every_nth_instruction(limit),
            move |_lua, _debug| {
                Err(mlua::Error::RuntimeError(format!(
                    "instruction limit exceeded ({limit})"
                )))
            },
        );

        let result = self
            .lua
            .load(code)
            .set_name("=repl")
            .set_environment(self.env.clone())
            .exec_async()
            .await;

        self.lua.remove_hook();

        let capture = self.state.take();
        let mut lines = capture.lines;

        if let Some(error) = capture.spawn_failure {
            debug!(error = %error, "Spawn failed during execution");
            return ExecutionOutcome::ExecutorError {
                output: lines.join("\n"),
                error,
            };
        }

        let raised_error = match result {
            Ok(()) => false,
            Err(e) => {
                lines.push(format!("Error: {}", format_lua_error(&e)));
                true
            }
        };
        let output = lines.join("\n");

        match capture.final_value {
            Some(value) => ExecutionOutcome::FinalValue { output, value },
            None => ExecutionOutcome::Normal {
                output,
                raised_error,
            },
        }
    }
}

/// Creates one [`LuaExecutor`] per run.
#[derive(Debug, Clone)]
pub struct LuaExecutorFactory {
    instruction_limit: u32,
}

impl Default for LuaExecutorFactory {
    fn default() -> Self {
        Self {
            instruction_limit: DEFAULT_INSTRUCTION_LIMIT,
        }
    }
}

impl LuaExecutorFactory {
    /// A factory using [`DEFAULT_INSTRUCTION_LIMIT`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the per-execution instruction limit.
    pub fn with_instruction_limit(mut self, limit: u32) -> Self {
        self.instruction_limit = limit.max(1);
        self
    }
}

impl ExecutorFactory for LuaExecutorFactory {
    fn create(&self, context: &str, spawn: SpawnFn) -> RlmResult<Box<dyn CodeExecutor>> {
        Ok(Box::new(LuaExecutor::new(
            context,
            spawn,
            self.instruction_limit,
        )?))
    }
}

fn build_env(
    lua: &Lua,
    context: &str,
    spawn: SpawnFn,
    state: Arc<SharedState>,
) -> mlua::Result<Table> {
    let env = lua.create_table()?;
    let globals = lua.globals();

    for name in CORE_FUNCTIONS.iter().chain(SAFE_LIBRARIES) {
        let value: Value = globals.get(*name)?;
        if !value.is_nil() {
            env.set(*name, value)?;
        }
    }
    env.set("_G", env.clone())?;

    // --- Captured print ---
    let tostring: mlua::Function = globals.get("tostring")?;
    let print_state = Arc::clone(&state);
    let print = lua.create_function(move |_, args: MultiValue| {
        let mut parts = Vec::with_capacity(args.len());
        for arg in args {
            parts.push(tostring.call::<String>(arg)?);
        }
        print_state.push_line(parts.join("\t"));
        Ok(())
    })?;
    env.set("print", print)?;

    // --- Final-value sentinels ---
    let final_state = Arc::clone(&state);
    let final_fn = lua.create_function(move |lua, value: Value| {
        let value: serde_json::Value = lua.from_value(value)?;
        final_state.set_final(value);
        Ok(())
    })?;
    env.set("FINAL", final_fn.clone())?;
    env.set("FINAL_VAR", final_fn)?;

    // --- Spawn primitives ---
    let query_spawn = Arc::clone(&spawn);
    let query_state = Arc::clone(&state);
    let llm_query = lua.create_async_function(move |lua: Lua, context: String| {
        let spawn = Arc::clone(&query_spawn);
        let state = Arc::clone(&query_state);
        async move {
            match spawn(context).await {
                Ok(value) => json_to_lua(&lua, &value),
                Err(err) => Err(state.spawn_failed(err)),
            }
        }
    })?;
    env.set("llm_query", llm_query)?;

    let batch_state = Arc::clone(&state);
    let llm_query_batch = lua.create_async_function(move |lua: Lua, contexts: Vec<String>| {
        let spawn = Arc::clone(&spawn);
        let state = Arc::clone(&batch_state);
        async move {
            // Every member is submitted before any is awaited.
            let results = join_all(contexts.into_iter().map(|context| spawn(context))).await;

            let values = lua.create_table()?;
            let mut first_error = None;
            for (index, result) in results.into_iter().enumerate() {
                match result {
                    Ok(value) => values.raw_set(index + 1, json_to_lua(&lua, &value)?)?,
                    Err(err) => {
                        let lua_err = state.spawn_failed(err);
                        first_error.get_or_insert(lua_err);
                    }
                }
            }
            match first_error {
                Some(err) => Err(err),
                None => Ok(values),
            }
        }
    })?;
    env.set("llm_query_batch", llm_query_batch)?;

    env.set("context", context)?;

    Ok(env)
}

/// JSON `null` becomes `nil` rather than mlua's null sentinel.
fn json_to_lua(lua: &Lua, value: &serde_json::Value) -> mlua::Result<Value> {
    lua.to_value_with(
        value,
        SerializeOptions::new()
            .serialize_none_to_null(false)
            .serialize_unit_to_null(false),
    )
}

fn format_lua_error(err: &mlua::Error) -> String {
    match err {
        mlua::Error::RuntimeError(msg) => msg.clone(),
        mlua::Error::CallbackError { cause, .. } => format_lua_error(cause),
        mlua::Error::SyntaxError { message, .. } => format!("syntax error: {message}"),
        _ => err.to_string(),
    }
}
