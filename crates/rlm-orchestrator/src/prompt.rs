//! Fixed prompt text and the step-0 context summary.

/// Characters of the context shown at each end of the priming summary.
pub const PREVIEW_CHARS: usize = 500;

/// System prompt sent with every completion request.
pub const SYSTEM_PROMPT: &str = r#"You are a recursive reasoning agent working inside a Lua REPL.

The full input you must work on is stored in the variable `context`. You only
see a short summary of it. Explore it by writing Lua code in a fenced block
tagged `repl`:

```repl
print(#context)
print(context:sub(1, 200))
```

Everything the code prints is shown back to you on the next turn; long output
is cut to its last characters. Globals you define persist between turns.

Available functions:
- print(...)                  show values on the next turn
- llm_query(ctx)              hand `ctx` (a string) to a sub-agent and return its answer
- llm_query_batch({ctx, ...}) run several sub-agents at once; returns their answers in order
- FINAL(value)                finish with `value` as your answer
- FINAL_VAR(value)            same as FINAL

Split large inputs into chunks and delegate them with llm_query or
llm_query_batch. Sub-agent answers come back as Lua values, not text in your
transcript. If a call reports MAX DEPTH REACHED, solve that part yourself.
Call FINAL exactly when you are sure of the answer."#;

/// Appended when a response contains no runnable code block.
pub const NO_CODE_CORRECTION: &str = "Your last response contained no ```repl code block, so nothing was executed. \
Reply with Lua code inside a ```repl block, and call FINAL(value) once you have the answer.";

/// Deterministic summary of the context used as the first transcript message.
pub fn summarize_context(context: &str) -> String {
    let len = context.chars().count();
    let lines = context.lines().count();

    if len <= PREVIEW_CHARS * 2 {
        return format!(
            "Your context is a string of {len} characters ({lines} lines).\n\
             Full content:\n{context}"
        );
    }

    let head: String = context.chars().take(PREVIEW_CHARS).collect();
    let tail: String = context.chars().skip(len - PREVIEW_CHARS).collect();
    format!(
        "Your context is a string of {len} characters ({lines} lines).\n\
         First {PREVIEW_CHARS} characters:\n{head}\n...\n\
         Last {PREVIEW_CHARS} characters:\n{tail}"
    )
}
