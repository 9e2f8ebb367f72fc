#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Behaviour of the Lua sandbox as the engine sees it.

use futures_util::FutureExt;
use rlm_core::{RlmError, RlmResult};
use rlm_sandbox::{
    CodeExecutor, ExecutionOutcome, ExecutorFactory, LuaExecutorFactory, SpawnFn,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn spawn_with<F>(f: F) -> SpawnFn
where
    F: Fn(String) -> RlmResult<Value> + Send + Sync + 'static,
{
    Arc::new(move |context| {
        let result = f(context);
        async move { result }.boxed()
    })
}

fn no_spawn() -> SpawnFn {
    spawn_with(|_| Err(RlmError::Orchestrator("spawning is not expected".into())))
}

fn executor(context: &str, spawn: SpawnFn) -> Box<dyn CodeExecutor> {
    LuaExecutorFactory::new().create(context, spawn).unwrap()
}

#[tokio::test]
async fn test_print_is_captured_in_order() {
    let mut exec = executor("", no_spawn());
    let outcome = exec
        .execute("print('a')\nprint(1, 2.5, nil)\nprint(true)")
        .await;
    match outcome {
        ExecutionOutcome::Normal {
            output,
            raised_error,
        } => {
            assert_eq!(output, "a\n1\t2.5\tnil\ntrue");
            assert!(!raised_error);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn test_context_variable_is_exposed() {
    let mut exec = executor("hello world", no_spawn());
    let outcome = exec.execute("print(#context, context:sub(1, 5))").await;
    assert_eq!(outcome.output(), "11\thello");
}

#[tokio::test]
async fn test_final_value_last_call_wins() {
    let mut exec = executor("", no_spawn());
    let outcome = exec
        .execute("FINAL('draft')\nprint('still running')\nFINAL_VAR({answer = 4})")
        .await;
    match outcome {
        ExecutionOutcome::FinalValue { output, value } => {
            assert_eq!(output, "still running");
            assert_eq!(value, json!({ "answer": 4 }));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn test_runtime_error_is_folded_into_output() {
    let mut exec = executor("", no_spawn());
    let outcome = exec.execute("print('before')\nerror('boom')").await;
    match outcome {
        ExecutionOutcome::Normal {
            output,
            raised_error,
        } => {
            assert!(raised_error);
            assert!(output.starts_with("before\nError: "));
            assert!(output.contains("boom"));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn test_syntax_error_is_folded_into_output() {
    let mut exec = executor("", no_spawn());
    let outcome = exec.execute("local = 3").await;
    assert!(outcome.has_error());
    assert!(outcome.output().contains("syntax error"));
}

#[tokio::test]
async fn test_globals_persist_but_final_value_does_not() {
    let mut exec = executor("", no_spawn());

    let first = exec.execute("counter = 41\nFINAL(counter)").await;
    assert!(matches!(first, ExecutionOutcome::FinalValue { .. }));

    let second = exec.execute("counter = counter + 1\nprint(counter)").await;
    match second {
        ExecutionOutcome::Normal { output, .. } => assert_eq!(output, "42"),
        other => panic!("final value leaked into the next step: {other:?}"),
    }
}

#[tokio::test]
async fn test_dangerous_globals_are_absent() {
    let mut exec = executor("", no_spawn());
    let outcome = exec
        .execute("print(os == nil, io == nil, require == nil, load == nil, debug == nil)")
        .await;
    assert_eq!(outcome.output(), "true\ttrue\ttrue\ttrue\ttrue");
}

#[tokio::test]
async fn test_instruction_limit_stops_runaway_loops() {
    let mut exec = LuaExecutorFactory::new()
        .with_instruction_limit(10_000)
        .create("", no_spawn())
        .unwrap();
    let outcome = exec.execute("while true do end").await;
    assert!(outcome.has_error());
    assert!(outcome.output().contains("instruction limit exceeded"));
}

#[tokio::test]
async fn test_llm_query_returns_child_value() {
    let spawn = spawn_with(|context| Ok(json!({ "echo": context, "n": 7 })));
    let mut exec = executor("", spawn);
    let outcome = exec
        .execute("local r = llm_query('part one')\nprint(r.echo)\nFINAL(r.n)")
        .await;
    match outcome {
        ExecutionOutcome::FinalValue { output, value } => {
            assert_eq!(output, "part one");
            assert_eq!(value, json!(7));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn test_null_child_value_is_nil() {
    let spawn = spawn_with(|_| Ok(Value::Null));
    let mut exec = executor("", spawn);
    let outcome = exec.execute("print(llm_query('x') == nil)").await;
    assert_eq!(outcome.output(), "true");
}

#[tokio::test]
async fn test_spawn_failure_is_an_executor_error() {
    let spawn = spawn_with(|_| {
        Err(RlmError::SpawnDepthExceeded {
            depth: 0,
            max_depth: 0,
        })
    });
    let mut exec = executor("", spawn);
    let outcome = exec
        .execute("print('start')\nlocal r = llm_query('too deep')\nprint('unreachable')")
        .await;
    match outcome {
        ExecutionOutcome::ExecutorError { output, error } => {
            assert!(output.starts_with("start\nMAX DEPTH REACHED"));
            assert!(!output.contains("unreachable"));
            assert!(matches!(error, RlmError::SpawnDepthExceeded { .. }));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn test_pcall_cannot_hide_spawn_failure() {
    let spawn = spawn_with(|_| {
        Err(RlmError::SpawnDepthExceeded {
            depth: 2,
            max_depth: 2,
        })
    });
    let mut exec = executor("", spawn);
    let outcome = exec
        .execute("local ok = pcall(llm_query, 'x')\nprint(ok)\nFINAL('done')")
        .await;
    match outcome {
        ExecutionOutcome::ExecutorError { output, .. } => {
            assert!(output.contains("MAX DEPTH REACHED"));
            assert!(output.ends_with("false"));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn test_batch_runs_members_concurrently_and_keeps_order() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let spawn: SpawnFn = {
        let in_flight = Arc::clone(&in_flight);
        let peak = Arc::clone(&peak);
        Arc::new(move |context: String| {
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(json!(context.to_uppercase()))
            }
            .boxed()
        })
    };

    let mut exec = executor("", spawn);
    let outcome = exec
        .execute("local r = llm_query_batch({'a', 'b', 'c'})\nFINAL(table.concat(r, ','))")
        .await;
    match outcome {
        ExecutionOutcome::FinalValue { value, .. } => assert_eq!(value, json!("A,B,C")),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(peak.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_batch_member_failure_waits_for_siblings() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&calls);
    let spawn = spawn_with(move |context| {
        counted.fetch_add(1, Ordering::SeqCst);
        if context == "bad" {
            Err(RlmError::StepsExhausted {
                run_id: uuid_like(),
                max_steps: 2,
            })
        } else {
            Ok(json!(context))
        }
    });

    let mut exec = executor("", spawn);
    let outcome = exec
        .execute("llm_query_batch({'good', 'bad', 'also good'})")
        .await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    match outcome {
        ExecutionOutcome::ExecutorError { error, .. } => {
            assert!(matches!(error, RlmError::StepsExhausted { .. }));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

fn uuid_like() -> uuid::Uuid {
    uuid::Uuid::nil()
}
