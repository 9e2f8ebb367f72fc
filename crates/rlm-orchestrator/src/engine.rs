use crate::events::{EventSink, EventType, RunEvent};
use crate::prompt::{summarize_context, NO_CODE_CORRECTION, SYSTEM_PROMPT};
use crate::run::Run;
use crate::scheduler::{BatchScheduler, CohortObserver, MemberFn};
use crate::truncate::truncate_output;
use chrono::Utc;
use futures_util::future::{self, BoxFuture, FutureExt};
use rlm_agent::CompletionProvider;
use rlm_core::{BudgetConfig, Message, RlmError, RlmResult, UsageAccountant, UsageRecord};
use rlm_sandbox::{CodeExecutor, ExecutionOutcome, ExecutorFactory, SpawnFn};
use std::sync::{Arc, OnceLock};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// The recursive run engine.
///
/// One engine serves a whole run tree: every run, at every depth, shares its
/// configuration, provider, executor factory, usage accountant, and event
/// sink. Runs spawn children through the sandbox's `llm_query` primitives;
/// those calls come back into [`Engine::invoke`] one depth deeper, either
/// directly or through a per-run [`BatchScheduler`].
pub struct Engine {
    config: Arc<BudgetConfig>,
    provider: Arc<dyn CompletionProvider>,
    executors: Arc<dyn ExecutorFactory>,
    accountant: Arc<UsageAccountant>,
    events: Arc<dyn EventSink>,
    observer: Option<Arc<dyn CohortObserver>>,
}

/// What a single model step decided.
enum StepOutcome {
    Continue,
    Final(serde_json::Value),
}

impl Engine {
    /// Creates an engine from its collaborators.
    pub fn new(
        config: Arc<BudgetConfig>,
        provider: Arc<dyn CompletionProvider>,
        executors: Arc<dyn ExecutorFactory>,
        accountant: Arc<UsageAccountant>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            provider,
            executors,
            accountant,
            events,
            observer: None,
        }
    }

    /// Registers an observer for parallel cohorts.
    pub fn with_cohort_observer(mut self, observer: Arc<dyn CohortObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// The configuration shared by every run.
    pub fn config(&self) -> &Arc<BudgetConfig> {
        &self.config
    }

    /// The usage accountant shared by every run.
    pub fn accountant(&self) -> &Arc<UsageAccountant> {
        &self.accountant
    }

    /// The sink every run emits into.
    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    /// Runs the root of a tree on `context`.
    pub async fn run(self: &Arc<Self>, context: &str) -> RlmResult<serde_json::Value> {
        self.invoke(context.to_string(), 0, None).await
    }

    /// Runs one agent on `context` at `depth` and resolves to its final value.
    pub fn invoke(
        self: &Arc<Self>,
        context: String,
        depth: u32,
        parent_run_id: Option<Uuid>,
    ) -> BoxFuture<'static, RlmResult<serde_json::Value>> {
        self.start_run(context, depth, parent_run_id, None)
    }

    fn start_run(
        self: &Arc<Self>,
        context: String,
        depth: u32,
        parent_run_id: Option<Uuid>,
        parallel_group_id: Option<Uuid>,
    ) -> BoxFuture<'static, RlmResult<serde_json::Value>> {
        let engine = Arc::clone(self);
        async move {
            engine
                .run_loop(context, depth, parent_run_id, parallel_group_id)
                .await
        }
        .boxed()
    }

    async fn run_loop(
        self: Arc<Self>,
        context: String,
        depth: u32,
        parent_run_id: Option<Uuid>,
        parallel_group_id: Option<Uuid>,
    ) -> RlmResult<serde_json::Value> {
        let mut run = Run::new(
            parent_run_id,
            depth,
            self.config.max_calls_per_run,
            self.config.model_for_depth(depth),
            parallel_group_id,
        );

        info!(
            run_id = %run.run_id,
            parent_run_id = ?parent_run_id,
            depth,
            group_id = ?parallel_group_id,
            model = %run.model,
            context_chars = context.chars().count(),
            "Starting run"
        );

        let spawn = self.spawn_fn(&run);
        let mut executor = match self.executors.create(&context, spawn) {
            Ok(executor) => executor,
            Err(e) => {
                self.fail(&run, &e).await;
                return Err(e);
            }
        };

        // Step 0: priming summary, no model call.
        let summary = summarize_context(&context);
        let mut priming = RunEvent::new(EventType::Step, &run);
        priming.output = Some(summary.clone());
        priming.usage = Some(UsageRecord::default());
        priming.global_usage = Some(self.accountant.snapshot());
        self.emit(&priming).await;
        run.push(Message::user(summary));

        while run.step < run.max_steps {
            let step = run.advance();
            debug!(run_id = %run.run_id, depth, step, "Starting step");

            match self.step(&mut run, executor.as_mut()).await {
                Ok(StepOutcome::Final(value)) => {
                    info!(run_id = %run.run_id, depth, step, "Run finished");
                    return Ok(value);
                }
                Ok(StepOutcome::Continue) => {}
                Err(e) => {
                    self.fail(&run, &e).await;
                    return Err(e);
                }
            }
        }

        let err = RlmError::StepsExhausted {
            run_id: run.run_id,
            max_steps: run.max_steps,
        };
        self.fail(&run, &err).await;
        Err(err)
    }

    async fn step(
        &self,
        run: &mut Run,
        executor: &mut dyn CodeExecutor,
    ) -> RlmResult<StepOutcome> {
        let model_started_at = Utc::now();
        let completion = self
            .provider
            .complete(&run.model, Some(SYSTEM_PROMPT), run.transcript())
            .await?;
        let model_finished_at = Utc::now();

        self.accountant.record(&completion.usage);
        let global = self.accountant.snapshot();

        let mut event = RunEvent::new(EventType::Step, run);
        event.code = completion.code.clone();
        event.reasoning = completion.message.reasoning.clone();
        event.usage = Some(completion.usage);
        event.global_usage = Some(global);
        event.model_started_at = Some(model_started_at);
        event.model_finished_at = Some(model_finished_at);

        if let Err(breach) = global.check(&self.config) {
            event.has_error = true;
            event.error = Some(breach.to_string());
            self.emit(&event).await;
            return Err(breach);
        }

        run.push(completion.message);

        let Some(code) = completion.code else {
            debug!(run_id = %run.run_id, step = run.step, "Response contained no code");
            event.has_error = true;
            self.emit(&event).await;
            run.push(Message::user(NO_CODE_CORRECTION));
            return Ok(StepOutcome::Continue);
        };

        // Children spawned by this code must log after their parent's step.
        self.emit(&event).await;

        let mut result = RunEvent::new(EventType::ExecutionResult, run);
        result.exec_started_at = Some(Utc::now());
        let outcome = executor.execute(&code).await;
        result.exec_finished_at = Some(Utc::now());

        let shown = truncate_output(outcome.output(), self.config.truncate_len);
        result.output = Some(shown.clone());
        result.has_error = outcome.has_error();
        result.global_usage = Some(self.accountant.snapshot());

        match outcome {
            ExecutionOutcome::FinalValue { value, .. } => {
                self.emit(&result).await;

                let mut terminal = RunEvent::new(EventType::FinalResult, run);
                terminal.final_result = Some(value.clone());
                terminal.global_usage = Some(self.accountant.snapshot());
                self.emit(&terminal).await;
                Ok(StepOutcome::Final(value))
            }
            ExecutionOutcome::ExecutorError { error, .. } if error.is_fatal() => {
                result.error = Some(error.to_string());
                self.emit(&result).await;
                Err(error)
            }
            ExecutionOutcome::ExecutorError { error, .. } => {
                debug!(run_id = %run.run_id, step = run.step, error = %error, "Spawn failed");
                result.error = Some(error.to_string());
                self.emit(&result).await;
                run.push(Message::user(shown));
                Ok(StepOutcome::Continue)
            }
            ExecutionOutcome::Normal { .. } => {
                self.emit(&result).await;
                run.push(Message::user(shown));
                Ok(StepOutcome::Continue)
            }
        }
    }

    /// The spawn capability bound into `run`'s sandbox.
    ///
    /// At the deepest depth every call fails immediately, before any model
    /// call. Otherwise calls go through a lazily created batch scheduler when
    /// parallel execution is allowed, and run one at a time, in submission
    /// order, when not.
    fn spawn_fn(self: &Arc<Self>, run: &Run) -> SpawnFn {
        let engine = Arc::clone(self);
        let parent = run.run_id;
        let depth = run.depth;
        let max_depth = self.config.max_depth;
        let scheduler: OnceLock<BatchScheduler> = OnceLock::new();
        let sequential = Arc::new(Semaphore::new(1));

        Arc::new(move |context: String| {
            if depth >= max_depth {
                warn!(run_id = %parent, depth, max_depth, "Spawn refused at maximum depth");
                return future::ready(Err(RlmError::SpawnDepthExceeded { depth, max_depth }))
                    .boxed();
            }

            if engine.parallel_allowed(depth) {
                return scheduler
                    .get_or_init(|| engine.scheduler_for(parent, depth))
                    .submit(context)
                    .boxed();
            }

            let engine = Arc::clone(&engine);
            let sequential = Arc::clone(&sequential);
            async move {
                let _slot = sequential
                    .acquire_owned()
                    .await
                    .map_err(|e| RlmError::Orchestrator(e.to_string()))?;
                engine.start_run(context, depth + 1, Some(parent), None).await
            }
            .boxed()
        })
    }

    /// Parallel execution is off one level above the deepest depth and once
    /// the money budget is used up.
    fn parallel_allowed(&self, depth: u32) -> bool {
        if depth + 1 >= self.config.max_depth {
            return false;
        }
        match self.config.max_money {
            Some(limit) => self.accountant.snapshot().remaining_money(limit) > 0.0,
            None => true,
        }
    }

    fn scheduler_for(self: &Arc<Self>, parent: Uuid, depth: u32) -> BatchScheduler {
        let engine = Arc::clone(self);
        let member: MemberFn = Arc::new(move |context, group_id| {
            engine.start_run(context, depth + 1, Some(parent), group_id)
        });
        BatchScheduler::new(
            self.config.batch_window(),
            self.config.max_parallel_children,
            member,
            self.observer.clone(),
        )
    }

    async fn fail(&self, run: &Run, err: &RlmError) {
        if err.is_fatal() {
            error!(run_id = %run.run_id, depth = run.depth, step = run.step, error = %err, "Run aborted");
        } else {
            warn!(run_id = %run.run_id, depth = run.depth, step = run.step, error = %err, "Run failed");
        }

        let mut event = RunEvent::new(EventType::RunFailed, run);
        event.error = Some(err.to_string());
        event.global_usage = Some(self.accountant.snapshot());
        self.emit(&event).await;
    }

    /// A sink failure is logged and never fails the run.
    async fn emit(&self, event: &RunEvent) {
        if let Err(e) = self.events.emit(event).await {
            warn!(run_id = %event.run_id, step = event.step, error = %e, "Failed to write run event");
        }
    }
}
